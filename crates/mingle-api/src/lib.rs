pub mod error;
pub mod groups;
pub mod inbox;
pub mod messages;
pub mod middleware;
pub mod state;
pub mod users;
