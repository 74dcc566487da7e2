pub mod inbox;
pub mod profiles;
pub mod service;

pub use profiles::{HttpProfileDirectory, ProfileDirectory, StaticProfileDirectory};
pub use service::ChatService;
