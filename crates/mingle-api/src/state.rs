use std::sync::Arc;

use mingle_chat::ChatService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: ChatService,
    pub jwt_secret: String,
}
