use std::sync::Arc;

use super::config::StorageBackend;
use crate::chat::delegates::MessagingService;

/// Shared by every route; cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub messaging: Arc<MessagingService>,
    pub storage: StorageBackend,
}
