use std::sync::Arc;
use std::time::Instant;

use crate::broadcast::Broadcaster;
use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub broadcaster: Arc<Broadcaster>,
    pub start_time: Instant,
}

impl AppState {
    /// Starts the broadcaster, so this must run inside a Tokio runtime
    pub fn new(settings: Settings) -> Self {
        let broadcaster = Arc::new(Broadcaster::start(&settings));
        Self::with_broadcaster(settings, broadcaster)
    }

    pub fn with_broadcaster(settings: Settings, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            settings: Arc::new(settings),
            broadcaster,
            start_time: Instant::now(),
        }
    }
}
