mod settings;

pub use settings::{BroadcastConfig, ServerConfig, Settings, ShutdownSettings, WebSocketConfig};
