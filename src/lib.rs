// Shared components
pub mod config;
pub mod error;
pub mod metrics;

// Broadcast core
pub mod broadcast;
pub mod connection_manager;
pub mod session;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
