//! Client protocol: wire types, event fan-out and command dispatch

pub mod broadcast;
pub mod dispatch;
pub mod types;

pub use broadcast::EventBroadcaster;
pub use dispatch::Dispatcher;
pub use types::{normalize_page, ClientCommand, MessageMetadata, ServerEvent};
