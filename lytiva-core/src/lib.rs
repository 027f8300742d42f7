//! Lytiva MQTT bridge.
//!
//! Discovers Lytiva nodes from retained discovery configs, keeps one shadow
//! per device, folds LYT status traffic into shadow state and turns host
//! intents into device commands.

pub mod codec;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod router;
pub mod shadow;
pub mod state;
pub mod template;
pub mod transport;
