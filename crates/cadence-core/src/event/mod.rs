//! Event bus for engine lifecycle notifications.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel. This is the push
//! counterpart to polling `get_instance`.

pub mod bus;

pub use bus::EventBus;
