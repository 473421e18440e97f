//! Event system for Codemend.
//!
//! This crate provides the event bus, the typed progress events emitted
//! by the orchestration core, and the narrow notification sink consumed
//! by host UIs.

mod bus;
mod notify;
mod types;

pub use bus::EventBus;
pub use notify::{EventBusNotifier, LogNotifier, Notifier, NullNotifier};
pub use types::*;
