//! Outbound message bus seam.
//!
//! The gateway publishes fire-and-forget indications (status snapshots,
//! events) to named endpoints of the surrounding backend. The transport is
//! deployment specific, so only the trait lives here.

use serde_json::Value;

/// Fire-and-forget delivery of a named message to a backend endpoint
pub trait IpcBus {
    fn indication(&self, endpoint: &str, name: &str, payload: Value);
}

/// Bus that writes every indication to the log, used when the gateway runs
/// without a backend attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBus;

impl IpcBus for LoggingBus {
    fn indication(&self, endpoint: &str, name: &str, payload: Value) {
        log::info!("Indication {} -> {}: {}", name, endpoint, payload);
    }
}
