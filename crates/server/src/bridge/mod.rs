// crates/server/src/bridge/mod.rs
//! Subprocess bridge: one spawned agent process per live session, translated
//! between its stream-JSON protocol and the normalized message model.

pub mod manager;
pub mod protocol;
pub mod session;
pub mod state;

pub use manager::{BridgeConfig, BridgeError, BridgeManager};
pub use session::Bridge;
pub use state::{BridgeEvent, BridgeStatus, LiveSessionInfo, NormalizedMessage, PendingPermission};
