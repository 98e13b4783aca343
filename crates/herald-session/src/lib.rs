//! Connection session lifecycle for the herald runtime.
//!
//! Owns the single external protocol session: the
//! DISCONNECTED/CONNECTING/OPEN/CLOSED state machine, the reconnect driver,
//! the credential store, and the transport contracts the rest of the runtime
//! talks to.

pub mod connection_manager;
pub mod credential_store;
pub mod gateway_connector;
pub mod session_state;
pub mod session_transport;

pub use connection_manager::*;
pub use credential_store::*;
pub use gateway_connector::*;
pub use session_state::*;
pub use session_transport::*;
