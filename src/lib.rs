//! PairWave presence & signaling multiplexer
//!
//! Maintains one refcounted realtime channel per friend pair and multiplexes
//! three logical consumers over it: presence (online/away/offline), typing
//! indicators, and call-offer signaling. The hosted backend's realtime SDK
//! sits behind the [`transport::RealtimeTransport`] seam; this crate owns
//! subscription lifetimes, state reconciliation, and cleanup.

pub mod config;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{MuxError, TransportError};
pub use mux::{PresenceRecord, SessionEvent};
pub use protocol::{
    CallOffer, ChannelEvent, ChannelStatus, PresenceMeta, PresenceStatus, RejectReason, RoomKey,
    SignalMessage,
};
pub use registry::{ChannelGrant, ChannelRegistry, LifecycleEvent};
pub use session::PresenceSession;
pub use transport::{RealtimeTransport, TransportHandle};
