//! Transport seam: an ordered, reliable, message-oriented channel to a
//! named endpoint, plus the dial/listen surface that produces them.
//!
//! Implementations push lifecycle and data events into the unbounded
//! receiver bundled in [`ChannelHandle`]; the session driver is the only
//! consumer.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(String),
    /// Transient transport trouble; the owner may try `restart()`.
    Degraded,
    Error(String),
    Closed,
}

#[async_trait]
pub trait PeerChannel: Send + Sync + fmt::Debug {
    /// Identifier of the remote endpoint.
    fn endpoint_id(&self) -> &str;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Bytes queued locally but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Health hook: try to recover the underlying transport in place.
    async fn restart(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// A channel together with its event stream.
pub struct ChannelHandle {
    pub channel: Arc<dyn PeerChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier other endpoints see for channels dialed from here.
    fn local_id(&self) -> &str;

    async fn dial(&self, endpoint_id: &str) -> Result<ChannelHandle, TransportError>;

    /// Accept channels dialed to `endpoint_id`.
    async fn listen(
        &self,
        endpoint_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelHandle>, TransportError>;

    async fn stop_listening(&self, endpoint_id: &str);
}
