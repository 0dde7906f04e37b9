pub mod channel;
pub mod loopback;
pub mod manager;
pub mod reconnect;
pub mod session;

pub use channel::{ChannelEvent, ChannelHandle, ChannelState, PeerChannel, Transport};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::{ConnectionManager, SessionEvent};
pub use reconnect::ReconnectPolicy;
pub use session::{Direction, PeerSession, ReadySession, SessionRegistry, SessionState};
