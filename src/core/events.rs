//! Events published to whoever drives a room (CLI, UI, tests).

use uuid::Uuid;

use crate::core::quality::QualitySample;
use crate::core::room::ConnectionStatus;
use crate::core::transfer::TransferRecord;

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Status(ConnectionStatus),
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
        error: Option<String>,
    },
    /// The host announced that someone else joined the room.
    JoinAnnounced {
        via: String,
    },
    TextReceived {
        peer_id: String,
        item_id: Uuid,
        text: String,
    },
    Transfer(TransferRecord),
    Quality(QualitySample),
}
