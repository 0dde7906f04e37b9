pub mod code;
pub mod coordinator;
pub mod status;

pub use code::{generate_room_code, normalize_room_code, rendezvous_id};
pub use coordinator::RoomCoordinator;
pub use status::{ConnectionStatus, RoomState};
