//! Transfer pipeline: adaptive chunk sizing, per-peer delivery tasks,
//! watermark progress and receive-side reassembly.

pub mod chunk_size;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use chunk_size::ChunkSizer;
pub use progress::{DeliveryStatus, PeerDelivery, Rate, SpeedMeter, Watermark};
pub use receiver::{Appended, ReceiveBuffer};
