//! peerdrop: end-to-end encrypted text and file rooms over peer channels.
//!
//! Start from [`core::room::RoomCoordinator`]; the transport is injected
//! through [`core::connection::Transport`].

pub mod core;
pub mod utils;
