pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod protocol;
pub mod quality;
pub mod room;
pub mod security;
pub mod transfer;
