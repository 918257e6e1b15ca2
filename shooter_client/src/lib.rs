//! `shooter_client`
//!
//! Client-side systems:
//! - Connection management and frame decoding (`client`)
//! - Input sampling into per-tick `InputPacket`s (`input`)
//! - Mirror of replicated objects with interpolation (`world`)

pub mod client;
pub mod input;
pub mod world;

pub use client::GameClient;
pub use world::ClientWorld;
