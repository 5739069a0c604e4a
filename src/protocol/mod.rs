//! Wire and event types shared across the multiplexer

pub mod messages;

pub use messages::*;
