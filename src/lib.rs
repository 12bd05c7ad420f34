//! Session-lifecycle core of a voice-room community bot: ephemeral rooms,
//! leadership and presence intervals, and replicated persistence.

pub mod clock;
pub mod config;
pub mod dao;
pub mod error;
pub mod platform;
pub mod runtime;
pub mod services;
pub mod state;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
