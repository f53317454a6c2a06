//! Replay cache backend implementations

pub mod file;
pub mod mem;
