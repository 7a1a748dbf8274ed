//! Shared utility modules used across irindex components.

pub mod budget;
pub mod varint;
