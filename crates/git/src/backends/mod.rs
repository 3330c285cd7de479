//! Git backend implementations.

pub mod cli;
