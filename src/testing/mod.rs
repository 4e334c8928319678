//! Testing utilities and mock implementations
//!
//! Lets the agent, supervisor and direct client run without a broker.

pub mod mocks;

pub use mocks::*;
