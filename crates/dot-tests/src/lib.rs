//! # dot-tests
//!
//! Integration tests for the dot-host node.
//!
//! This crate provides end-to-end coverage of the sync engine against
//! in-memory collaborators:
//! - Bootstrap runs from genesis to the network target
//! - Tip-mode announce handling: chain, fork and stale announces
//! - Recovery behaviors: short responses, bad-block delivery, pool starvation

pub mod generators;
pub mod harness;


pub use generators::*;
pub use harness::*;
