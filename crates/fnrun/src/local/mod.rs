//! # Local engine
//!
//! An [`Engine`](crate::engine::Engine) that runs everything in this process.
//! It is the default engine of a runtime and the one the test suite observes.

pub mod engine;

pub use engine::LocalEngine;
