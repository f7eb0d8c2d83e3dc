//! A Gemini-backed assistant: one-shot tool-using answers and a multi-turn
//! chat web page.
//!
//! The crate ships a CLI, `kaiwa`, with an `ask` and a `serve` command. The
//! pieces behind it are usable as a library as well.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod tools;
pub mod web;

/// Re-exports of [`kaiwa_core`] crate.
pub mod core {
    pub use kaiwa_core::*;
}
