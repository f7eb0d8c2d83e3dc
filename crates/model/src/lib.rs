//! A provider-neutral protocol for talking to hosted LLMs.
//!
//! Everything above this crate (the agent loop, the chat service, the
//! binaries) only sees the types defined here, so a provider can be swapped
//! for another one, or for a scripted fake in tests, without touching the
//! rest of the workspace.
//!
//! Types in this crate don't define any behavior. They are the contract
//! that provider implementations have to honor.

#![deny(missing_docs)]

mod error;
mod opaque;
mod provider;
mod request;
mod response;

pub use error::*;
pub use opaque::*;
pub use provider::*;
pub use request::*;
pub use response::*;
