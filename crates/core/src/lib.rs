//! Core logic: conversations, the agent loop, tool execution and the
//! per-thread chat service.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod chat;
pub mod checkpoint;
pub mod conversation;
mod error;
mod model_client;
pub mod tool;

pub use agent::{Agent, AgentBuilder};
pub use error::Error;
pub use model_client::RetryPolicy;
