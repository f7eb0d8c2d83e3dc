//! Tools the model can call.

mod error;
mod executor;

use std::pin::Pin;

use kaiwa_model::ModelTool;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::{Error, ErrorKind};
pub(crate) use executor::Executor;

/// The result of a tool call.
pub type ToolResult = Result<String, Error>;

/// A tool that can be called by the model.
///
/// Implementations should be stateless. Anything a call needs besides its
/// input (an API endpoint, a base directory) belongs to the tool value and
/// is copied into the returned future.
pub trait Tool: Send + Sync + 'static {
    /// The input the tool accepts; the model's arguments are decoded into it.
    type Input: DeserializeOwned;

    /// Returns the name of the tool, unique within one agent.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the JSON schema of [`Tool::Input`].
    fn parameter_schema(&self) -> &Value;

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}

pub(crate) trait ToolObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn definition(&self) -> ModelTool;

    fn execute(
        &self,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send>>;
}

pub(crate) struct AnyTool<T: Tool>(pub T);

impl<T: Tool> ToolObject for AnyTool<T> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    fn definition(&self) -> ModelTool {
        ModelTool {
            name: self.0.name().to_owned(),
            description: self.0.description().to_owned(),
            parameters: self.0.parameter_schema().clone(),
        }
    }

    fn execute(
        &self,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send>> {
        let input: T::Input = match serde_json::from_value(arguments) {
            Ok(input) => input,
            Err(err) => {
                return Box::pin(std::future::ready(Err(
                    Error::invalid_input().with_reason(err.to_string()),
                )));
            }
        };
        Box::pin(self.0.execute(input))
    }
}
