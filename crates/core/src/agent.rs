mod builder;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use kaiwa_model::{ModelFinishReason, ModelRequest, ModelTool};

use crate::conversation::{Conversation, Item};
use crate::error::Error;
use crate::model_client::ModelClient;
use crate::tool::Executor as ToolExecutor;
pub use builder::AgentBuilder;

/// An agent: a model provider, a system prompt and a set of tools.
///
/// The agent holds no conversation state. Every call works on the
/// [`Conversation`] it is given, so one agent can serve any number of
/// conversations at the same time.
pub struct Agent {
    model_client: ModelClient,
    tool_executor: ToolExecutor,
    system_prompt: Option<String>,
    max_steps: usize,
}

impl Agent {
    fn from_builder(builder: AgentBuilder) -> Self {
        let AgentBuilder {
            model_client,
            system_prompt,
            tools,
            max_steps,
            retry_policy,
        } = builder;

        Self {
            model_client: model_client.with_retry_policy(retry_policy),
            tool_executor: ToolExecutor::with_tools(tools),
            system_prompt,
            max_steps,
        }
    }

    /// Answers one user input in a fresh conversation and returns the whole
    /// conversation, tool traffic included.
    pub async fn invoke<S: Into<String>>(
        &self,
        input: S,
    ) -> Result<Conversation, Error> {
        let mut conversation = Conversation::new();
        self.run_turn(&mut conversation, input, |_| {}).await?;
        Ok(conversation)
    }

    /// Appends a user input to `conversation` and runs the model until it
    /// answers without requesting tools. Returns the final assistant text.
    ///
    /// `on_transcript` receives assistant text deltas as they stream in,
    /// across all model calls of the turn.
    ///
    /// On error, `conversation` may hold a partial turn. Callers that need
    /// all-or-nothing semantics should work on a copy.
    pub async fn run_turn<S: Into<String>>(
        &self,
        conversation: &mut Conversation,
        input: S,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<String, Error> {
        let on_transcript = Arc::new(on_transcript);
        let tools = self.tool_executor.definitions();

        conversation.push(Item::user(input.into()));

        for step in 0..self.max_steps {
            debug!("model call {} of at most {}", step + 1, self.max_steps);
            let req = ModelRequest {
                system: self.system_prompt.clone(),
                messages: conversation.messages(),
                tools: tools.clone(),
            };
            let on_transcript = Arc::clone(&on_transcript);
            let resp = self
                .model_client
                .send_request(req, move |delta| on_transcript(delta))
                .await
                .map_err(Error::Model)?;

            if resp.finish_reason == Some(ModelFinishReason::Length) {
                warn!("the model hit its output token limit");
            }

            let tool_calls = resp.tool_calls;
            conversation.push(Item::assistant(
                resp.transcript.clone(),
                resp.opaque_msg,
                tool_calls.clone(),
            ));
            if tool_calls.is_empty() {
                return Ok(resp.transcript);
            }

            let results = self.tool_executor.execute_all(&tool_calls).await;
            for result in results {
                conversation.push(Item::tool_result(result));
            }
        }

        warn!("giving up after {} model calls", self.max_steps);
        Err(Error::TooManySteps(self.max_steps))
    }

    /// Returns the definitions of the registered tools, sorted by name.
    #[inline]
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tool_executor.definitions()
    }
}
