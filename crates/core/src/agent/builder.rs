use kaiwa_model::ModelProvider;

use super::Agent;
use crate::model_client::{ModelClient, RetryPolicy};
use crate::tool::{AnyTool, Tool, ToolObject};

/// Model calls allowed in one turn unless configured otherwise.
const DEFAULT_MAX_STEPS: usize = 8;

/// [`Agent`] builder.
pub struct AgentBuilder {
    pub(crate) model_client: ModelClient,
    pub(crate) system_prompt: Option<String>,
    pub(crate) tools: Vec<Box<dyn ToolObject>>,
    pub(crate) max_steps: usize,
    pub(crate) retry_policy: RetryPolicy,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            system_prompt: None,
            tools: vec![],
            max_steps: DEFAULT_MAX_STEPS,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sets the system prompt sent with every model call.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.tools.push(Box::new(AnyTool(tool)));
        self
    }

    /// Limits the model calls in one turn. Values below 1 are raised to 1.
    #[inline]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Sets how failed model requests are retried.
    #[inline]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Builds the agent.
    #[inline]
    pub fn build(self) -> Agent {
        Agent::from_builder(self)
    }
}
