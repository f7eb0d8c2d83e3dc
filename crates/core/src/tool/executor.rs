use std::collections::HashMap;

use futures_util::future::join_all;
use kaiwa_model::{ModelTool, ToolCallRequest, ToolCallResult};
use tracing::Instrument;

use crate::tool::{Error, ToolObject};

/// An executor that handles tool call requests from the model.
pub struct Executor {
    tools: HashMap<String, Box<dyn ToolObject>>,
}

impl Executor {
    pub fn with_tools(tools: Vec<Box<dyn ToolObject>>) -> Self {
        let mut tool_map = HashMap::with_capacity(tools.len());
        for tool in tools {
            let name = tool.name().to_owned();
            if tool_map.insert(name.clone(), tool).is_some() {
                warn!("tool registered twice, keeping the last one: {name}");
            }
        }
        Self { tools: tool_map }
    }

    /// Returns the tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ModelTool> {
        let mut definitions: Vec<_> =
            self.tools.values().map(|tool| tool.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Runs all requests concurrently and returns their results in request
    /// order.
    pub async fn execute_all(
        &self,
        requests: &[ToolCallRequest],
    ) -> Vec<ToolCallResult> {
        let futures = requests.iter().map(|req| {
            let tool = self.tools.get(&req.name);
            let fut = tool.map(|tool| {
                trace!("spawning a tool ({}) with args: {:?}", req.id, req.arguments);
                tool.execute(req.arguments.clone())
            });
            let id = req.id.clone();
            let name = req.name.clone();
            async move {
                let result = match fut {
                    Some(fut) => fut.await,
                    None => {
                        warn!("tool not found: {name}");
                        Err(Error::not_found()
                            .with_reason(format!("no tool named `{name}`")))
                    }
                };
                match result {
                    Ok(content) => ToolCallResult {
                        id,
                        name,
                        content,
                        is_error: false,
                    },
                    Err(err) => {
                        debug!("tool call failed: {err}");
                        ToolCallResult {
                            id,
                            name,
                            content: err.reason().into_owned(),
                            is_error: true,
                        }
                    }
                }
            }
            .instrument(debug_span!("tool call", tool = %req.name))
        });
        join_all(futures).await
    }
}
