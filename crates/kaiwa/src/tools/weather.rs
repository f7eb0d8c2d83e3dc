use kaiwa_core::tool::{Tool, ToolResult};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;

/// Input of [`WeatherTool`].
#[derive(Deserialize, JsonSchema)]
pub struct WeatherToolParameters {
    #[schemars(description = "Name of the city, in any language.")]
    city: String,
}

/// A tool that reports the weather of a city.
///
/// The forecast is canned: it is always sunny.
pub struct WeatherTool {
    parameter_schema: Value,
}

impl WeatherTool {
    /// Creates a new weather tool.
    #[inline]
    pub fn new() -> Self {
        WeatherTool {
            parameter_schema: schema_for!(WeatherToolParameters).to_value(),
        }
    }
}

impl Default for WeatherTool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for WeatherTool {
    type Input = WeatherToolParameters;

    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get weather for a given city."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: WeatherToolParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(Ok(format!("It's always sunny in {}!", input.city)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forecast() {
        let tool = WeatherTool::new();
        let result = tool
            .execute(WeatherToolParameters {
                city: "東京".to_owned(),
            })
            .await;
        assert_eq!(result.unwrap(), "It's always sunny in 東京!");
    }

    #[test]
    fn test_schema_requires_city() {
        let tool = WeatherTool::new();
        let schema = tool.parameter_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["type"], "string");
        assert_eq!(schema["required"][0], "city");
    }
}
