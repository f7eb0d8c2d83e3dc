//! A set of built-in tools that models can use.

mod weather;

pub use weather::WeatherTool;
