//! The `kaiwa` command line tool.

#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use kaiwa::tools::WeatherTool;
use kaiwa_core::chat::ChatService;
use kaiwa_core::checkpoint::MemoryCheckpointer;
use kaiwa_core::conversation::{Conversation, TranscriptSource};
use kaiwa_core::{AgentBuilder, RetryPolicy};
use kaiwa_gemini_model::{GeminiConfigBuilder, GeminiProvider};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_PROMPT: &str = "東京の天気はなんですか？";
const ASK_SYSTEM_PROMPT: &str = "You are a helpful assistant";
const BAR_CHAR: &str = "▎";

#[derive(Parser)]
#[command(name = "kaiwa", version, about = "Talk to Gemini from the terminal or the browser")]
struct Cli {
    #[command(flatten)]
    model: ModelArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Gemini API key; sent as is, even when empty.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Model name.
    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.0-flash", global = true)]
    model: String,

    /// API base URL, up to and including the version segment.
    #[arg(long, env = "GEMINI_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Sampling temperature.
    #[arg(long, env = "KAIWA_TEMPERATURE", default_value_t = 0.7, global = true)]
    temperature: f32,

    /// Retries for rate limited or unavailable model requests.
    #[arg(long, env = "KAIWA_MAX_RETRIES", default_value_t = 3, global = true)]
    max_retries: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Ask one question, letting the model use the weather tool.
    Ask {
        /// The question.
        #[arg(default_value = DEFAULT_PROMPT)]
        prompt: String,

        /// Print the conversation as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Serve the chat web page.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8501")]
        listen: SocketAddr,

        /// System prompt for every conversation.
        #[arg(long)]
        system_prompt: Option<String>,
    },
}

impl ModelArgs {
    fn provider(&self) -> GeminiProvider {
        let api_key = self.api_key.clone().unwrap_or_else(|| {
            warn!("GEMINI_API_KEY is not set, requests will likely be rejected");
            String::new()
        });
        let mut config = GeminiConfigBuilder::with_api_key(api_key)
            .with_model(&self.model)
            .with_temperature(self.temperature);
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url);
        }
        GeminiProvider::new(config.build())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("failed to load .env");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask { prompt, json } => ask(&cli.model, prompt, json).await,
        Command::Serve {
            listen,
            system_prompt,
        } => serve(&cli.model, listen, system_prompt).await,
    }
}

async fn ask(
    model: &ModelArgs,
    prompt: String,
    json: bool,
) -> anyhow::Result<()> {
    let agent = AgentBuilder::with_model_provider(model.provider())
        .with_system_prompt(ASK_SYSTEM_PROMPT)
        .with_tool(WeatherTool::new())
        .with_retry_policy(model.retry_policy())
        .build();

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(
        ProgressStyle::with_template("{spinner} {wide_msg}")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    progress_bar.set_message("考え中...");
    progress_bar.enable_steady_tick(Duration::from_millis(100));

    let result = agent.invoke(prompt).await;
    progress_bar.finish_and_clear();
    let conversation = result.context("the agent run failed")?;

    if json {
        let turns = serde_json::to_string_pretty(&conversation.turns())?;
        println!("{turns}");
    } else {
        print_conversation(&conversation);
    }
    Ok(())
}

fn print_conversation(conversation: &Conversation) {
    for item in conversation.items() {
        match item.source() {
            TranscriptSource::User => {
                println!("{}🧑 {}", BAR_CHAR.bright_green(), item.transcript());
            }
            TranscriptSource::Assistant => {
                if !item.transcript().is_empty() {
                    println!(
                        "{}🤖 {}",
                        BAR_CHAR.bright_cyan(),
                        item.transcript().bright_white()
                    );
                }
                for call in item.tool_calls() {
                    println!(
                        "{}🔧 {} {}",
                        BAR_CHAR.bright_yellow(),
                        call.name.bold(),
                        call.arguments
                    );
                }
            }
            TranscriptSource::Tool => {
                println!(
                    "{}📦 {}: {}",
                    BAR_CHAR.bright_black(),
                    item.tool_name().unwrap_or("tool"),
                    item.transcript().dimmed()
                );
            }
        }
    }
}

async fn serve(
    model: &ModelArgs,
    listen: SocketAddr,
    system_prompt: Option<String>,
) -> anyhow::Result<()> {
    let mut agent = AgentBuilder::with_model_provider(model.provider())
        .with_retry_policy(model.retry_policy());
    if let Some(system_prompt) = system_prompt {
        agent = agent.with_system_prompt(system_prompt);
    }
    let chat = ChatService::new(
        Arc::new(agent.build()),
        Arc::new(MemoryCheckpointer::new()),
    );
    let app = kaiwa::web::router(Arc::new(chat));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await?;
    Ok(())
}
