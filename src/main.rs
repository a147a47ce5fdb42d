use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use futures::{stream, StreamExt};
use tracing::{info, warn};

use chainloom_core::delta::{merge, MessageDelta};
use chainloom_core::finalize::{finalize, finalize_cancelled};
use chainloom_core::messages::Message;
use chainloom_core::settings::{load_settings_from_path, ChainSettings};
use chainloom_core::usage::add_usage;
use chainloom_llm::{
    deltas_from_bytes, AnthropicEventTransformer, ModelOutput, OpenAiChunkTransformer, PayloadTransformer,
};
use chainloom_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "chainloom", version, about = "Chat model stream tooling")]
struct Cli {
    /// Settings file (JSON). Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a captured binary event stream and print the messages it carries.
    Decode {
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = Format::Anthropic)]
        format: Format,

        /// Feed the capture in chunks of this many bytes.
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Anthropic,
    Openai,
}

impl Format {
    fn transformer(self) -> Arc<dyn PayloadTransformer> {
        match self {
            Self::Anthropic => Arc::new(AnthropicEventTransformer),
            Self::Openai => Arc::new(OpenAiChunkTransformer),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ChainSettings::default(),
    };
    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    let telemetry = TelemetryConfig {
        json: !cli.pretty,
        ..TelemetryConfig::default()
    }
    .with_level_name(level);
    let _guard = init_telemetry(telemetry);

    match cli.command {
        Command::Decode {
            file,
            format,
            chunk_size,
        } => {
            let messages = decode(&file, format, chunk_size).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
    }
    Ok(())
}

async fn decode(file: &Path, format: Format, chunk_size: usize) -> Result<Vec<Message>> {
    if chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    info!(path = %file.display(), bytes = raw.len(), ?format, "decoding capture");

    let chunks: Vec<Result<Bytes, std::io::Error>> = raw
        .chunks(chunk_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let mut outputs = deltas_from_bytes(stream::iter(chunks), format.transformer());

    let mut messages: Vec<Message> = Vec::new();
    let mut delta: Option<MessageDelta> = None;
    while let Some(output) = outputs.next().await {
        match output.context("provider stream failed")? {
            ModelOutput::Message(message) => messages.push(message),
            ModelOutput::Delta(fragment) => {
                let merged = merge(delta.take(), fragment);
                if merged.is_terminal() {
                    messages.push(finalize(merged)?);
                } else {
                    delta = Some(merged);
                }
            }
            ModelOutput::Usage(usage) => match (delta.as_mut(), messages.last_mut()) {
                (Some(d), _) => d.metadata.usage = add_usage(d.metadata.usage.take(), Some(usage)),
                (None, Some(m)) => m.metadata.usage = add_usage(m.metadata.usage.take(), Some(usage)),
                (None, None) => delta = Some(MessageDelta::usage(usage)),
            },
        }
    }

    if let Some(pending) = delta {
        warn!("capture ended before the message completed");
        messages.push(finalize_cancelled(pending));
    }
    info!(messages = messages.len(), "decode finished");
    Ok(messages)
}
