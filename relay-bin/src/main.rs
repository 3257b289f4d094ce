use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use relay_core::{
    config::RelayConfig,
    http_client::Upstream,
    model::{RelayMode, Usage},
    relay::{RelayRequest, relay_non_stream},
    sink::{BufferedResponse, SseWriter},
    stream::relay_stream_with_capacity,
    upstream::{UpstreamBody, UpstreamResponse},
    usage::{TiktokenCounter, TokenCounter},
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Relay an OpenAI-compatible response to stdout",
    long_about = None
)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Chat,
    Completions,
}

impl From<Mode> for RelayMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Chat => RelayMode::ChatCompletions,
            Mode::Completions => RelayMode::Completions,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat completion request and relay the answer
    Chat {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        stream: bool,
    },
    /// Send a legacy completion request and relay the answer
    Complete {
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, help = "Prompt text")]
        prompt: String,
        #[arg(long)]
        stream: bool,
    },
    /// Relay a captured upstream response body from disk
    Replay {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long, value_enum, default_value = "chat")]
        mode: Mode,
        #[arg(long)]
        stream: bool,
        #[arg(long, default_value_t = 200)]
        status: u16,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 0)]
        prompt_tokens: u32,
    },
}

struct Call {
    mode: RelayMode,
    model: String,
    prompt_tokens: u32,
    stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => RelayConfig::from_path(path)?,
        None => RelayConfig::default(),
    };
    let counter = TiktokenCounter;

    let (call, resp) = match cli.command {
        Commands::Chat { model, message, stream } => {
            let model = model.unwrap_or_else(|| cfg.relay.default_model.clone());
            let prompt_tokens = counter.count_text(&message, &model);
            let body = json!({
                "model": model,
                "messages": [{"role": "user", "content": message}],
                "stream": stream,
            });
            let upstream = Upstream::from_cfg(&cfg.upstream, &cfg.http)?;
            let resp = upstream.send(RelayMode::ChatCompletions, &body).await?;
            (Call { mode: RelayMode::ChatCompletions, model, prompt_tokens, stream }, resp)
        }
        Commands::Complete { model, prompt, stream } => {
            let model = model.unwrap_or_else(|| cfg.relay.default_model.clone());
            let prompt_tokens = counter.count_text(&prompt, &model);
            let body = json!({ "model": model, "prompt": prompt, "stream": stream });
            let upstream = Upstream::from_cfg(&cfg.upstream, &cfg.http)?;
            let resp = upstream.send(RelayMode::Completions, &body).await?;
            (Call { mode: RelayMode::Completions, model, prompt_tokens, stream }, resp)
        }
        Commands::Replay { file, mode, stream, status, model, prompt_tokens } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let status = http::StatusCode::from_u16(status).context("invalid --status")?;
            let resp = UpstreamResponse::new(
                status,
                http::HeaderMap::new(),
                UpstreamBody::from_bytes(bytes),
            );
            let model = model.unwrap_or_else(|| cfg.relay.default_model.clone());
            (Call { mode: mode.into(), model, prompt_tokens, stream }, resp)
        }
    };

    // Error responses come back as a JSON envelope even when a stream was requested.
    let usage = if call.stream && resp.status.is_success() {
        let mut sink = SseWriter::new(tokio::io::stdout());
        let out = relay_stream_with_capacity(
            &mut sink,
            resp.body,
            call.mode,
            cfg.relay.channel_capacity,
        )
        .await?;
        let completion = counter.count_text(&out.text, &call.model);
        eprintln!("[events: {}]", out.events);
        Usage::new(call.prompt_tokens, completion)
    } else {
        let mut out = BufferedResponse::default();
        let req = RelayRequest {
            mode: call.mode,
            model: &call.model,
            prompt_tokens: call.prompt_tokens,
        };
        let res = relay_non_stream(&mut out, resp, req, &counter).await?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&out.body).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        res.usage
    };

    eprintln!(
        "[usage: prompt={} completion={} total={}]",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    );
    Ok(())
}
