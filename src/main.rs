use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vv_speaker::backends::SpeakerRef;
use vv_speaker::config_loader::Settings;
use vv_speaker::reply::Mode;
use vv_speaker::{http, SpeakRequest, SpeakerBox};

/// VOICEVOX speaker box
#[derive(Parser)]
#[command(name = "vv-speaker")]
#[command(version)]
#[command(about = "Speak text or generated replies through VOICEVOX", long_about = None)]
#[command(
    after_help = "Settings come from a VvSpeaker config file, ~/.config/vv-speaker/VvSpeaker and \
VVBOX_* environment variables (e.g. VVBOX_MIN_CHARS). Unprefixed names such as \
VOICEVOX_URL or MIN_CHARS are still read; VVBOX_* wins when both are set."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one request per stdin line and reply via the LLM
    Cli,

    /// Speak a single text
    Say {
        /// Text to speak
        text: String,
        /// direct, llm or auto
        #[arg(short, long, default_value = "direct")]
        mode: Mode,
        /// Prepare the reply without synthesis or playback
        #[arg(long)]
        dry_run: bool,
        /// Speaker name or style id
        #[arg(short, long)]
        speaker: Option<String>,
    },

    /// Run the HTTP API
    Api {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Check the speech engine and default speaker
    Health,

    /// Show configuration and counters
    Status,
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn error_json(error: &impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": error.to_string() })
}

/// Cancels in-flight work on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current segment");
            trigger.cancel();
        }
    });
    token
}

async fn run_cli(speaker_box: &SpeakerBox) -> anyhow::Result<()> {
    eprintln!("vv-speaker cli ready. one line per request. Ctrl-D to stop.");
    let cancel = cancel_on_ctrl_c();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        match speaker_box
            .process(SpeakRequest::new(text, Mode::Llm), &cancel)
            .await
        {
            Ok(result) => print_json(&result)?,
            Err(e) => print_json(&error_json(&e))?,
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new().context("failed to load configuration")?;
    init_tracing(&settings.log_level);
    info!(
        voicevox_url = %settings.voicevox_url,
        speaker = %settings.speaker_name,
        stream_playback = settings.stream_playback,
        "starting vv-speaker"
    );

    let speaker_box = Arc::new(SpeakerBox::from_settings(settings));

    match cli.command {
        Commands::Cli => run_cli(&speaker_box).await?,
        Commands::Say {
            text,
            mode,
            dry_run,
            speaker,
        } => {
            let request = SpeakRequest {
                text,
                mode,
                dry_run,
                speaker: speaker.as_deref().map(SpeakerRef::parse),
            };
            let result = speaker_box
                .process(request, &cancel_on_ctrl_c())
                .await
                .context("speak request failed")?;
            print_json(&result)?;
        }
        Commands::Api { host, port } => {
            http::serve(speaker_box, &host, port)
                .await
                .with_context(|| format!("api server on {}:{} failed", host, port))?;
        }
        Commands::Health => {
            let report = speaker_box.health().await;
            print_json(&report)?;
            if !report.is_ok() {
                std::process::exit(1);
            }
        }
        Commands::Status => print_json(&speaker_box.status())?,
    }

    Ok(())
}
