//! Listing extraction CLI
//!
//! Runs one extraction request against OpenAI-compatible backends and prints
//! the outcome as JSON.
//!
//! ```text
//! listing-extract --text "2 bed flat in Alfama, 1200/month" \
//!     --image https://cdn.example.com/kitchen.jpg#<sha256> \
//!     --voice https://media.example.com/note.ogg
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use listing_extraction::{
    BackendKind, BackendTable, ExtractionRequest, ImageRef, OpenAiBackend, Orchestrator, VoiceRef,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "listing-extract", about = "Extract a structured listing from text, photos and a voice note")]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(long, env = "LISTING_CONFIG")]
    config: Option<PathBuf>,

    /// Free-text listing description
    #[arg(long)]
    text: Option<String>,

    /// Listing photo URI, optionally suffixed with `#<sha256>` (repeatable)
    #[arg(long = "image", value_name = "URI[#SHA256]")]
    images: Vec<String>,

    /// Voice note URI
    #[arg(long)]
    voice: Option<String>,

    /// Transcript of the voice note, skips transcription
    #[arg(long, requires = "voice")]
    transcript: Option<String>,

    /// Overall deadline; defaults to the configured orchestrator deadline
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,listing_extraction=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = CliConfig::load(args.config.as_deref())?;
    let request = build_request(&args)?;

    let mut table = BackendTable::builder(&config.engine.backends);
    for kind in BackendKind::ALL {
        let model = config.engine.backends.get(kind).model.clone();
        let backend = OpenAiBackend::from_env(kind, model).context("Failed to configure OpenAI backend")?;
        table = table.client(kind, Arc::new(backend));
    }
    let backends = table.build();

    let deadline = args
        .deadline_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.engine.orchestrator.default_deadline());

    let mut builder = Orchestrator::builder(config.engine, backends);
    if let Some(catalog) = config.catalog {
        builder = builder.matcher(Arc::new(catalog));
    }
    let orchestrator = builder.build();

    tracing::info!(request_id = %request.id(), deadline_secs = deadline.as_secs(), "Starting extraction");

    match orchestrator.process_within(&request, deadline).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure)?);
            Err(failure).context("Extraction failed")
        }
    }
}

fn build_request(args: &Args) -> Result<ExtractionRequest> {
    let mut builder = ExtractionRequest::builder();

    if let Some(text) = &args.text {
        builder = builder.text(text.clone());
    }
    for image in &args.images {
        builder = builder.image(parse_image(image)?);
    }
    if let Some(voice) = &args.voice {
        let mut voice = VoiceRef::new(voice)?;
        if let Some(transcript) = &args.transcript {
            voice = voice.with_transcript(transcript.clone());
        }
        builder = builder.voice(voice);
    }

    builder.build().context("Invalid extraction request")
}

/// Parse `URI` or `URI#<sha256>`. Any other fragment stays part of the URI.
fn parse_image(raw: &str) -> Result<ImageRef> {
    match raw.rsplit_once('#') {
        Some((uri, digest)) if is_sha256(digest) => Ok(ImageRef::new(uri)?.with_digest(digest.to_ascii_lowercase())),
        _ => Ok(ImageRef::new(raw)?),
    }
}

fn is_sha256(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
