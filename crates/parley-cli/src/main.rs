use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_core::config::{AgentConfig, LoggingConfig};
use parley_media::audio::{self, AudioFrame};
use parley_media::ingest::{IngestOutcome, IngestPipeline, IngestSettings};
use parley_signaling::{SignalSender, SignalingClient};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Voice agent that joins a room, listens, and talks back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.parley/config.json5)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show resolved settings
    Status,

    /// Run voice activity segmentation over a raw s16le PCM file
    Segment {
        /// Path to the raw little-endian 16-bit PCM file
        #[arg(short, long)]
        input: PathBuf,

        /// Sample rate of the input
        #[arg(long, default_value_t = 48_000)]
        rate: u32,

        /// Interleaved channel count of the input
        #[arg(long, default_value_t = 1)]
        channels: u16,
    },

    /// Join the room's signaling channel and log what arrives
    Probe {
        /// Stop after this many seconds
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load(&config_path)?;

    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Check => check_config(&config, &config_path)?,
        },
        Commands::Status => {
            println!("parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Signaling: {}", config.signaling_url());
            println!(
                "Recognition: {} ({})",
                config.recognition.model, config.recognition.provider
            );
            println!(
                "Generation: {} ({})",
                config.generation.model, config.generation.provider
            );
            println!(
                "Synthesis: {} / {} ({})",
                config.synthesis.model, config.synthesis.voice, config.synthesis.provider
            );
        }
        Commands::Segment {
            input,
            rate,
            channels,
        } => segment(&config, &input, rate, channels)?,
        Commands::Probe { seconds } => probe(&config, Duration::from_secs(seconds)).await?,
    }

    Ok(())
}

/// Install the process subscriber.
///
/// `RUST_LOG` wins over the configured level; `--verbose` wins over both.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let mut filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(logging.level.as_deref().unwrap_or("info"))
        })
    };
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter {directive:?}: {e}"),
        }
    }

    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

fn check_config(config: &AgentConfig, path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        println!("No config at {}, using defaults", path.display());
    }
    let (warnings, errors) = config.validate();
    for w in &warnings {
        println!("warning: {w}");
    }
    for e in &errors {
        println!("error: {e}");
    }
    if !errors.is_empty() {
        anyhow::bail!("{} config error(s)", errors.len());
    }
    println!("Config OK ({} warning(s))", warnings.len());
    Ok(())
}

/// Replay a PCM file through the ingest pipeline on a synthetic frame clock.
fn segment(config: &AgentConfig, input: &Path, rate: u32, channels: u16) -> anyhow::Result<()> {
    if rate == 0 || channels == 0 {
        anyhow::bail!("rate and channels must be non-zero");
    }
    let bytes = std::fs::read(input)?;
    let pcm = audio::pcm_from_le_bytes(&bytes);

    let frame_ms = config.audio.frame_ms.max(1);
    let frame_len = (rate as usize * frame_ms as usize / 1000).max(1) * channels as usize;
    let tick = Duration::from_millis(frame_ms as u64);
    tracing::info!(
        path = %input.display(),
        samples = pcm.len(),
        rate,
        channels,
        "Segmenting"
    );

    let mut ingest = IngestPipeline::new(IngestSettings::from_config(config));
    let clock = Instant::now();
    let mut start_frame = 0usize;
    let mut found = 0usize;

    for (index, chunk) in pcm.chunks(frame_len).enumerate() {
        let frame = AudioFrame::from_i16(chunk, rate, channels);
        let now = clock + tick * index as u32;
        match ingest.push_frame(&frame, now, true) {
            Ok(IngestOutcome::SpeechStarted) => start_frame = index,
            Ok(IngestOutcome::Flushed(utterance)) => {
                found += 1;
                println!(
                    "utterance {found}: start frame {start_frame}, {} frames, {} samples, {} ms",
                    utterance.frame_count,
                    utterance.pcm.len(),
                    utterance.duration_ms
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(frame = index, error = %e, "Skipping frame"),
        }
    }

    if ingest.in_speech() {
        println!(
            "speech still active at end of input (start frame {start_frame}, {} frames buffered)",
            ingest.utterance_len()
        );
    }
    println!("{found} utterance(s) in {} frames", ingest.frames_seen());
    Ok(())
}

/// Join the configured room's signaling channel and log each decoded message.
async fn probe(config: &AgentConfig, duration: Duration) -> anyhow::Result<()> {
    let url = config.signaling_url();
    let (client, mut stream) = SignalingClient::connect(&url).await?;
    tracing::info!(%url, "Signaling channel open");

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::info!("Probe timeout reached");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    received += 1;
                    tracing::info!(kind = message.kind(), "Signaling message");
                    tracing::debug!(?message, "Message body");
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Undecodable signaling message"),
                None => {
                    tracing::info!("Signaling channel closed by server");
                    break;
                }
            },
        }
    }

    client.close().await;
    println!("{received} message(s) received");
    Ok(())
}
