use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;
use transcript_lib::{TranscriptionError, TranscriptionHandler, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "transcript-server", version, about = "Serialized transcription worker for live captions")]
struct Cli {
    /// JSON worker config; defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the worker with synthetic connections and a stub engine
    Simulate {
        #[arg(long, default_value_t = 4)]
        connections: usize,
        /// Chunks submitted per connection
        #[arg(long, default_value_t = 3)]
        chunks: usize,
        /// Seconds of audio per chunk
        #[arg(long, default_value_t = 1.0)]
        chunk_secs: f32,
        /// Simulated inference time per chunk
        #[arg(long, default_value_t = 20)]
        compute_ms: u64,
    },
    /// Print the effective worker config as JSON
    PrintConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::load(path),
        None => Ok(WorkerConfig::default()),
    }
}

/// Sine tone whose pitch and level depend on the connection, so each
/// connection's transcripts are distinguishable.
fn synthetic_chunk(connection: usize, sample_rate: u32, secs: f32) -> Vec<f32> {
    let len = (sample_rate as f32 * secs) as usize;
    let freq = 220.0 * (connection + 1) as f32;
    let amplitude = (0.1 * (connection + 1) as f32).min(0.9);
    (0..len)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * freq * t).sin()
        })
        .collect()
}

async fn simulate(
    config: WorkerConfig,
    connections: usize,
    chunks: usize,
    chunk_secs: f32,
    compute_ms: u64,
) -> Result<()> {
    let sample_rate = config.chunking.sample_rate;
    let engine = move |audio: &[f32]| {
        if audio.is_empty() {
            return Err(TranscriptionError::AudioTooShort {
                samples: 0,
                minimum: 1,
            });
        }
        std::thread::sleep(Duration::from_millis(compute_ms));
        let rms = (audio.iter().map(|x| x * x).sum::<f32>() / audio.len() as f32).sqrt();
        Ok(format!(
            "{:.2}s of audio, rms {:.3}",
            audio.len() as f32 / sample_rate as f32,
            rms
        ))
    };

    let handler = TranscriptionHandler::new(engine, &config).context("Failed to start worker")?;
    info!(
        "🚀 Simulating {} connection(s) x {} chunk(s), {}ms per inference",
        connections, chunks, compute_ms
    );

    let mut tasks = Vec::with_capacity(connections);
    for connection in 0..connections {
        let mut session = handler.open_session();
        let mut accepted = 0;
        for _ in 0..chunks {
            match session.submit(synthetic_chunk(connection, sample_rate, chunk_secs)) {
                Ok(_) => accepted += 1,
                Err(e) => warn!("{}", e),
            }
        }

        // Generous deadline: every chunk of every connection goes through one worker
        let wait = Duration::from_millis((compute_ms + 50) * (connections * chunks) as u64 + 1000);
        tasks.push(tokio::spawn(async move {
            for _ in 0..accepted {
                match tokio::time::timeout(wait, session.recv()).await {
                    Ok(Some(update)) => println!(
                        "[{}] #{} {:.1}-{:.1}s: {}",
                        update.connection_id,
                        update.sequence_id,
                        update.audio_start_time,
                        update.audio_end_time,
                        update.text
                    ),
                    Ok(None) => break,
                    Err(_) => {
                        warn!("Session {} timed out waiting for transcripts", session.id());
                        break;
                    }
                }
            }
            session.close();
        }));
    }

    for task in tasks {
        task.await.context("Session task failed")?;
    }

    handler.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&handler.stats())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Simulate {
            connections,
            chunks,
            chunk_secs,
            compute_ms,
        } => simulate(config, connections, chunks, chunk_secs, compute_ms).await,
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
