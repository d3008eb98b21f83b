//! `wakelink`: headless host for the wakelink audio pipeline.
//!
//! Stands in for a UI: loads settings, drives a `WakelinkEngine` and prints
//! what it reports.
//!
//! ```text
//! wakelink listen   [--wav in.wav] [--keywords K] [--threshold T] [--seconds N]
//! wakelink loopback [--input in.wav] [--output out.wav] [--seconds N] [--volume V]
//! wakelink devices
//! wakelink selftest
//! wakelink config   [--write]
//! ```

mod history;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use tokio::{runtime::Runtime, sync::broadcast::error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wakelink_core::{
    audio::{
        device::{list_input_devices, list_output_devices},
        wav::{WavCaptureBackend, WavPlaybackBackend},
    },
    EngineBackends, StubSpotterFactory, WakelinkEngine,
};

use history::DetectionHistory;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

const DEFAULT_LOG_FILTER: &str = "wakelink=info,wakelink_core=info";

/// How often blocking waits re-check the stop conditions.
const POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "wakelink", version, about = "Keyword spotting and Opus duplex audio pipeline")]
struct Cli {
    /// Settings file (JSON). Defaults to ./wakelink.json.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for keywords and print detections until Ctrl-C.
    Listen {
        /// Read audio from a 16 kHz mono WAV file instead of the microphone.
        #[arg(long)]
        wav: Option<PathBuf>,
        #[arg(long)]
        keywords: Option<String>,
        #[arg(long)]
        threshold: Option<f32>,
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Capture, encode, decode and play back: the full duplex path.
    Loopback {
        /// WAV input instead of the microphone.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Record playback into a WAV file instead of the speaker.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Output volume, 0.0 to 1.0.
        #[arg(long)]
        volume: Option<f32>,
    },
    /// List audio input and output devices.
    Devices,
    /// Round-trip one second of silence through the codec.
    Selftest,
    /// Print the effective settings.
    Config {
        /// Also write them to the settings file.
        #[arg(long)]
        write: bool,
    },
}

fn init_tracing(filter: Option<&str>) {
    let default = filter.unwrap_or(DEFAULT_LOG_FILTER);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn build_backends(
    settings: &AppSettings,
    input: Option<&Path>,
    output: Option<&Path>,
) -> EngineBackends {
    let config = &settings.pipeline;
    let mut backends = EngineBackends::cpal(config, Arc::new(StubSpotterFactory::default()));
    if let Some(path) = input {
        backends.capture = Arc::new(WavCaptureBackend::new(path, settings.wav_realtime));
    }
    if let Some(path) = output {
        backends.playback = Arc::new(WavPlaybackBackend::new(path, config.volume_steps));
    }
    backends
}

/// Sets the returned flag on Ctrl-C.
fn watch_ctrl_c(rt: &Runtime) -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });
    interrupted
}

fn log_status_events(rt: &Runtime, engine: &WakelinkEngine) {
    let mut status = engine.subscribe_status();
    rt.spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => match event.detail {
                    Some(detail) => warn!(
                        status = ?event.status,
                        detail = detail.as_str(),
                        "pipeline status"
                    ),
                    None => info!(status = ?event.status, "pipeline status"),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_diagnostics(engine: &WakelinkEngine) -> anyhow::Result<()> {
    println!("{}", engine.effects_status());
    println!("{}", serde_json::to_string_pretty(&engine.diagnostics())?);
    Ok(())
}

fn run_listen(
    rt: &Runtime,
    mut settings: AppSettings,
    wav: Option<PathBuf>,
    keywords: Option<String>,
    threshold: Option<f32>,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(keywords) = keywords {
        settings.pipeline.keywords = keywords;
    }
    if let Some(threshold) = threshold {
        settings.pipeline.threshold = threshold;
    }
    let backends = build_backends(&settings, wav.as_deref(), None);
    let engine = WakelinkEngine::new(settings.pipeline.clone(), backends, rt.handle().clone());
    log_status_events(rt, &engine);

    engine.initialize().context("initializing pipeline")?;
    let detections = engine.start_listening().context("starting capture")?;
    info!(
        keywords = engine.keywords().as_str(),
        threshold = engine.threshold(),
        "listening; Ctrl-C to stop"
    );

    let interrupted = watch_ctrl_c(rt);
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut history = DetectionHistory::new(settings.history_len);

    loop {
        if interrupted.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match detections.recv_timeout(POLL) {
            Ok(event) => {
                println!(
                    "[{}] {} at {}",
                    event.seq,
                    event.keyword,
                    event.timestamp.to_rfc3339()
                );
                history.push(event);
            }
            Err(RecvTimeoutError::Timeout) => {
                // A WAV source ends the loop on its own.
                if !engine.is_listening() {
                    info!("capture ended");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.stop_listening()?;
    while let Ok(event) = detections.try_recv() {
        history.push(event);
    }

    println!("detections: {}", history.total());
    for event in history.recent() {
        println!("  [{}] {}", event.seq, event.keyword);
    }
    print_diagnostics(&engine)?;
    engine.release();
    Ok(())
}

fn run_loopback(
    rt: &Runtime,
    settings: AppSettings,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    seconds: u64,
    volume: Option<f32>,
) -> anyhow::Result<()> {
    let backends = build_backends(&settings, input.as_deref(), output.as_deref());
    let engine = WakelinkEngine::new(settings.pipeline.clone(), backends, rt.handle().clone());
    log_status_events(rt, &engine);

    engine.initialize().context("initializing pipeline")?;
    if let Some(volume) = volume {
        engine.set_volume(volume)?;
    }
    engine.prepare_playback().context("opening playback")?;
    engine.warm_up_playback()?;

    let mut encoded = engine.subscribe_encoded();
    let _detections = engine.start_listening().context("starting capture")?;
    info!(seconds, "loopback running; Ctrl-C to stop");

    let interrupted = watch_ctrl_c(rt);
    let deadline = Instant::now() + Duration::from_secs(seconds);
    rt.block_on(async {
        while Instant::now() < deadline && !interrupted.load(Ordering::SeqCst) {
            match tokio::time::timeout(POLL, encoded.recv()).await {
                Ok(Ok(frame)) => {
                    if let Err(e) = engine.play_encoded_frame(frame).await {
                        warn!("loopback playback failed: {e}");
                    }
                }
                Ok(Err(RecvError::Lagged(n))) => warn!(skipped = n, "loopback fell behind"),
                Ok(Err(RecvError::Closed)) => break,
                Err(_) if !engine.is_listening() => break,
                Err(_) => {}
            }
        }
    });

    engine.stop_listening()?;
    let drain_deadline = Instant::now() + Duration::from_secs(2);
    while engine.is_playing() && Instant::now() < drain_deadline {
        if engine.check_playback_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    engine.stop_playback()?;
    print_diagnostics(&engine)?;
    engine.release();
    Ok(())
}

fn run_selftest(rt: &Runtime, settings: AppSettings) -> anyhow::Result<()> {
    let backends = build_backends(&settings, None, None);
    let engine = WakelinkEngine::new(settings.pipeline, backends, rt.handle().clone());
    let report = engine.codec_self_test().context("codec self-test")?;
    println!(
        "{}: {} frames, {} bytes encoded, {} samples decoded",
        report.codec, report.frames, report.encoded_bytes, report.decoded_samples
    );
    Ok(())
}

fn run_devices() {
    println!("input devices:");
    for device in list_input_devices() {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_recommended {
            tags.push("recommended");
        }
        if device.is_loopback_like {
            tags.push("loopback?");
        }
        println!("  {} {}", device.name, tags.join(" "));
    }
    println!("output devices:");
    for device in list_output_devices() {
        let tag = if device.is_default { " default" } else { "" };
        println!("  {}{tag}", device.name);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path)?;

    init_tracing(settings.log_filter.as_deref());
    info!(settings_path = ?settings_path, "wakelink starting");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wakelink-rt")
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Listen {
            wav,
            keywords,
            threshold,
            seconds,
        } => run_listen(&rt, settings, wav, keywords, threshold, seconds),
        Command::Loopback {
            input,
            output,
            seconds,
            volume,
        } => run_loopback(&rt, settings, input, output, seconds, volume),
        Command::Devices => {
            run_devices();
            Ok(())
        }
        Command::Selftest => run_selftest(&rt, settings),
        Command::Config { write } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if write {
                save_settings(&settings_path, &settings)?;
                info!(path = ?settings_path, "settings written");
            }
            Ok(())
        }
    }
}
