//! mira stream probe — entry point.
//!
//! Connects to a mirroring device (or waits for one), runs the receive
//! pipeline without a decoder, and reports what flows through it:
//! device and codec metadata, frame cadence, parameter-set changes and
//! governor policy flips.
//!
//! ```text
//! mira-probe                    Listen with defaults
//! mira-probe --config <path>   Use custom config TOML
//! mira-probe --port 7801       Override the configured port
//! mira-probe --gen-config      Dump default config and exit
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mira_core::governor::{GovernorConfig, LoadGovernor, ProcSampler};
use mira_core::{NalExtractor, PipelineStats, SessionMode, StreamDemuxer, TransportSession};

use config::{ConfigSource, ProbeConfig};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mira-probe", about = "mira stream pipeline probe")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "mira-probe.toml")]
    config: PathBuf,

    /// Port (overrides config).
    #[arg(short, long)]
    port: Option<u32>,

    /// Dial a loopback forwarder instead of listening.
    #[arg(long)]
    connect: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ProbeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let (mut config, config_source) = ProbeConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if cli.connect {
        config.network.mode = "connect".into();
    }

    // Init tracing before any logging.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mira-probe v{}", env!("CARGO_PKG_VERSION"));
    match config_source {
        ConfigSource::File => {}
        ConfigSource::Missing => {
            info!(path = %cli.config.display(), "no config file; using defaults");
        }
        ConfigSource::Invalid(e) => {
            warn!(path = %cli.config.display(), error = %e, "invalid config; using defaults");
        }
    }

    // ── 1. Open the transport session ───────────────────────────

    let stats = Arc::new(PipelineStats::new());
    let mode = match config.network.mode.as_str() {
        "connect" => SessionMode::Connect {
            port: config.network.port,
        },
        "listen" => SessionMode::Listen {
            port: config.network.port,
        },
        other => {
            return Err(format!("unknown network mode {other:?} (listen|connect)").into());
        }
    };
    let (session, mut channels) = TransportSession::new(mode, stats.clone());
    session.start().await?;
    if let Some(addr) = session.local_addr() {
        info!(%addr, "waiting for device");
    }
    session
        .wait_ready(Duration::from_millis(config.network.timeout_ms))
        .await?;

    // ── 2. Start the load governor ──────────────────────────────

    let mut policy_rx = if config.governor.enabled {
        let governor = LoadGovernor::new(
            ProcSampler,
            GovernorConfig {
                cpu_governor_enabled: config.governor.cpu_enabled,
                ..GovernorConfig::default()
            },
            stats.clone(),
        );
        let rx = governor.policy();
        tokio::spawn(governor.run(Duration::from_secs(config.governor.sample_interval_secs)));
        Some(rx)
    } else {
        None
    };

    // ── 3. Build the parsing pipeline ───────────────────────────

    let mut demuxer = if config.stream.raw {
        StreamDemuxer::raw(stats.clone())
    } else {
        StreamDemuxer::new(stats.clone())
    };
    let mut extractor: Option<NalExtractor> = None;
    let mut reported_meta = false;

    let mut report = tokio::time::interval(Duration::from_secs(config.stream.report_interval_secs));
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // ── 4. Probe loop ───────────────────────────────────────────

    loop {
        tokio::select! {
            chunk = channels.chunks.recv() => {
                let Some(chunk) = chunk else { break };
                for payload in demuxer.feed(&chunk) {
                    if !reported_meta {
                        if let (Some(device), Some(codec)) = (demuxer.device(), demuxer.codec()) {
                            info!(
                                device = %device.name,
                                codec = %codec.codec,
                                width = codec.width,
                                height = codec.height,
                                "stream metadata"
                            );
                            reported_meta = true;
                        }
                    }
                    let ext = match (&mut extractor, demuxer.codec()) {
                        (Some(ext), _) => ext,
                        (slot, Some(codec)) => {
                            let mut ext = NalExtractor::new(codec.codec, stats.clone());
                            ext.set_change_listener(|cache| {
                                info!(sets = %cache.summary(), "parameter sets changed");
                            });
                            slot.insert(ext)
                        }
                        // Raw mode never learns a codec; assume H.264.
                        (slot, None) => slot.insert(NalExtractor::new(
                            mira_core::VideoCodec::H264,
                            stats.clone(),
                        )),
                    };
                    let units = ext.extract(&payload);
                    if payload.is_config && !ext.has_complete_parameter_sets() {
                        warn!(units = units.len(), "config packet left parameter sets incomplete");
                    }
                }
            }
            changed = async {
                match policy_rx.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                if changed.is_ok() {
                    let policy = *policy_rx.as_ref().unwrap().borrow();
                    info!(?policy, "governor policy");
                }
            }
            _ = report.tick() => {
                let snap = stats.snapshot();
                info!(
                    bytes = snap.bytes_received,
                    frames = snap.frames_demuxed,
                    units = snap.units_extracted,
                    ps_changes = snap.parameter_set_changes,
                    governor = ?snap.governor_state,
                    "pipeline stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    // ── 5. Shutdown ─────────────────────────────────────────────

    session.stop();
    let snap = stats.snapshot();
    info!(
        bytes = snap.bytes_received,
        frames = snap.frames_demuxed,
        units = snap.units_extracted,
        "probe finished"
    );
    Ok(())
}
