//! CLI Entry Point for packet-cache
//!
//! Provides command-line interface for:
//! - Validating a configuration file
//! - Running an in-process demo that feeds synthetic packets and queries them back
//!
//! # Usage
//!
//! Check a configuration:
//! ```bash
//! packet-cache check-config --config config/packet_cache.toml
//! ```
//!
//! Run the demo:
//! ```bash
//! packet-cache demo --seconds 30 --gap-ms 30
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use packet_cache::config::{CacheConfig, DEFAULT_CONFIG_PATH};
use packet_cache::messages::{BulkDataRequest, DataRequest, ThreeComponentDataRequest};
use packet_cache::packet::{format_timestamp, sample_offset, ChannelId, Packet};
use packet_cache::{telemetry, CacheService, Requestor, RequestorOptions, ServiceOptions};
use rand::Rng;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "packet-cache")]
#[command(about = "In-memory seismic packet cache", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print the effective values
    CheckConfig,

    /// Feed synthetic packets into a local cache and query them back
    Demo {
        /// Seconds of data per channel
        #[arg(long, default_value = "20")]
        seconds: i64,

        /// Sampling rate of the synthetic packets
        #[arg(long, default_value = "100.0")]
        rate: f64,

        /// Length of a hole left in the vertical channel, in milliseconds
        #[arg(long, default_value = "30")]
        gap_ms: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CacheConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    telemetry::init_from_config(&config)?;

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Demo {
            seconds,
            rate,
            gap_ms,
        } => run_demo(&config, seconds, rate, gap_ms),
    }
}

fn check_config(config: &CacheConfig) -> Result<()> {
    if let Err(reason) = config.validate() {
        bail!("invalid configuration: {reason}");
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn run_demo(config: &CacheConfig, seconds: i64, rate: f64, gap_ms: i64) -> Result<()> {
    if seconds <= 0 || !(rate.is_finite() && rate > 0.0) {
        bail!("seconds and rate must be positive");
    }
    let mut service = CacheService::<i32>::new();
    service.initialize(ServiceOptions::from_config(config)?)?;
    service.start()?;

    let vertical = ChannelId::new("UU", "DEMO", "HHZ", "01")?;
    let north = vertical.with_channel("HHN")?;
    let east = vertical.with_channel("HHE")?;
    let start_time = 1_700_000_000_000_000_i64;

    let ingest_started = Instant::now();
    let produced = feed_packets(
        &service,
        [&vertical, &north, &east],
        start_time,
        seconds,
        rate,
        gap_ms,
    )?;
    wait_for_ingest(&service, produced, Duration::from_secs(10));
    info!(
        produced,
        cached = service.total_packets(),
        elapsed = ?ingest_started.elapsed(),
        "Synthetic packets ingested"
    );

    let mut requestor = Requestor::new();
    requestor.initialize(service.endpoint()?, RequestorOptions::from_config(config))?;

    let sensors = requestor.sensors()?;
    println!("Cached sensors:");
    for sensor in &sensors {
        println!("  {sensor}");
    }

    let window_start = start_time + 1_000_000;
    let window_end = start_time + seconds * 1_000_000 - 1_000_000;
    let single = requestor.data_for(&vertical, window_start, window_end)?;
    match &single.waveform {
        Some(waveform) => println!(
            "{}: {} samples from {}, {} gaps ({})",
            waveform.channel(),
            waveform.len(),
            format_timestamp(waveform.start_time()),
            waveform.gap_count(),
            single.return_code
        ),
        None => println!("{}: {}", vertical, single.return_code),
    }

    let three = requestor.three_component_data(&ThreeComponentDataRequest::new(
        vertical.clone(),
        north.clone(),
        east.clone(),
        window_start,
        window_end,
    ))?;
    match &three.waveform {
        Some(waveform) => println!(
            "{}: three components, {} samples each, gaps: {}",
            waveform.vertical().channel(),
            waveform.len(),
            waveform.has_gaps()
        ),
        None => println!("three-component request: {}", three.return_code),
    }

    let bulk = requestor.bulk_data(&BulkDataRequest::new(
        1000,
        [&vertical, &north, &east]
            .into_iter()
            .enumerate()
            .map(|(index, channel)| {
                DataRequest::new(channel.clone(), window_start, window_start + 2_000_000)
                    .with_identifier(1001 + index as u64)
            })
            .collect(),
    ))?;
    for response in &bulk.responses {
        println!("bulk {} -> {}", response.channel, response.return_code);
    }

    service.stop()?;
    Ok(())
}

/// Sends one-second packets for each channel through the ingestion queue.
///
/// The vertical channel gets a hole of `gap_ms` after its fifth packet.
fn feed_packets(
    service: &CacheService<i32>,
    channels: [&ChannelId; 3],
    start_time: i64,
    seconds: i64,
    rate: f64,
    gap_ms: i64,
) -> Result<usize> {
    let sender = service.packet_sender()?;
    let samples_per_packet = rate.round().max(1.0) as usize;
    let mut rng = rand::thread_rng();
    let mut produced = 0;
    for second in 0..seconds {
        for (component, channel) in channels.iter().enumerate() {
            let packet_start = start_time + second * 1_000_000;
            let samples: Vec<i32> = (0..samples_per_packet)
                .map(|i| {
                    let t = (packet_start + sample_offset(i, rate)) as f64 * 1e-6;
                    let signal = 1000.0 * (t * (1.0 + component as f64)).sin();
                    signal as i32 + rng.gen_range(-25..=25)
                })
                .collect();
            let samples = if component == 0 && second == 5 && gap_ms > 0 {
                let dropped = ((gap_ms as f64) * rate / 1000.0).round() as usize;
                samples[..samples.len().saturating_sub(dropped)].to_vec()
            } else {
                samples
            };
            if samples.is_empty() {
                continue;
            }
            let packet = Packet::new((*channel).clone(), packet_start, rate, samples)?;
            sender
                .send(packet)
                .context("ingestion queue closed while feeding packets")?;
            produced += 1;
        }
    }
    Ok(produced)
}

fn wait_for_ingest(service: &CacheService<i32>, expected: usize, limit: Duration) {
    let deadline = Instant::now() + limit;
    while service.total_packets() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if service.total_packets() < expected {
        warn!(
            expected,
            cached = service.total_packets(),
            "Not every packet was cached; limits may have evicted some"
        );
    }
}
