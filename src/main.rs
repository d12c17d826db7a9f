/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{anyhow, Context};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turbodl::config::Config;
use turbodl::{
    logging, DownloadOptions, Phase, ProgressEvent, ProgressSink, TurboDl, TurboError,
};

const EXIT_FAILURE: i32 = 1;
const EXIT_HASH_MISMATCH: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "turbodl")]
#[command(version)]
#[command(about = "Multi-connection HTTP download accelerator.")]
struct Cli {
    /// URL to download
    url: String,

    /// Output file or directory
    #[arg(default_value = ".")]
    output: PathBuf,

    /// Parallel connections: 'auto' or 1-24
    #[arg(short = 'c', long, value_name = "N")]
    connections: Option<String>,

    /// Your connection speed in Mbps
    #[arg(short = 's', long, value_name = "MBPS")]
    speed: Option<f64>,

    /// RAM buffer mode: auto, on or off
    #[arg(long, value_name = "MODE")]
    ram_buffer: Option<String>,

    /// Reserve the full file size on disk before downloading
    #[arg(long)]
    pre_allocate: bool,

    /// Keep existing files and number the new one instead
    #[arg(short = 'n', long)]
    no_overwrite: bool,

    /// Extra request header, KEY:VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_name = "KEY:VALUE")]
    headers: Vec<String>,

    /// Overall timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Seconds without data before a connection is retried
    #[arg(long, value_name = "SECS")]
    inactivity_timeout: Option<u64>,

    /// Expected hex digest of the finished file
    #[arg(long, value_name = "HEX")]
    expected_hash: Option<String>,

    /// Digest algorithm: md5, sha1, sha224, sha256, sha384, sha512,
    /// blake2b or blake2s
    #[arg(long, value_name = "ALGO")]
    hash_type: Option<String>,

    /// Suppress the progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load();

    let level = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    logging::init_with_level(&level);

    let options = match build_options(&cli, &config) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            std::process::exit(EXIT_FAILURE);
        }
    };

    let engine = match TurboDl::new(options) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(EXIT_FAILURE);
        }
    };
    let engine = if cli.quiet {
        engine
    } else {
        engine.with_progress_sink(Arc::new(CliProgressBar::new()))
    };

    // Signals become a controller cancel so teardown stays orderly
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if !cli.quiet {
        println!(
            "{} {} {}",
            style("::").cyan().bold(),
            style("downloading").green(),
            style(&cli.url).blue()
        );
    }

    match engine
        .download_with_cancel(&cli.url, &cli.output, cancel)
        .await
    {
        Ok(path) => {
            if !cli.quiet {
                println!(
                    "{} saved to {}",
                    style("::").cyan().bold(),
                    style(path.display()).green()
                );
            }
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            let code = match e {
                TurboError::HashMismatch { .. } => EXIT_HASH_MISMATCH,
                TurboError::Interrupted => EXIT_INTERRUPTED,
                _ => EXIT_FAILURE,
            };
            std::process::exit(code);
        }
    }
}

/// Merge config-file defaults with command-line flags
fn build_options(cli: &Cli, config: &Config) -> anyhow::Result<DownloadOptions> {
    let mut options = DownloadOptions::default();

    options.max_connections = cli
        .connections
        .as_deref()
        .unwrap_or(&config.max_connections)
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .context("--connections")?;

    options.connection_speed_mbps = cli.speed.unwrap_or(config.connection_speed_mbps);
    if options.connection_speed_mbps.is_nan() || options.connection_speed_mbps <= 0.0 {
        return Err(anyhow!("--speed must be positive"));
    }

    options.use_ram_buffer = cli
        .ram_buffer
        .as_deref()
        .unwrap_or(&config.ram_buffer)
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .context("--ram-buffer")?;

    options.pre_allocate_space = cli.pre_allocate || config.pre_allocate_space;
    options.overwrite = !cli.no_overwrite && config.overwrite;
    options.timeout = cli.timeout.map(Duration::from_secs);
    options.inactivity_timeout = Duration::from_secs(
        cli.inactivity_timeout
            .unwrap_or(config.inactivity_timeout_secs),
    );
    options.expected_hash = cli.expected_hash.clone();
    if let Some(hash_type) = &cli.hash_type {
        options.hash_type = hash_type
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .context("--hash-type")?;
    }
    options.show_progress = !cli.quiet;

    for header in &cli.headers {
        match header.split_once(':') {
            Some((name, value)) => options
                .headers
                .push((name.trim().to_string(), value.trim().to_string())),
            None => return Err(anyhow!("--header '{header}' is not KEY:VALUE")),
        }
    }

    Ok(options)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        cancel.cancel();
    });
}

/// Progress sink rendering engine events with indicatif
struct CliProgressBar {
    bar: ProgressBar,
    phase: Mutex<Option<Phase>>,
}

impl CliProgressBar {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            phase: Mutex::new(None),
        }
    }

    fn enter_phase(&self, event: &ProgressEvent) {
        match event.phase {
            Phase::Probing => self.bar.set_message("probing remote file"),
            Phase::Hashing => {
                self.bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.cyan} {msg}")
                        .unwrap(),
                );
                self.bar.set_message("verifying hash");
            }
            Phase::Downloading => match event.total_bytes {
                Some(total) => {
                    self.bar.set_length(total);
                    self.bar.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
                            .unwrap()
                            .progress_chars("=>-"),
                    );
                }
                None => self.bar.set_message("downloading"),
            },
        }
    }
}

impl ProgressSink for CliProgressBar {
    fn on_event(&self, event: &ProgressEvent) {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != Some(event.phase) {
                *phase = Some(event.phase);
                self.enter_phase(event);
            }
        }

        if event.phase == Phase::Downloading {
            self.bar.set_position(event.bytes_received);
        }
    }
}
