// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the Modbus TCP slave simulator

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::signal;

use modsim::config::Config;
use modsim::daemon::Supervisor;
use modsim::simulation::schema::SimulationSchema;

/// Modbus TCP slave simulator with rule-driven registers
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the IPv4 address simulations bind to
    #[arg(long)]
    ip: Option<String>,

    /// Override the base TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Override the base slave id (1-247)
    #[arg(long)]
    slave_id: Option<u8>,

    /// Override the register update interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Number of simulations to start; port and slave id count up from
    /// the defaults
    #[arg(short = 'n', long, default_value_t = 1)]
    instances: u16,

    /// Print the built-in sample configuration as YAML and exit
    #[arg(long)]
    sample_config: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.sample_config {
        print!("{}", Config::default().to_yaml()?);
        return Ok(());
    }

    // Load configuration and apply command line overrides
    let mut config = Config::from_file(&args.config)?;
    config.apply_args(args.ip.clone(), args.port, args.slave_id, args.interval_ms);
    config.validate()?;

    let ip = IpAddr::V4(config.parsed_ip()?);
    let schema = Arc::new(SimulationSchema::from_config(&config.registers)?);
    info!(
        "Loaded {} register(s) from {:?}",
        schema.registers().len(),
        args.config
    );

    let supervisor = Supervisor::new(schema, config.tick_interval());

    let mut started = 0u16;
    for instance in 0..args.instances {
        let Some(port) = config.defaults.port.checked_add(instance) else {
            error!("Instance {} exceeds the TCP port range, skipping", instance);
            continue;
        };
        let slave_id = u16::from(config.defaults.slave_id) + instance;
        if slave_id > 247 {
            error!("Instance {} exceeds slave id 247, skipping", instance);
            continue;
        }
        let slave_id = slave_id as u8;
        match supervisor.add(ip, port, slave_id).await {
            Ok(id) => {
                info!("Started {} as slave {} on {}:{}", id, slave_id, ip, port);
                started += 1;
            }
            Err(e) => error!("Failed to start simulation on {}:{}: {}", ip, port, e),
        }
    }
    if started == 0 {
        anyhow::bail!("no simulation could be started");
    }

    // Wait for termination signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal, terminating simulations");
            supervisor.shutdown().await;
        }
        Err(err) => {
            eprintln!("Error waiting for shutdown signal: {}", err);
        }
    }

    Ok(())
}
