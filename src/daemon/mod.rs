// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! The daemon module owns the running simulations: starting new slave
//! endpoints, enumerating them for presentation, taking per-simulation
//! register snapshots, and shutting everything down gracefully.
//!
//! ## Components
//!
//! * **Supervisor**: core implementation for adding, removing, listing
//!   and stopping simulations
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use modsim::config::Config;
//! use modsim::daemon::Supervisor;
//! use modsim::simulation::schema::SimulationSchema;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml")?;
//!     let schema = Arc::new(SimulationSchema::from_config(&config.registers)?);
//!
//!     let supervisor = Supervisor::new(schema, Duration::from_millis(300));
//!     supervisor
//!         .add("127.0.0.1".parse()?, 5020, 1)
//!         .await?;
//!
//!     // Wait for shutdown signal (e.g., Ctrl+C)
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Clean shutdown
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod supervisor;

pub use supervisor::{SimId, SimInfo, Supervisor};
