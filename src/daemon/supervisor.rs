// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Supervision of the running simulations
//!
//! The [`Supervisor`] is the process-level owner of every simulation. It
//! hands out stable identifiers, refuses duplicate endpoints, exposes the
//! read-only views the dashboard collaborator polls (enumeration and
//! per-simulation register snapshots), and coordinates shutdown: every
//! simulation is signalled first, then all of them wind down
//! concurrently.
//!
//! The simulation list sits behind a reader-writer lock: presentation
//! reads are frequent, additions and removals are rare, and no lock is
//! ever held across an await point.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::simulation::bank::RegisterSnapshot;
use crate::simulation::schema::SimulationSchema;
use crate::simulation::{BindError, Simulation};

/// Stable identifier of a running simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SimId(u64);

impl fmt::Display for SimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim-{}", self.0)
    }
}

/// Presentation row for one simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimInfo {
    pub id: SimId,
    pub address: SocketAddr,
    pub slave_id: u8,
    pub alive: bool,
}

/// Owns the collection of simulations and their lifetimes.
pub struct Supervisor {
    schema: Arc<SimulationSchema>,
    interval: Duration,
    next_id: AtomicU64,
    simulations: RwLock<Vec<(SimId, Simulation)>>,
}

impl Supervisor {
    /// Create a supervisor for one validated register schema. All
    /// simulations it starts share the schema and the tick interval but
    /// nothing else; each owns a private bank and globals table.
    pub fn new(schema: Arc<SimulationSchema>, interval: Duration) -> Self {
        Supervisor {
            schema,
            interval,
            next_id: AtomicU64::new(1),
            simulations: RwLock::new(Vec::new()),
        }
    }

    /// Start a new simulation on `(ip, port)` serving `slave_id`.
    ///
    /// Fails with [`BindError::AlreadyBound`] if this process already
    /// serves the endpoint, or with [`BindError::Bind`] if the OS refuses
    /// the socket (port taken by another process, privileged port, …).
    /// Port 0 requests an ephemeral port and skips the duplicate check.
    pub async fn add(&self, ip: IpAddr, port: u16, slave_id: u8) -> Result<SimId, BindError> {
        let requested = SocketAddr::new(ip, port);
        if port != 0 {
            let simulations = self.simulations.read().unwrap();
            if simulations
                .iter()
                .any(|(_, simulation)| simulation.address() == requested)
            {
                return Err(BindError::AlreadyBound(requested));
            }
        }

        let simulation = Simulation::start(
            Arc::clone(&self.schema),
            requested,
            slave_id,
            self.interval,
        )
        .await?;

        let id = SimId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let address = simulation.address();
        self.simulations.write().unwrap().push((id, simulation));
        info!("Added {} on {} (slave {})", id, address, slave_id);
        Ok(id)
    }

    /// Stop and drop one simulation. Returns `false` for unknown ids.
    pub async fn remove(&self, id: SimId) -> bool {
        let removed = {
            let mut simulations = self.simulations.write().unwrap();
            simulations
                .iter()
                .position(|(sim_id, _)| *sim_id == id)
                .map(|index| simulations.remove(index))
        };
        match removed {
            Some((_, simulation)) => {
                simulation.shutdown().await;
                info!("Removed {}", id);
                true
            }
            None => {
                warn!("Cannot remove unknown simulation {}", id);
                false
            }
        }
    }

    /// Enumerate the running simulations for presentation.
    pub fn list(&self) -> Vec<SimInfo> {
        self.simulations
            .read()
            .unwrap()
            .iter()
            .map(|(id, simulation)| SimInfo {
                id: *id,
                address: simulation.address(),
                slave_id: simulation.slave_id(),
                alive: simulation.is_alive(),
            })
            .collect()
    }

    /// The actual endpoint of one simulation.
    pub fn address_of(&self, id: SimId) -> Option<SocketAddr> {
        self.simulations
            .read()
            .unwrap()
            .iter()
            .find(|(sim_id, _)| *sim_id == id)
            .map(|(_, simulation)| simulation.address())
    }

    /// Register snapshot of one simulation, or `None` for unknown ids.
    pub fn snapshot(&self, id: SimId) -> Option<Vec<RegisterSnapshot>> {
        self.simulations
            .read()
            .unwrap()
            .iter()
            .find(|(sim_id, _)| *sim_id == id)
            .map(|(_, simulation)| simulation.snapshot())
    }

    /// Stop every simulation: broadcast the stop signal, then wind the
    /// simulations down concurrently and wait for all of them.
    pub async fn shutdown(&self) {
        let simulations: Vec<(SimId, Simulation)> = {
            let mut guard = self.simulations.write().unwrap();
            std::mem::take(&mut *guard)
        };
        if simulations.is_empty() {
            return;
        }

        info!("Stopping {} simulation(s)", simulations.len());
        for (_, simulation) in &simulations {
            simulation.signal_stop();
        }

        let handles: Vec<_> = simulations
            .into_iter()
            .map(|(_, simulation)| tokio::spawn(simulation.shutdown()))
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Simulation shutdown task panicked: {}", e);
            }
        }
        info!("All simulations stopped");
    }
}
