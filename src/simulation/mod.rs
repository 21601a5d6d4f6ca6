// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated Modbus slave devices
//!
//! A [`Simulation`] is the unit of isolation: one `(ip, port, slave_id)`
//! endpoint with its own register bank, its own update loop and its own
//! TCP listener. The process hosts any number of independent simulations;
//! nothing is shared between them, including the globals table writable
//! registers export their values into.
//!
//! Construction is atomic: the schema is validated, the bank is built and
//! one tick is forced so expressions see consistent inputs, and only then
//! is the listener bound. A failure at any point surfaces before the
//! endpoint accepts traffic.

pub mod bank;
pub mod expr;
mod planner;
pub mod schema;

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

use crate::modbus::SimulatorModbusServer;
use bank::{RegisterBank, RegisterSnapshot};
use schema::SimulationSchema;

/// Grace window granted to in-flight connections before the listener is
/// forced down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for a task to finish during shutdown.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint binding failures. Fatal to the simulation being constructed,
/// never to the process.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("endpoint {0} is already served by this process")]
    AlreadyBound(SocketAddr),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// One running simulated slave device.
pub struct Simulation {
    address: SocketAddr,
    slave_id: u8,
    bank: Arc<RegisterBank>,
    running: Arc<AtomicBool>,
    update_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
}

impl Simulation {
    /// Build the bank, force the startup tick, bind the endpoint and
    /// spawn the update loop and the listener.
    ///
    /// `bind` may carry port 0 to let the OS pick a free port; the actual
    /// endpoint is available from [`address`](Self::address) afterwards.
    pub async fn start(
        schema: Arc<SimulationSchema>,
        bind: SocketAddr,
        slave_id: u8,
        interval: Duration,
    ) -> Result<Self, BindError> {
        let bank = Arc::new(RegisterBank::new(schema));

        // One forced tick before any client can connect, so expression
        // registers are consistent with their inputs from the start.
        bank.advance(0.0);

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| BindError::Bind { addr: bind, source })?;
        let address = listener
            .local_addr()
            .map_err(|source| BindError::Bind { addr: bind, source })?;

        let running = Arc::new(AtomicBool::new(true));

        let update_task = spawn_update_loop(Arc::clone(&bank), Arc::clone(&running), interval);
        let server_task = spawn_server(listener, Arc::clone(&bank), address);

        info!(
            "Simulation serving slave {} on {} every {:?}",
            slave_id, address, interval
        );

        Ok(Simulation {
            address,
            slave_id,
            bank,
            running,
            update_task,
            server_task,
        })
    }

    /// The endpoint actually bound (relevant when port 0 was requested).
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn bank(&self) -> &Arc<RegisterBank> {
        &self.bank
    }

    /// Presentation view of every register.
    pub fn snapshot(&self) -> Vec<RegisterSnapshot> {
        self.bank.snapshot()
    }

    /// Whether both background tasks are still running.
    pub fn is_alive(&self) -> bool {
        !self.update_task.is_finished() && !self.server_task.is_finished()
    }

    /// Ask the update loop to exit after its current tick. Safe to call
    /// more than once; [`shutdown`](Self::shutdown) calls it implicitly.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the simulation: the update loop exits after its current
    /// tick, existing connections get a short grace window, then the
    /// listener is forced down.
    pub async fn shutdown(mut self) {
        info!("Stopping simulation on {}", self.address);
        self.signal_stop();

        time::sleep(SHUTDOWN_GRACE).await;
        self.server_task.abort();
        match time::timeout(TASK_JOIN_TIMEOUT, self.server_task).await {
            Ok(_) => debug!("Listener on {} shut down", self.address),
            Err(_) => warn!("Listener on {} did not shut down in time", self.address),
        }

        if time::timeout(TASK_JOIN_TIMEOUT, &mut self.update_task)
            .await
            .is_err()
        {
            warn!("Update loop on {} did not exit in time, aborting", self.address);
            self.update_task.abort();
        }

        info!("Simulation on {} stopped", self.address);
    }
}

/// Periodic driver advancing the rule-driven registers. A tick that
/// overruns the interval simply shortens the following sleep.
fn spawn_update_loop(
    bank: Arc<RegisterBank>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Update loop started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            bank.tick();
        }
        debug!("Update loop stopped");
    })
}

/// Accept loop serving one `SimulatorModbusServer` per client connection.
fn spawn_server(
    listener: TcpListener,
    bank: Arc<RegisterBank>,
    address: SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let server = Server::new(listener);

        let on_connected = move |stream, socket_addr| {
            let bank = Arc::clone(&bank);
            async move {
                accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                    Ok(Some(SimulatorModbusServer::new(&bank)))
                })
            }
        };

        let on_process_error = |err| {
            error!("Modbus server error: {err}");
        };

        if let Err(e) = server.serve(&on_connected, on_process_error).await {
            error!("Modbus server on {} failed: {}", address, e);
        }
    })
}
