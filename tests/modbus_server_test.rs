// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Tests for the simulated Modbus slave endpoint
//!
//! These tests validate the simulator end to end: a simulation is started
//! on an ephemeral port and driven through a real `tokio-modbus` client.
//! They cover reading derived registers, writing setpoints that feed back
//! into expressions, clamping of out-of-range writes, and the exception
//! responses for illegal addresses and unsupported function codes.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_modbus::prelude::*;

use modsim::config::RegisterConfig;
use modsim::simulation::schema::SimulationSchema;
use modsim::simulation::Simulation;

/// The demo device used throughout: constant voltage and current (so the
/// derived values are deterministic), derived power, a bounded writable
/// setpoint feeding an adjusted-power expression, an energy accumulator
/// and a 32-bit writable flow setpoint.
const TEST_REGISTERS: &str = r#"
- address: 0
  name: voltage_l1_n
  description: "L1-N voltage (V)"
  type: uint16
  scale: 10
  base_value: 230.0
- address: 1
  name: current_l1
  description: "L1 current (A)"
  type: uint16
  scale: 100
  base_value: 5.0
- address: 2
  name: power_l1
  description: "L1 active power (W)"
  type: uint32
  scale: 1000
  expression: "voltage_l1_n * current_l1"
- address: 4
  name: setpoint
  description: "Power setpoint (%)"
  type: uint16
  scale: 1
  base_value: 25.0
  writable: true
  variable_name: sp
  min_value: 0.0
  max_value: 100.0
- address: 5
  name: adjusted_power
  description: "Setpoint-adjusted power (W)"
  type: uint32
  scale: 1000
  expression: "power_l1 * (sp / 100.0)"
- address: 7
  name: total_kwh_l1
  description: "L1 energy (kWh)"
  type: uint32
  scale: 100
  accumulate: true
  source: adjusted_power
- address: 9
  name: flow_setpoint
  description: "Flow setpoint (l/h)"
  type: uint32
  scale: 1
  base_value: 0.0
  writable: true
  variable_name: flow_sp
"#;

/// Tick fast so writes become visible to expressions quickly.
const TEST_INTERVAL: Duration = Duration::from_millis(50);

/// Start a simulation on an ephemeral port and return its endpoint.
async fn start_test_server() -> Result<(SocketAddr, Simulation), Box<dyn std::error::Error>> {
    let registers: Vec<RegisterConfig> = serde_yml::from_str(TEST_REGISTERS)?;
    let schema = Arc::new(SimulationSchema::from_config(&registers)?);

    let bind = SocketAddr::from_str("127.0.0.1:0").unwrap();
    let simulation = Simulation::start(schema, bind, 1, TEST_INTERVAL).await?;
    let socket_addr = simulation.address();
    println!("Test server started on: {}", socket_addr);

    // Give the listener a moment to start accepting
    time::sleep(Duration::from_millis(50)).await;

    Ok((socket_addr, simulation))
}

fn decode_u32(words: &[u16]) -> u32 {
    ((words[0] as u32) << 16) | words[1] as u32
}

#[tokio::test]
async fn test_derived_power_is_served_big_endian() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // 230 V * 5 A = 1150 W, scale 1000 -> 1,150,000 on the wire
    let data = ctx.read_holding_registers(2, 2).await??;
    assert_eq!(data.len(), 2);
    assert_eq!(data[0], 17);
    assert_eq!(data[1], 35104);
    assert_eq!(decode_u32(&data), 1_150_000);

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_setpoint_write_feeds_derived_register() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // The startup tick computed adjusted_power from the base setpoint.
    let initial = ctx.read_holding_registers(5, 2).await??;
    assert_eq!(decode_u32(&initial), 287_500); // 1150 W * 25 %

    // Raise the setpoint; the next tick recomputes the expression.
    ctx.write_single_register(4, 50).await??;
    time::sleep(TEST_INTERVAL * 5).await;

    let adjusted = ctx.read_holding_registers(5, 2).await??;
    assert_eq!(decode_u32(&adjusted), 575_000); // 1150 W * 50 %

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_write_is_clamped() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // 250 exceeds the declared max of 100: accepted but clamped.
    ctx.write_single_register(4, 250).await??;

    let data = ctx.read_holding_registers(4, 1).await??;
    assert_eq!(data.len(), 1);
    assert_eq!(data[0], 100);

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_read_beyond_bank_is_illegal_address() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // The bank ends at address 10; both fully and partially out-of-range
    // reads must fail.
    let result = ctx.read_holding_registers(50, 2).await?;
    assert!(result.is_err());
    if let Err(error) = result {
        assert_eq!(error.to_string(), "Illegal data address");
    }

    let result = ctx.read_holding_registers(9, 5).await?;
    assert!(result.is_err());

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_single_write_cannot_target_wide_or_readonly_registers(
) -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // Low word of the 32-bit flow_setpoint
    let result = ctx.write_single_register(10, 1).await?;
    assert!(result.is_err());
    if let Err(error) = result {
        assert_eq!(error.to_string(), "Illegal data address");
    }

    // Start word of the same register: still only half of it
    let result = ctx.write_single_register(9, 1).await?;
    assert!(result.is_err());

    // A read-only expression register
    let result = ctx.write_single_register(2, 1).await?;
    assert!(result.is_err());

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_multiple_write_must_cover_writables_exactly(
) -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // Exact coverage of the 32-bit writable succeeds.
    ctx.write_multiple_registers(9, &[0, 1234]).await??;
    let data = ctx.read_holding_registers(9, 2).await??;
    assert_eq!(decode_u32(&data), 1234);

    // A span leaking into the read-only expression register fails.
    let result = ctx.write_multiple_registers(4, &[50, 1, 2]).await?;
    assert!(result.is_err());
    if let Err(error) = result {
        assert_eq!(error.to_string(), "Illegal data address");
    }

    // A span straddling the read-only accumulator and half of the wide
    // register fails.
    let result = ctx.write_multiple_registers(8, &[1, 2]).await?;
    assert!(result.is_err());

    // The rejected spans must not have modified anything.
    let setpoint = ctx.read_holding_registers(4, 1).await??;
    assert_eq!(setpoint[0], 25);

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_function_codes() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut ctx = tcp::connect(socket_addr).await?;

    // Only holding-register function codes are implemented.
    let result = ctx.read_input_registers(0, 1).await?;
    assert!(result.is_err());
    if let Err(error) = result {
        assert_eq!(error.to_string(), "Illegal function");
    }

    let result = ctx.read_coils(0, 1).await?;
    assert!(result.is_err());
    if let Err(error) = result {
        assert_eq!(error.to_string(), "Illegal function");
    }

    ctx.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_multiple_clients_observe_the_same_bank() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, _simulation) = start_test_server().await?;

    let mut client1 = tcp::connect(socket_addr).await?;
    let mut client2 = tcp::connect(socket_addr).await?;

    client1.write_single_register(4, 42).await??;
    time::sleep(Duration::from_millis(100)).await;

    let data = client2.read_holding_registers(4, 1).await??;
    assert_eq!(data.len(), 1);
    assert_eq!(data[0], 42);

    client1.disconnect().await?;
    client2.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_the_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let (socket_addr, simulation) = start_test_server().await?;

    assert!(simulation.is_alive());
    simulation.shutdown().await;

    // New connections must be refused once the listener is gone.
    time::sleep(Duration::from_millis(100)).await;
    assert!(tokio::net::TcpStream::connect(socket_addr).await.is_err());
    Ok(())
}
