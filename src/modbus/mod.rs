// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus communication module
//!
//! This module provides the Modbus TCP slave endpoint of a simulation,
//! mapping holding-register requests from external clients onto the
//! simulation's register bank.
//!
//! ## Key Components
//!
//! - `SimulatorModbusServer`: the `tokio_modbus` service implementation
//!   that handles read and write requests against a register bank.
//!
//! ## Supported Function Codes
//!
//! - 0x03 Read Holding Registers
//! - 0x06 Write Single Register
//! - 0x10 Write Multiple Registers
//!
//! Everything else (coils, discrete inputs, input registers, diagnostics)
//! is answered with an Illegal Function exception.

pub mod modbus_server;
pub use modbus_server::SimulatorModbusServer;
