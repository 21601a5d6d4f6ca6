// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).
//! ModSim library
//!
//! This library simulates Modbus TCP slave devices whose holding-register
//! contents evolve over time: randomized sensor values, expression-derived
//! registers, energy-style accumulators and externally writable setpoints,
//! all described by a declarative YAML configuration.

pub mod config;
pub mod daemon;
pub mod modbus;
pub mod simulation;
