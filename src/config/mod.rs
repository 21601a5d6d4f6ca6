// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Configuration Management
//!
//! This module implements configuration handling for the simulator. The
//! YAML document has two sections: `defaults` carries the endpoint every
//! new simulation starts from (IPv4 address, port, slave id) plus the
//! tick interval, and `registers` is the ordered register list shared by
//! every simulation the process hosts.
//!
//! Parsing is strict: unknown fields anywhere in the document are
//! rejected. Structural validation of the register list itself (address
//! disjointness, role parameters, dependency cycles, …) happens when the
//! register schema is built, not here.
//!
//! ## Usage
//!
//! ```no_run
//! use modsim::config::Config;
//!
//! // Load config from file, creating a default one if not found
//! let mut config = Config::from_file("config.yaml").unwrap();
//!
//! // Apply command line overrides if needed
//! config.apply_args(None, Some(5021), Some(7), None);
//!
//! println!("Listening on {}:{}", config.defaults.ip, config.defaults.port);
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use std::fs;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::simulation::schema::NumericType;

/// Default tick interval in milliseconds.
fn default_update_interval_ms() -> u64 {
    300
}

/// The `defaults` section: endpoint parameters for new simulations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    /// IPv4 address new simulations bind to.
    pub ip: String,

    /// TCP port of the first simulation; additional instances count up
    /// from here.
    pub port: u16,

    /// Modbus slave id of the first simulation (1-247); additional
    /// instances count up from here.
    pub slave_id: u8,

    /// Period of the register update loop in milliseconds.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 5020,
            slave_id: 1,
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

/// One entry of the `registers` section.
///
/// The role of the register follows from which optional fields are set:
/// none of them makes a constant, `randomize` with `fluctuation` makes a
/// noisy value, `accumulate` with `source` integrates another register,
/// `expression` derives the value from other registers, and `writable`
/// with `variable_name` accepts external writes and exports the value to
/// expression scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    /// 0-based holding-register start address.
    pub address: u16,

    /// Unique identifier used by expressions and accumulator sources.
    pub name: String,

    /// Free-text description shown by the dashboard.
    pub description: String,

    /// Numeric type; fixes the register width and wire encoding.
    #[serde(rename = "type")]
    pub register_type: NumericType,

    /// Strictly positive multiplier from scaled value to wire integer.
    pub scale: f64,

    /// Initial scaled value (0 when omitted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<f64>,

    /// Randomize around `base_value` every tick.
    #[serde(default)]
    pub randomize: bool,

    /// Relative fluctuation band for `randomize`, in (0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluctuation: Option<f64>,

    /// Integrate `source` as an energy-style accumulator.
    #[serde(default)]
    pub accumulate: bool,

    /// Source register name for `accumulate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Derivation expression over other registers and variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Accept external Modbus writes.
    #[serde(default)]
    pub writable: bool,

    /// Name under which a writable register enters expression scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_name: Option<String>,

    /// Lower bound for externally written values (requires `max_value`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,

    /// Upper bound for externally written values (requires `min_value`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

/// Root of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub defaults: DefaultsConfig,
    pub registers: Vec<RegisterConfig>,
}

impl Default for Config {
    /// The built-in demo device: a small single-phase energy meter with
    /// noisy voltage and current, derived power, a writable setpoint
    /// scaling the power, and an energy accumulator.
    fn default() -> Self {
        let register = |address: u16, name: &str, description: &str| RegisterConfig {
            address,
            name: name.to_string(),
            description: description.to_string(),
            register_type: NumericType::Uint16,
            scale: 1.0,
            base_value: None,
            randomize: false,
            fluctuation: None,
            accumulate: false,
            source: None,
            expression: None,
            writable: false,
            variable_name: None,
            min_value: None,
            max_value: None,
        };

        let mut voltage = register(0, "voltage_l1_n", "L1-N voltage (V)");
        voltage.scale = 10.0;
        voltage.base_value = Some(230.0);
        voltage.randomize = true;
        voltage.fluctuation = Some(0.05);

        let mut current = register(1, "current_l1", "L1 current (A)");
        current.scale = 100.0;
        current.base_value = Some(5.0);
        current.randomize = true;
        current.fluctuation = Some(0.10);

        let mut power = register(2, "power_l1", "L1 active power (W)");
        power.register_type = NumericType::Uint32;
        power.scale = 1000.0;
        power.expression = Some("voltage_l1_n * current_l1".to_string());

        let mut setpoint = register(4, "setpoint", "Power setpoint (%)");
        setpoint.base_value = Some(25.0);
        setpoint.writable = true;
        setpoint.variable_name = Some("sp".to_string());
        setpoint.min_value = Some(0.0);
        setpoint.max_value = Some(100.0);

        let mut adjusted = register(5, "adjusted_power", "Setpoint-adjusted power (W)");
        adjusted.register_type = NumericType::Uint32;
        adjusted.scale = 1000.0;
        adjusted.expression = Some("power_l1 * (sp / 100.0)".to_string());

        let mut energy = register(7, "total_kwh_l1", "L1 energy (kWh)");
        energy.register_type = NumericType::Uint32;
        energy.scale = 100.0;
        energy.accumulate = true;
        energy.source = Some("adjusted_power".to_string());

        Config {
            defaults: DefaultsConfig::default(),
            registers: vec![voltage, current, power, setpoint, adjusted, energy],
        }
    }
}

impl Config {
    /// Load the configuration from a YAML file.
    ///
    /// If the file does not exist, a default configuration is written
    /// there and returned, so a fresh checkout starts up with the demo
    /// device.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let config: Config = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration back to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write configuration file at {:?}", path))?;
        debug!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Render the configuration as YAML (used by `--sample-config`).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yml::to_string(self).context("Failed to serialize configuration to YAML")
    }

    /// Apply command line overrides onto the `defaults` section.
    pub fn apply_args(
        &mut self,
        ip: Option<String>,
        port: Option<u16>,
        slave_id: Option<u8>,
        interval_ms: Option<u64>,
    ) {
        if let Some(ip) = ip {
            self.defaults.ip = ip;
        }
        if let Some(port) = port {
            self.defaults.port = port;
        }
        if let Some(slave_id) = slave_id {
            self.defaults.slave_id = slave_id;
        }
        if let Some(interval_ms) = interval_ms {
            self.defaults.update_interval_ms = interval_ms;
        }
    }

    /// Check the `defaults` section beyond what serde can express.
    pub fn validate(&self) -> Result<()> {
        self.parsed_ip()?;
        if self.defaults.port == 0 {
            anyhow::bail!("defaults.port must lie in 1-65535");
        }
        if !(1..=247).contains(&self.defaults.slave_id) {
            anyhow::bail!(
                "defaults.slave_id must lie in 1-247, got {}",
                self.defaults.slave_id
            );
        }
        if self.defaults.update_interval_ms == 0 {
            anyhow::bail!("defaults.update_interval_ms must be positive");
        }
        Ok(())
    }

    /// The configured IPv4 address.
    pub fn parsed_ip(&self) -> Result<Ipv4Addr> {
        self.defaults
            .ip
            .parse::<Ipv4Addr>()
            .with_context(|| format!("defaults.ip must be an IPv4 address, got '{}'", self.defaults.ip))
    }

    /// The configured tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.defaults.update_interval_ms)
    }
}
