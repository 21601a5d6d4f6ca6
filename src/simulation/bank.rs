// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Register bank
//!
//! The bank is the shared state of one simulation: the flat array of
//! 16-bit words the Modbus service exposes on the wire, the scaled
//! per-register values the update rules operate on, and the globals table
//! that maps writable registers' `variable_name`s into expression scope.
//!
//! All of it lives behind a single mutex. The tick walk (randomize,
//! evaluate, accumulate, re-encode) runs as one critical section, and so
//! does every read or write coming from the Modbus service, so a client
//! never observes half of a multi-word update or a torn tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, warn};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use super::schema::{RegisterRole, RegisterSpec, SimulationSchema};

/// Rejected register accesses. The Modbus service maps every variant to
/// exception 02 (Illegal Data Address).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("address span {start}+{count} lies outside the register space")]
    OutOfRange { start: u16, count: u16 },
    #[error("address {0} is not mapped to any register")]
    Unmapped(u16),
    #[error("register '{0}' is not writable")]
    NotWritable(String),
    #[error("write span covers register '{0}' only partially")]
    PartialCoverage(String),
}

/// Presentation view of one register, produced by [`RegisterBank::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct RegisterSnapshot {
    pub name: String,
    /// 0-based holding-register index.
    pub address: u16,
    /// Conventional display address (40001 + address).
    pub display_address: u32,
    pub raw: Vec<u16>,
    pub scaled: f64,
    pub description: String,
    pub writable: bool,
}

struct BankState {
    raw: Vec<u16>,
    scaled: Vec<f64>,
    globals: HashMap<String, f64>,
    last_update: Option<Instant>,
}

/// Typed value store of one simulation, addressable by register name (for
/// the update rules) and by word address (for the Modbus service).
pub struct RegisterBank {
    schema: Arc<SimulationSchema>,
    state: Mutex<BankState>,
}

impl RegisterBank {
    /// Build a bank with every register at its initial value and the wire
    /// words already encoded. Callers force one tick before serving
    /// traffic so expressions observe consistent inputs.
    pub fn new(schema: Arc<SimulationSchema>) -> Self {
        let mut state = BankState {
            raw: vec![0u16; schema.word_count() as usize],
            scaled: schema
                .registers()
                .iter()
                .map(|spec| spec.initial_value())
                .collect(),
            globals: HashMap::new(),
            last_update: None,
        };
        for (idx, spec) in schema.registers().iter().enumerate() {
            if let RegisterRole::Writable { variable_name, .. } = &spec.role {
                state.globals.insert(variable_name.clone(), state.scaled[idx]);
            }
            encode_into(&mut state.raw, spec, state.scaled[idx]);
        }
        RegisterBank {
            schema,
            state: Mutex::new(state),
        }
    }

    pub fn schema(&self) -> &Arc<SimulationSchema> {
        &self.schema
    }

    /// Copy the current wire view of `count` words starting at `start`.
    pub fn read_words(&self, start: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        let end = u32::from(start) + u32::from(count);
        if end > self.schema.word_count() {
            return Err(AccessError::OutOfRange { start, count });
        }
        let state = self.state.lock().unwrap();
        Ok(state.raw[start as usize..end as usize].to_vec())
    }

    /// Apply an external write to the span `start..start+words.len()`.
    ///
    /// The span must be exactly covered by writable registers, each of
    /// them fully: a single-word write into the middle of a 32-bit
    /// register, a span touching a non-writable register, or a span
    /// crossing an unmapped word are all rejected. Accepted values are
    /// clamped to the register's declared bounds (the coercion is
    /// logged), re-encoded, and exported to the globals table.
    pub fn write_words(&self, start: u16, words: &[u16]) -> Result<(), AccessError> {
        let count = words.len() as u16;
        let end = u32::from(start) + u32::from(count);
        if end > self.schema.word_count() {
            return Err(AccessError::OutOfRange { start, count });
        }

        // Validate the whole span before touching any state.
        let mut targets: Vec<usize> = Vec::new();
        for offset in 0..count {
            let word = start + offset;
            let idx = self
                .schema
                .owner_of_word(word)
                .ok_or(AccessError::Unmapped(word))?;
            let spec = self.schema.register(idx);
            if !spec.role.is_writable() {
                return Err(AccessError::NotWritable(spec.name.clone()));
            }
            let fully_covered = spec.address >= start
                && u32::from(spec.address) + u32::from(spec.width()) <= end;
            if !fully_covered {
                return Err(AccessError::PartialCoverage(spec.name.clone()));
            }
            if targets.last() != Some(&idx) {
                targets.push(idx);
            }
        }

        let mut state = self.state.lock().unwrap();
        for idx in targets {
            let spec = self.schema.register(idx);
            let offset = (spec.address - start) as usize;
            let slice = &words[offset..offset + spec.width() as usize];
            let requested = spec.numeric_type.decode(slice, spec.scale);
            if requested.is_nan() {
                warn!(
                    "register '{}': ignoring write that decodes to NaN",
                    spec.name
                );
                continue;
            }
            let value = clamp_writable(spec, requested);
            if value != requested {
                warn!(
                    "register '{}': write value {} clamped to {}",
                    spec.name, requested, value
                );
            }
            store(&mut state, spec, idx, value);
            debug!(
                "register '{}': external write, scaled value now {}",
                spec.name, value
            );
        }
        Ok(())
    }

    /// Current scaled value of a register.
    pub fn get_scaled(&self, name: &str) -> Option<f64> {
        let idx = self.schema.index_of(name)?;
        let state = self.state.lock().unwrap();
        Some(state.scaled[idx])
    }

    /// Set a register's scaled value directly, clamping to the type's
    /// representable range and any writable bounds, and re-encode the
    /// wire words. Returns the value actually stored.
    pub fn set_scaled(&self, name: &str, value: f64) -> Option<f64> {
        let idx = self.schema.index_of(name)?;
        let spec = self.schema.register(idx);
        if value.is_nan() {
            warn!("register '{}': refusing to store NaN", spec.name);
            let state = self.state.lock().unwrap();
            return Some(state.scaled[idx]);
        }
        let clamped = clamp_type_range(spec, clamp_writable(spec, value));
        let mut state = self.state.lock().unwrap();
        store(&mut state, spec, idx, clamped);
        Some(clamped)
    }

    /// Scaled values and wire words of every register, in address order.
    pub fn snapshot(&self) -> Vec<RegisterSnapshot> {
        let state = self.state.lock().unwrap();
        self.schema
            .registers()
            .iter()
            .enumerate()
            .map(|(idx, spec)| RegisterSnapshot {
                name: spec.name.clone(),
                address: spec.address,
                display_address: 40_001 + u32::from(spec.address),
                raw: state.raw
                    [spec.address as usize..spec.address as usize + spec.width() as usize]
                    .to_vec(),
                scaled: state.scaled[idx],
                description: spec.description.clone(),
                writable: spec.role.is_writable(),
            })
            .collect()
    }

    /// Advance one wall-clock tick: `dt` is the elapsed time since the
    /// previous tick (zero on the first).
    pub fn tick(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let dt = state
            .last_update
            .map(|previous| now.duration_since(previous).as_secs_f64())
            .unwrap_or(0.0);
        self.walk(&mut state, dt);
        state.last_update = Some(now);
    }

    /// Advance the rules by an explicit time delta. Used by the forced
    /// startup tick (`dt = 0`) and by tests that need deterministic
    /// accumulator time.
    pub fn advance(&self, dt_secs: f64) {
        let mut state = self.state.lock().unwrap();
        self.walk(&mut state, dt_secs.max(0.0));
    }

    /// One pass of the update rules in dependency order.
    fn walk(&self, state: &mut BankState, dt_secs: f64) {
        // Writable values enter expression scope through the globals
        // table, refreshed before the walk so external writes since the
        // last tick are visible to every expression this tick.
        for (idx, spec) in self.schema.registers().iter().enumerate() {
            if let RegisterRole::Writable { variable_name, .. } = &spec.role {
                if let Some(slot) = state.globals.get_mut(variable_name) {
                    *slot = state.scaled[idx];
                }
            }
        }

        let mut rng = rand::rng();
        for &idx in self.schema.eval_order() {
            let spec = self.schema.register(idx);
            match &spec.role {
                RegisterRole::Random { fluctuation } => {
                    let noise = rng.random_range(-fluctuation..=*fluctuation);
                    let value = spec.base_value * (1.0 + noise);
                    store(state, spec, idx, value);
                }
                RegisterRole::Expression { expr } => {
                    let value = {
                        let scaled = &state.scaled;
                        let globals = &state.globals;
                        expr.eval(&|name| {
                            self.schema
                                .index_of(name)
                                .map(|dep| scaled[dep])
                                .or_else(|| globals.get(name).copied())
                        })
                    };
                    if value.is_finite() {
                        store(state, spec, idx, value);
                    } else {
                        warn!(
                            "register '{}': expression produced {}, keeping previous value {}",
                            spec.name, value, state.scaled[idx]
                        );
                    }
                }
                RegisterRole::Accumulator { source } => {
                    let rate = self
                        .schema
                        .index_of(source)
                        .map(|dep| state.scaled[dep])
                        .unwrap_or(f64::NAN);
                    if rate.is_finite() {
                        // The source is a watt-style rate integrated into
                        // kilounit-hours (kWh from W): /1000 for the kilo
                        // prefix, /3600 for seconds to hours.
                        let value = state.scaled[idx] + rate * dt_secs / 3600.0 / 1000.0;
                        store(state, spec, idx, value);
                    } else {
                        warn!(
                            "register '{}': accumulator source '{}' is {}, skipping increment",
                            spec.name, source, rate
                        );
                    }
                }
                RegisterRole::Constant | RegisterRole::Writable { .. } => {}
            }
        }
    }
}

/// Store a scaled value and keep the wire words consistent with it.
fn store(state: &mut BankState, spec: &RegisterSpec, idx: usize, value: f64) {
    state.scaled[idx] = value;
    encode_into(&mut state.raw, spec, value);
    if let RegisterRole::Writable { variable_name, .. } = &spec.role {
        if let Some(slot) = state.globals.get_mut(variable_name) {
            *slot = value;
        }
    }
}

fn encode_into(raw: &mut [u16], spec: &RegisterSpec, value: f64) {
    let words = spec.numeric_type.encode(value, spec.scale);
    raw[spec.address as usize..spec.address as usize + words.len()].copy_from_slice(&words);
}

fn clamp_writable(spec: &RegisterSpec, value: f64) -> f64 {
    if let RegisterRole::Writable {
        min_value: Some(min),
        max_value: Some(max),
        ..
    } = &spec.role
    {
        value.clamp(*min, *max)
    } else {
        value
    }
}

/// Clamp a scaled value so its encoding lies within the numeric type's
/// range.
fn clamp_type_range(spec: &RegisterSpec, value: f64) -> f64 {
    use super::schema::NumericType;
    let (raw_min, raw_max) = match spec.numeric_type {
        NumericType::Uint16 => (0.0, u16::MAX as f64),
        NumericType::Int16 => (i16::MIN as f64, i16::MAX as f64),
        NumericType::Uint32 => (0.0, u32::MAX as f64),
        NumericType::Int32 => (i32::MIN as f64, i32::MAX as f64),
        NumericType::Float32 => (f32::MIN as f64, f32::MAX as f64),
    };
    value.clamp(raw_min / spec.scale, raw_max / spec.scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterConfig;
    use crate::simulation::schema::NumericType;

    fn config(name: &str, address: u16) -> RegisterConfig {
        RegisterConfig {
            address,
            name: name.to_string(),
            description: format!("{} register", name),
            register_type: NumericType::Uint16,
            scale: 1.0,
            base_value: Some(0.0),
            randomize: false,
            fluctuation: None,
            accumulate: false,
            source: None,
            expression: None,
            writable: false,
            variable_name: None,
            min_value: None,
            max_value: None,
        }
    }

    fn bank(registers: &[RegisterConfig]) -> RegisterBank {
        let schema = SimulationSchema::from_config(registers).expect("schema should validate");
        RegisterBank::new(Arc::new(schema))
    }

    fn energy_meter() -> Vec<RegisterConfig> {
        let mut voltage = config("voltage_l1_n", 0);
        voltage.base_value = Some(230.0);
        voltage.scale = 10.0;
        let mut current = config("current_l1", 1);
        current.base_value = Some(5.0);
        current.scale = 100.0;
        let mut power = config("power_l1", 2);
        power.register_type = NumericType::Uint32;
        power.scale = 1000.0;
        power.expression = Some("voltage_l1_n * current_l1".to_string());
        vec![voltage, current, power]
    }

    #[test]
    fn derived_power_encodes_big_endian() {
        let bank = bank(&energy_meter());
        bank.advance(0.0);

        assert_eq!(bank.get_scaled("power_l1"), Some(1150.0));
        let words = bank.read_words(2, 2).unwrap();
        assert_eq!(words, vec![17, 35104]);
        assert_eq!(((words[0] as u32) << 16) | words[1] as u32, 1_150_000);
    }

    #[test]
    fn read_beyond_word_count_is_rejected() {
        let bank = bank(&energy_meter());
        assert!(matches!(
            bank.read_words(50, 2),
            Err(AccessError::OutOfRange { .. })
        ));
        assert!(bank.read_words(2, 2).is_ok());
    }

    #[test]
    fn accumulator_integrates_per_hour() {
        let mut rate = config("adjusted_power", 0);
        rate.base_value = Some(1000.0);
        let mut total = config("total_kwh_l1", 1);
        total.register_type = NumericType::Uint32;
        total.accumulate = true;
        total.source = Some("adjusted_power".to_string());
        let bank = bank(&[rate, total]);

        // 1000 W for one hour is exactly one kWh.
        bank.advance(3600.0);
        assert_eq!(bank.get_scaled("total_kwh_l1"), Some(1.0));

        // A second hour doubles it; dt = 0 leaves it untouched.
        bank.advance(3600.0);
        bank.advance(0.0);
        assert_eq!(bank.get_scaled("total_kwh_l1"), Some(2.0));
    }

    #[test]
    fn setpoint_feeds_expressions_through_globals() {
        let mut power = config("power_l1", 0);
        power.base_value = Some(1150.0);
        power.register_type = NumericType::Uint32;
        let mut setpoint = config("setpoint", 2);
        setpoint.writable = true;
        setpoint.base_value = Some(25.0);
        setpoint.variable_name = Some("sp".to_string());
        let mut adjusted = config("adjusted_power", 3);
        adjusted.register_type = NumericType::Uint32;
        adjusted.expression = Some("power_l1 * (sp / 100.0)".to_string());
        let bank = bank(&[power, setpoint, adjusted]);

        bank.advance(0.0);
        assert_eq!(bank.get_scaled("adjusted_power"), Some(1150.0 * 0.25));

        bank.write_words(2, &[50]).unwrap();
        bank.advance(0.0);
        assert_eq!(bank.get_scaled("adjusted_power"), Some(575.0));
    }

    #[test]
    fn write_clamps_to_declared_bounds() {
        let mut setpoint = config("setpoint", 0);
        setpoint.writable = true;
        setpoint.variable_name = Some("sp".to_string());
        setpoint.min_value = Some(0.0);
        setpoint.max_value = Some(100.0);
        let bank = bank(&[setpoint]);

        bank.write_words(0, &[250]).unwrap();
        assert_eq!(bank.get_scaled("setpoint"), Some(100.0));
        assert_eq!(bank.read_words(0, 1).unwrap(), vec![100]);
    }

    #[test]
    fn write_spans_must_cover_writables_exactly() {
        let mut wide = config("wide_setpoint", 0);
        wide.register_type = NumericType::Uint32;
        wide.writable = true;
        wide.variable_name = Some("wsp".to_string());
        let mut narrow = config("narrow_setpoint", 2);
        narrow.writable = true;
        narrow.variable_name = Some("nsp".to_string());
        let constant = config("fixed", 3);
        let bank = bank(&[wide, narrow, constant]);

        // Single-word write into a 32-bit register.
        assert!(matches!(
            bank.write_words(0, &[1]),
            Err(AccessError::PartialCoverage(name)) if name == "wide_setpoint"
        ));
        assert!(matches!(
            bank.write_words(1, &[1]),
            Err(AccessError::PartialCoverage(_))
        ));
        // Touching a non-writable register fails the whole span.
        assert!(matches!(
            bank.write_words(2, &[1, 2]),
            Err(AccessError::NotWritable(name)) if name == "fixed"
        ));
        // Exact coverage of contiguous writables succeeds.
        bank.write_words(0, &[0, 1234, 42]).unwrap();
        assert_eq!(bank.get_scaled("wide_setpoint"), Some(1234.0));
        assert_eq!(bank.get_scaled("narrow_setpoint"), Some(42.0));
    }

    #[test]
    fn rejected_write_changes_nothing() {
        let mut setpoint = config("setpoint", 0);
        setpoint.writable = true;
        setpoint.variable_name = Some("sp".to_string());
        setpoint.base_value = Some(7.0);
        let constant = config("fixed", 1);
        let bank = bank(&[setpoint, constant]);

        assert!(bank.write_words(0, &[9, 9]).is_err());
        assert_eq!(bank.get_scaled("setpoint"), Some(7.0));
        assert_eq!(bank.read_words(0, 2).unwrap(), vec![7, 0]);
    }

    #[test]
    fn random_stays_within_fluctuation_band() {
        let mut noisy = config("noisy", 0);
        noisy.randomize = true;
        noisy.base_value = Some(100.0);
        noisy.fluctuation = Some(0.1);
        let bank = bank(&[noisy]);

        for _ in 0..50 {
            bank.advance(0.0);
            let value = bank.get_scaled("noisy").unwrap();
            assert!((90.0..=110.0).contains(&value), "out of band: {value}");
        }
    }

    #[test]
    fn nan_expression_keeps_previous_value() {
        let mut zero = config("zero", 0);
        zero.base_value = Some(0.0);
        let mut derived = config("derived", 1);
        derived.base_value = Some(5.0);
        derived.expression = Some("zero / zero".to_string());
        let bank = bank(&[zero, derived]);

        bank.advance(0.0);
        assert_eq!(bank.get_scaled("derived"), Some(5.0));
    }

    #[test]
    fn set_scaled_respects_type_and_writable_bounds() {
        let mut setpoint = config("setpoint", 0);
        setpoint.writable = true;
        setpoint.variable_name = Some("sp".to_string());
        setpoint.min_value = Some(0.0);
        setpoint.max_value = Some(50.0);
        let bank = bank(&[setpoint]);

        assert_eq!(bank.set_scaled("setpoint", 80.0), Some(50.0));
        assert_eq!(bank.set_scaled("setpoint", -3.0), Some(0.0));
        assert_eq!(bank.set_scaled("missing", 1.0), None);
    }

    #[test]
    fn snapshot_reports_display_addresses() {
        let bank = bank(&energy_meter());
        bank.advance(0.0);
        let snapshot = bank.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].name, "voltage_l1_n");
        assert_eq!(snapshot[0].display_address, 40_001);
        assert_eq!(snapshot[2].raw.len(), 2);
        assert!(!snapshot[0].writable);
    }
}
