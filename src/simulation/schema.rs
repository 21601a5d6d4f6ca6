// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Register schema and validation
//!
//! A [`SimulationSchema`] is the validated, frozen description of one
//! simulated device: every register's address, numeric type, scale and
//! update rule, plus the derived lookups the bank and the Modbus service
//! need (name→register, word→owning register, tick evaluation order).
//!
//! Validation happens once, when a simulation is built from the parsed
//! configuration. Per-register checks run first (required role
//! parameters, role exclusivity, scale and fluctuation ranges), then the
//! global invariants: disjoint address ranges, unique names and variable
//! names, reference closure, and acyclicity of the dependency graph. Any
//! failure reports the offending register and rule; no partial schema is
//! ever exposed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::expr::{Expr, ExprError};
use super::planner;
use crate::config::RegisterConfig;

/// Schema validation failures. Fatal to the simulation being constructed,
/// never to the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no registers defined")]
    NoRegisters,
    #[error("register '{register}': {reason}")]
    InvalidRegister { register: String, reason: String },
    #[error("register '{register}': invalid expression: {source}")]
    InvalidExpression {
        register: String,
        #[source]
        source: ExprError,
    },
    #[error("duplicate register name '{0}'")]
    DuplicateName(String),
    #[error("duplicate variable name '{0}'")]
    DuplicateVariable(String),
    #[error("registers '{first}' and '{second}' overlap at address {address}")]
    AddressOverlap {
        first: String,
        second: String,
        address: u16,
    },
    #[error("register '{register}' references unknown name '{reference}'")]
    UnknownReference {
        register: String,
        reference: String,
    },
    #[error("cyclic dependency between registers: {0}")]
    CyclicDependency(String),
}

/// Numeric type of a register, fixing its width and wire encoding.
///
/// Multi-word types span two consecutive holding registers, high word
/// first. Signed types use two's complement; `float32` is the IEEE-754
/// bit pattern with the same word ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    Uint16,
    Uint32,
    Int16,
    Int32,
    Float32,
}

impl NumericType {
    /// Number of 16-bit holding registers the type occupies.
    pub fn width(self) -> u16 {
        match self {
            NumericType::Uint16 | NumericType::Int16 => 1,
            NumericType::Uint32 | NumericType::Int32 | NumericType::Float32 => 2,
        }
    }

    /// Encode a scaled value into wire words.
    ///
    /// The value is multiplied by `scale`, rounded (ties to even for the
    /// integer types, nearest representable for `float32`) and clamped to
    /// the type's range before encoding, so plausible overflow saturates
    /// instead of wrapping.
    pub fn encode(self, scaled: f64, scale: f64) -> Vec<u16> {
        let raw = scaled * scale;
        match self {
            NumericType::Uint16 => {
                let capped = clamp_integer(raw, 0.0, u16::MAX as f64);
                vec![capped as u16]
            }
            NumericType::Int16 => {
                let capped = clamp_integer(raw, i16::MIN as f64, i16::MAX as f64);
                vec![(capped as i16) as u16]
            }
            NumericType::Uint32 => {
                let capped = clamp_integer(raw, 0.0, u32::MAX as f64) as u32;
                vec![(capped >> 16) as u16, (capped & 0xFFFF) as u16]
            }
            NumericType::Int32 => {
                let capped = clamp_integer(raw, i32::MIN as f64, i32::MAX as f64);
                let bits = (capped as i32) as u32;
                vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16]
            }
            NumericType::Float32 => {
                let value = if raw.is_nan() {
                    0.0f32
                } else {
                    // Finite f64 values beyond f32 range saturate at the bound.
                    raw.clamp(f32::MIN as f64, f32::MAX as f64) as f32
                };
                let bits = value.to_bits();
                vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16]
            }
        }
    }

    /// Decode wire words back into a scaled value.
    ///
    /// `words` must hold exactly [`width`](Self::width) entries; the bank
    /// guarantees that.
    pub fn decode(self, words: &[u16], scale: f64) -> f64 {
        let raw = match self {
            NumericType::Uint16 => words[0] as f64,
            NumericType::Int16 => (words[0] as i16) as f64,
            NumericType::Uint32 => (((words[0] as u32) << 16) | words[1] as u32) as f64,
            NumericType::Int32 => ((((words[0] as u32) << 16) | words[1] as u32) as i32) as f64,
            NumericType::Float32 => {
                f32::from_bits(((words[0] as u32) << 16) | words[1] as u32) as f64
            }
        };
        raw / scale
    }
}

fn clamp_integer(raw: f64, min: f64, max: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.round_ties_even().clamp(min, max)
}

/// Update rule of a register.
#[derive(Debug, Clone)]
pub enum RegisterRole {
    /// Holds its base value forever.
    Constant,
    /// `base_value · (1 + U(−f, +f))` every tick.
    Random { fluctuation: f64 },
    /// Integrates another register's value, watts into kilowatt-hours.
    Accumulator { source: String },
    /// Re-evaluated from other registers and globals every tick.
    Expression { expr: Expr },
    /// Externally writable setpoint, exported to the globals table.
    Writable {
        variable_name: String,
        min_value: Option<f64>,
        max_value: Option<f64>,
    },
}

impl RegisterRole {
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterRole::Writable { .. })
    }
}

/// One validated register descriptor. Immutable after validation.
#[derive(Debug, Clone)]
pub struct RegisterSpec {
    pub name: String,
    pub address: u16,
    pub numeric_type: NumericType,
    pub scale: f64,
    pub base_value: f64,
    pub role: RegisterRole,
    pub description: String,
}

impl RegisterSpec {
    pub fn width(&self) -> u16 {
        self.numeric_type.width()
    }

    /// Initial scaled value before the first tick.
    pub fn initial_value(&self) -> f64 {
        self.base_value
    }
}

/// The validated, frozen register set of one simulation.
#[derive(Debug)]
pub struct SimulationSchema {
    registers: Vec<RegisterSpec>,
    by_name: HashMap<String, usize>,
    word_owner: HashMap<u16, usize>,
    eval_order: Vec<usize>,
    word_count: u32,
}

impl SimulationSchema {
    /// Validate the parsed register configuration into a frozen schema.
    pub fn from_config(registers: &[RegisterConfig]) -> Result<Self, ConfigError> {
        if registers.is_empty() {
            return Err(ConfigError::NoRegisters);
        }

        let mut specs: Vec<RegisterSpec> = registers
            .iter()
            .map(validate_register)
            .collect::<Result<_, _>>()?;
        specs.sort_by_key(|spec| spec.address);

        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (idx, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.clone(), idx).is_some() {
                return Err(ConfigError::DuplicateName(spec.name.clone()));
            }
        }

        let mut variables: HashMap<&str, &str> = HashMap::new();
        for spec in &specs {
            if let RegisterRole::Writable { variable_name, .. } = &spec.role {
                if variables.insert(variable_name, &spec.name).is_some() {
                    return Err(ConfigError::DuplicateVariable(variable_name.clone()));
                }
                if by_name.contains_key(variable_name.as_str()) {
                    return Err(ConfigError::InvalidRegister {
                        register: spec.name.clone(),
                        reason: format!(
                            "variable_name '{}' collides with a register name",
                            variable_name
                        ),
                    });
                }
            }
        }

        let mut word_owner: HashMap<u16, usize> = HashMap::new();
        let mut word_count = 0u32;
        for (idx, spec) in specs.iter().enumerate() {
            for offset in 0..spec.width() {
                let word = spec.address + offset;
                if let Some(&other) = word_owner.get(&word) {
                    return Err(ConfigError::AddressOverlap {
                        first: specs[other].name.clone(),
                        second: spec.name.clone(),
                        address: word,
                    });
                }
                word_owner.insert(word, idx);
            }
            word_count = word_count.max(u32::from(spec.address) + u32::from(spec.width()));
        }

        // Reference closure: accumulator sources name registers,
        // expression identifiers name registers or writable variables.
        for spec in &specs {
            match &spec.role {
                RegisterRole::Accumulator { source } => {
                    if !by_name.contains_key(source.as_str()) {
                        return Err(ConfigError::UnknownReference {
                            register: spec.name.clone(),
                            reference: source.clone(),
                        });
                    }
                }
                RegisterRole::Expression { expr } => {
                    for name in expr.variables() {
                        if !by_name.contains_key(name.as_str())
                            && !variables.contains_key(name.as_str())
                        {
                            return Err(ConfigError::UnknownReference {
                                register: spec.name.clone(),
                                reference: name,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        let eval_order = planner::evaluation_order(&specs, &by_name)?;

        Ok(SimulationSchema {
            registers: specs,
            by_name,
            word_owner,
            eval_order,
            word_count,
        })
    }

    pub fn registers(&self) -> &[RegisterSpec] {
        &self.registers
    }

    pub fn register(&self, idx: usize) -> &RegisterSpec {
        &self.registers[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// The register owning a given word address, if any.
    pub fn owner_of_word(&self, address: u16) -> Option<usize> {
        self.word_owner.get(&address).copied()
    }

    /// Tick evaluation order (indices into [`registers`](Self::registers)).
    pub fn eval_order(&self) -> &[usize] {
        &self.eval_order
    }

    /// Exclusive upper bound of the occupied word address space.
    pub fn word_count(&self) -> u32 {
        self.word_count
    }
}

fn validate_register(config: &RegisterConfig) -> Result<RegisterSpec, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRegister {
        register: config.name.clone(),
        reason,
    };

    if config.name.is_empty() {
        return Err(ConfigError::InvalidRegister {
            register: format!("@{}", config.address),
            reason: "name must not be empty".to_string(),
        });
    }
    if !(config.scale.is_finite() && config.scale > 0.0) {
        return Err(invalid(format!(
            "scale must be a positive number, got {}",
            config.scale
        )));
    }

    let numeric_type = config.register_type;
    let width = numeric_type.width();
    if u32::from(config.address) + u32::from(width) > 0x10000 {
        return Err(invalid(format!(
            "address {} with width {} exceeds the 16-bit register space",
            config.address, width
        )));
    }

    let role_flags = [
        config.randomize,
        config.accumulate,
        config.expression.is_some(),
        config.writable,
    ];
    if role_flags.iter().filter(|&&set| set).count() > 1 {
        return Err(invalid(
            "at most one of randomize, accumulate, expression and writable may be set"
                .to_string(),
        ));
    }

    // Role parameters may only appear with their role.
    if config.fluctuation.is_some() && !config.randomize {
        return Err(invalid("fluctuation requires randomize: true".to_string()));
    }
    if config.source.is_some() && !config.accumulate {
        return Err(invalid("source requires accumulate: true".to_string()));
    }
    if !config.writable {
        if config.variable_name.is_some() {
            return Err(invalid("variable_name requires writable: true".to_string()));
        }
        if config.min_value.is_some() || config.max_value.is_some() {
            return Err(invalid(
                "min_value/max_value require writable: true".to_string(),
            ));
        }
    }

    let role = if config.randomize {
        if config.base_value.is_none() {
            return Err(invalid("randomize requires a base_value".to_string()));
        }
        let fluctuation = config
            .fluctuation
            .ok_or_else(|| invalid("randomize requires a fluctuation".to_string()))?;
        if !(fluctuation > 0.0 && fluctuation <= 1.0) {
            return Err(invalid(format!(
                "fluctuation must lie in (0, 1], got {}",
                fluctuation
            )));
        }
        RegisterRole::Random { fluctuation }
    } else if config.accumulate {
        let source = config
            .source
            .clone()
            .ok_or_else(|| invalid("accumulate requires a source register".to_string()))?;
        RegisterRole::Accumulator { source }
    } else if let Some(expression) = &config.expression {
        let expr = Expr::parse(expression).map_err(|source| ConfigError::InvalidExpression {
            register: config.name.clone(),
            source,
        })?;
        RegisterRole::Expression { expr }
    } else if config.writable {
        let variable_name = config
            .variable_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| invalid("writable requires a non-empty variable_name".to_string()))?;
        let bounds = match (config.min_value, config.max_value) {
            (Some(min), Some(max)) => {
                if min > max {
                    return Err(invalid(format!(
                        "min_value ({}) must not exceed max_value ({})",
                        min, max
                    )));
                }
                (Some(min), Some(max))
            }
            (None, None) => (None, None),
            _ => {
                return Err(invalid(
                    "min_value and max_value must be set together".to_string(),
                ))
            }
        };
        RegisterRole::Writable {
            variable_name,
            min_value: bounds.0,
            max_value: bounds.1,
        }
    } else {
        RegisterRole::Constant
    };

    Ok(RegisterSpec {
        name: config.name.clone(),
        address: config.address,
        numeric_type,
        scale: config.scale,
        base_value: config.base_value.unwrap_or(0.0),
        role,
        description: config.description.clone(),
    })
}
