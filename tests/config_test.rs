// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::Result;
use std::fs;
use tempfile::tempdir;

use modsim::config::Config;
use modsim::simulation::schema::{ConfigError, SimulationSchema};

#[test]
fn test_config_load_and_save() -> Result<()> {
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");

    let mut config = Config::default();
    config.defaults.port = 5099;
    config.defaults.slave_id = 17;
    config.save_to_file(&config_path)?;

    let loaded_config = Config::from_file(&config_path)?;
    assert_eq!(loaded_config.defaults.port, 5099);
    assert_eq!(loaded_config.defaults.slave_id, 17);
    assert_eq!(loaded_config.registers.len(), config.registers.len());

    // Loading a non-existent file creates the default configuration.
    let non_existent_path = temp_dir.path().join("non_existent.yaml");
    let default_config = Config::from_file(&non_existent_path)?;
    assert!(non_existent_path.exists());
    assert_eq!(default_config.defaults.ip, "127.0.0.1");
    assert_eq!(default_config.defaults.update_interval_ms, 300);
    assert!(!default_config.registers.is_empty());

    // Command-line overrides land on the defaults section.
    let mut config = Config::default();
    config.apply_args(Some("0.0.0.0".to_string()), Some(1502), Some(9), Some(100));
    assert_eq!(config.defaults.ip, "0.0.0.0");
    assert_eq!(config.defaults.port, 1502);
    assert_eq!(config.defaults.slave_id, 9);
    assert_eq!(config.defaults.update_interval_ms, 100);

    Ok(())
}

#[test]
fn test_unknown_fields_are_rejected() -> Result<()> {
    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("unknown_field.yaml");
    let yaml = r#"
defaults:
  ip: "127.0.0.1"
  port: 5020
  slave_id: 1
  surprise: true
registers:
  - address: 0
    name: value
    description: "a value"
    type: uint16
    scale: 1
"#;
    fs::write(&path, yaml)?;
    assert!(Config::from_file(&path).is_err());

    let path = temp_dir.path().join("unknown_register_field.yaml");
    let yaml = r#"
defaults:
  ip: "127.0.0.1"
  port: 5020
  slave_id: 1
registers:
  - address: 0
    name: value
    description: "a value"
    type: uint16
    scale: 1
    wiggle: 3
"#;
    fs::write(&path, yaml)?;
    assert!(Config::from_file(&path).is_err());

    Ok(())
}

#[test]
fn test_defaults_are_validated() -> Result<()> {
    let temp_dir = tempdir()?;

    let cases = [
        ("bad_ip.yaml", "ip: \"not-an-ip\"\n  port: 5020\n  slave_id: 1"),
        ("bad_ipv6.yaml", "ip: \"::1\"\n  port: 5020\n  slave_id: 1"),
        ("bad_port.yaml", "ip: \"127.0.0.1\"\n  port: 0\n  slave_id: 1"),
        ("bad_slave.yaml", "ip: \"127.0.0.1\"\n  port: 5020\n  slave_id: 250"),
    ];
    for (file, defaults) in cases {
        let path = temp_dir.path().join(file);
        let yaml = format!(
            r#"
defaults:
  {}
registers:
  - address: 0
    name: value
    description: "a value"
    type: uint16
    scale: 1
"#,
            defaults
        );
        fs::write(&path, yaml)?;
        assert!(Config::from_file(&path).is_err(), "{file} should be rejected");
    }

    Ok(())
}

#[test]
fn test_default_registers_build_a_valid_schema() -> Result<()> {
    let config = Config::default();
    let schema = SimulationSchema::from_config(&config.registers)?;
    assert_eq!(schema.registers().len(), config.registers.len());
    // voltage(1) + current(1) + power(2) + setpoint(1) + adjusted(2) + energy(2)
    assert_eq!(schema.word_count(), 9);
    Ok(())
}

#[test]
fn test_cyclic_expressions_fail_to_load() -> Result<()> {
    let yaml = r#"
defaults:
  ip: "127.0.0.1"
  port: 5020
  slave_id: 1
registers:
  - address: 0
    name: a
    description: "first"
    type: uint16
    scale: 1
    expression: "b + 1"
  - address: 1
    name: b
    description: "second"
    type: uint16
    scale: 1
    expression: "a + 1"
"#;
    let config: Config = serde_yml::from_str(yaml)?;
    match SimulationSchema::from_config(&config.registers) {
        Err(ConfigError::CyclicDependency(names)) => {
            assert!(names.contains('a'), "cycle report should name 'a': {names}");
            assert!(names.contains('b'), "cycle report should name 'b': {names}");
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    Ok(())
}
