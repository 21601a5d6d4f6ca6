// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Per-tick evaluation ordering
//!
//! Expression registers depend on every register they reference and
//! accumulator registers depend on their source. Kahn's algorithm turns
//! those edges into a topological order the update loop walks each tick;
//! ties among ready registers break by ascending address so the order is
//! stable across runs. References to writable `variable_name`s read the
//! globals table, which is refreshed before the walk, so they do not
//! constrain the ordering.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use super::schema::{ConfigError, RegisterRole, RegisterSpec};

/// Compute the tick evaluation order, or report the registers stuck on a
/// cycle.
pub(crate) fn evaluation_order(
    registers: &[RegisterSpec],
    by_name: &HashMap<String, usize>,
) -> Result<Vec<usize>, ConfigError> {
    let mut in_degree = vec![0usize; registers.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); registers.len()];

    for (idx, register) in registers.iter().enumerate() {
        match &register.role {
            RegisterRole::Accumulator { source } => {
                if let Some(&dep) = by_name.get(source.as_str()) {
                    dependents[dep].push(idx);
                    in_degree[idx] += 1;
                }
            }
            RegisterRole::Expression { expr } => {
                for name in expr.variables() {
                    // Names that are not registers resolve to globals.
                    if let Some(&dep) = by_name.get(name.as_str()) {
                        dependents[dep].push(idx);
                        in_degree[idx] += 1;
                    }
                }
            }
            _ => {}
        }
    }

    let mut ready: BinaryHeap<Reverse<(u16, usize)>> = BinaryHeap::new();
    for (idx, &degree) in in_degree.iter().enumerate() {
        if degree == 0 {
            ready.push(Reverse((registers[idx].address, idx)));
        }
    }

    let mut order = Vec::with_capacity(registers.len());
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse((registers[dependent].address, dependent)));
            }
        }
    }

    if order.len() != registers.len() {
        let mut stuck: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree > 0)
            .map(|(idx, _)| registers[idx].name.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(ConfigError::CyclicDependency(stuck.join(", ")));
    }

    Ok(order)
}
