use std::collections::HashMap;
use std::ops::Index;

use crate::error::SimError;
use crate::model::{CellModel, VariableRef};
use crate::stepper::Stepper;
use crate::topology::Topology;
use crate::TIME_EPSILON;

/// Result of a run: named series in a fixed order. The first key is the time
/// axis, followed by `"<cell>.<variable>"` keys in cell order and, within a
/// cell, in the order the model declares the variables.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Log {
    keys: Vec<String>,
    columns: Vec<Vec<f64>>,
    index: HashMap<String, usize>,
}

impl Log {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.index.get(key).map(|&col| self.columns[col].as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.keys.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> + '_ {
        self.keys
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter().map(Vec::as_slice))
    }

    /// Sampled times.
    pub fn time(&self) -> &[f64] {
        self.columns.first().map(Vec::as_slice).unwrap_or(&[])
    }

    fn push_key(&mut self, key: String) {
        self.index.insert(key.clone(), self.keys.len());
        self.keys.push(key);
        self.columns.push(Vec::new());
    }
}

impl Index<&str> for Log {
    type Output = [f64];

    fn index(&self, key: &str) -> &Self::Output {
        self.get(key)
            .unwrap_or_else(|| panic!("log has no entry '{key}'"))
    }
}

/// Samples the requested variables of every cell at `start + k * interval`,
/// snapped to the last macro step boundary at or before each target, plus the
/// final state.
pub(crate) struct Logger {
    log: Log,
    sources: Vec<VariableRef>,
    n_cells: usize,
    n_state: usize,
    start: f64,
    interval: f64,
    next_target: u64,
}

impl Logger {
    pub(crate) fn new<M: CellModel>(
        model: &M,
        topology: &Topology,
        names: &[String],
        start: f64,
        interval: f64,
    ) -> Result<Self, SimError> {
        let mut requested: Vec<(&str, VariableRef)> = Vec::with_capacity(names.len());
        for name in names {
            let var = model
                .variable(name)
                .ok_or_else(|| SimError::UnknownVariable(name.clone()))?;
            if var == VariableRef::Time || requested.iter().any(|&(_, known)| known == var) {
                continue;
            }
            requested.push((name.as_str(), var));
        }
        requested.sort_by_key(|&(_, var)| var);

        let n_cells = topology.cell_count();
        let mut log = Log::default();
        log.push_key(model.time_variable().to_string());
        for cell in 0..n_cells {
            let addr = topology.cell(cell);
            for (name, _) in &requested {
                log.push_key(format!("{addr}.{name}"));
            }
        }
        Ok(Self {
            log,
            sources: requested.into_iter().map(|(_, var)| var).collect(),
            n_cells,
            n_state: model.state_count(),
            start,
            interval,
            next_target: 0,
        })
    }

    fn target(&self) -> f64 {
        self.start + self.next_target as f64 * self.interval
    }

    /// Whether a target falls in the step `[time, next)`. Consumes it if so.
    /// The interval is never shorter than a step, so each step holds at most
    /// one target.
    pub(crate) fn take_due(&mut self, next: f64) -> bool {
        let due = self.target() < next - TIME_EPSILON;
        while self.target() < next - TIME_EPSILON {
            self.next_target += 1;
        }
        due
    }

    pub(crate) fn sample(&mut self, time: f64, states: &[f64], stepper: &Stepper) {
        self.log.columns[0].push(time);
        let mut col = 1;
        for cell in 0..self.n_cells {
            for &source in &self.sources {
                let value = match source {
                    VariableRef::State(idx) => states[cell * self.n_state + idx],
                    VariableRef::Intermediate(idx) => stepper.intermediates(cell)[idx],
                    VariableRef::Pace => stepper.pace(cell),
                    VariableRef::Diffusion => stepper.diffusion(cell),
                    VariableRef::Time => time,
                };
                self.log.columns[col].push(value);
                col += 1;
            }
        }
    }

    pub(crate) fn finish(self) -> Log {
        self.log
    }
}
