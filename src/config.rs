use serde::{Deserialize, Serialize};

use crate::error::SimError;

pub const DEFAULT_STEP_SIZE: f64 = 0.005;

/// How the reaction term is integrated inside one macro step. Coupling and
/// pacing stay fixed over the macro step either way.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubstepPolicy {
    Fixed {
        substeps: u32,
    },
    /// Per cell, enough substeps that no state moves more than `max_delta`
    /// in one substep at the initial rate, capped at `max_substeps`.
    Adaptive {
        max_delta: f64,
        max_substeps: u32,
    },
}

impl Default for SubstepPolicy {
    fn default() -> Self {
        SubstepPolicy::Fixed { substeps: 1 }
    }
}

impl SubstepPolicy {
    pub fn validate(&self) -> Result<(), SimError> {
        match *self {
            SubstepPolicy::Fixed { substeps } if substeps == 0 => Err(
                SimError::InvalidArgument("fixed substep count must be at least 1".into()),
            ),
            SubstepPolicy::Adaptive {
                max_delta,
                max_substeps,
            } if !(max_delta > 0.0) || !max_delta.is_finite() || max_substeps == 0 => {
                Err(SimError::InvalidArgument(
                    "adaptive substepping needs a positive max_delta and max_substeps".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn substeps(&self, derivatives: &[f64], h: f64) -> u32 {
        match *self {
            SubstepPolicy::Fixed { substeps } => substeps,
            SubstepPolicy::Adaptive {
                max_delta,
                max_substeps,
            } => {
                let fastest = derivatives
                    .iter()
                    .map(|d| d.abs())
                    .fold(0.0_f64, f64::max);
                let wanted = (fastest * h / max_delta).ceil();
                if wanted.is_nan() || wanted < 1.0 {
                    1
                } else if wanted >= f64::from(max_substeps) {
                    max_substeps
                } else {
                    wanted as u32
                }
            }
        }
    }
}

/// Everything needed for [`Simulation::run_config`](crate::Simulation::run_config),
/// deserializable so callers can keep runs in configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub duration: f64,
    pub step_size: f64,
    /// `None` or non-positive logs every macro step.
    pub log_interval: Option<f64>,
    pub log: Vec<String>,
    pub substeps: SubstepPolicy,
    pub threads: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration: 1000.0,
            step_size: DEFAULT_STEP_SIZE,
            log_interval: None,
            log: Vec::new(),
            substeps: SubstepPolicy::default(),
            threads: None,
        }
    }
}
