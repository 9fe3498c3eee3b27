#![cfg_attr(not(feature = "python"), forbid(unsafe_code))]

//! Multicellular simulation of ODE cell models coupled by diffusion of one
//! state variable, on 1D strands, 2D grids or arbitrary graphs.

mod config;
mod error;
mod logger;
mod model;
mod pacing;
mod protocol;
#[cfg(feature = "python")]
mod python;
mod simulation;
mod state;
mod stepper;
mod topology;

pub use config::{RunConfig, SubstepPolicy, DEFAULT_STEP_SIZE};
pub use error::SimError;
pub use logger::Log;
pub use model::{
    CellInputs, CellModel, ExpressionModel, ExpressionModelBuilder, ModelError, VariableRef,
};
pub use pacing::PacingSet;
pub use protocol::{PacingEvent, Protocol};
pub use simulation::{LogProgress, ProgressReporter, RunOptions, RunState, Simulation};
pub use state::StateStore;
pub use topology::{Cell, Connection, Shape, Topology};

pub(crate) const TIME_EPSILON: f64 = 1e-9;

#[cfg(test)]
mod tests;
