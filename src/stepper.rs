use rayon::prelude::*;

use crate::config::SubstepPolicy;
use crate::error::SimError;
use crate::model::{CellInputs, CellModel};
use crate::topology::Topology;

/// Scratch for one macro step: derivatives, intermediates, pacing levels and
/// diffusion currents of every cell at the start of the step.
#[derive(Clone, Debug)]
pub(crate) struct Stepper {
    n_state: usize,
    n_inter: usize,
    derivatives: Vec<f64>,
    intermediates: Vec<f64>,
    pace: Vec<f64>,
    diffusion: Vec<f64>,
}

impl Stepper {
    pub(crate) fn new(n_cells: usize, n_state: usize, n_inter: usize) -> Self {
        Self {
            n_state,
            n_inter,
            derivatives: vec![0.0; n_cells * n_state],
            intermediates: vec![0.0; n_cells * n_inter.max(1)],
            pace: vec![0.0; n_cells],
            diffusion: vec![0.0; n_cells],
        }
    }

    /// Evaluates every cell at `(current, time)`.
    ///
    /// Diffusion is computed from `current` only, so the result does not
    /// depend on the order in which cells are visited.
    pub(crate) fn prepare<M: CellModel>(
        &mut self,
        model: &M,
        topology: &Topology,
        paced: &[bool],
        level: f64,
        current: &[f64],
        time: f64,
    ) {
        let n_state = self.n_state;
        let n_inter = self.n_inter;
        let inter_stride = n_inter.max(1);
        let coupling = model.coupling_state();
        let adjacency = topology.adjacency();

        self.diffusion
            .par_iter_mut()
            .enumerate()
            .for_each(|(cell, out)| {
                let v = current[cell * n_state + coupling];
                let (targets, weights) = adjacency.row(cell);
                *out = targets
                    .iter()
                    .zip(weights)
                    .map(|(&other, &g)| g * (current[other * n_state + coupling] - v))
                    .sum();
            });
        for (pace, &flag) in self.pace.iter_mut().zip(paced) {
            *pace = if flag { level } else { 0.0 };
        }

        let pace = &self.pace;
        let diffusion = &self.diffusion;
        self.derivatives
            .par_chunks_mut(n_state)
            .zip(self.intermediates.par_chunks_mut(inter_stride))
            .enumerate()
            .for_each(|(cell, (derivatives, intermediates))| {
                let inputs = CellInputs {
                    time,
                    pace: pace[cell],
                    diffusion: diffusion[cell],
                };
                let state = &current[cell * n_state..(cell + 1) * n_state];
                model.evaluate(&inputs, state, derivatives, &mut intermediates[..n_inter]);
                derivatives[coupling] += inputs.diffusion;
            });
    }

    /// Integrates every cell from `current` into `next` over `h`, using the
    /// rates computed by [`Stepper::prepare`] for the first substep.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn advance<M: CellModel>(
        &self,
        model: &M,
        topology: &Topology,
        policy: SubstepPolicy,
        current: &[f64],
        next: &mut [f64],
        time: f64,
        h: f64,
    ) -> Result<(), SimError> {
        let n_state = self.n_state;
        let n_inter = self.n_inter;
        let coupling = model.coupling_state();

        next.par_chunks_mut(n_state)
            .zip(self.derivatives.par_chunks(n_state))
            .enumerate()
            .for_each(|(cell, (out, rate0))| {
                let start = &current[cell * n_state..(cell + 1) * n_state];
                let substeps = policy.substeps(rate0, h);
                if substeps <= 1 {
                    for ((y, &y0), &d) in out.iter_mut().zip(start).zip(rate0) {
                        *y = y0 + h * d;
                    }
                    return;
                }
                let dt = h / f64::from(substeps);
                let held = CellInputs {
                    time,
                    pace: self.pace[cell],
                    diffusion: self.diffusion[cell],
                };
                let mut rate = rate0.to_vec();
                let mut scratch = vec![0.0; n_inter];
                out.copy_from_slice(start);
                for sub in 0..substeps {
                    if sub > 0 {
                        let inputs = CellInputs {
                            time: time + f64::from(sub) * dt,
                            ..held
                        };
                        model.evaluate(&inputs, out, &mut rate, &mut scratch);
                        rate[coupling] += held.diffusion;
                    }
                    for (y, &d) in out.iter_mut().zip(&rate) {
                        *y += dt * d;
                    }
                }
            });

        let diverged = next
            .par_chunks(n_state)
            .position_first(|state| state.iter().any(|v| !v.is_finite()));
        match diverged {
            Some(cell) => Err(SimError::NumericalDivergence {
                cell: topology.cell(cell),
                time: time + h,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn intermediates(&self, cell: usize) -> &[f64] {
        let stride = self.n_inter.max(1);
        &self.intermediates[cell * stride..cell * stride + self.n_inter]
    }

    pub(crate) fn pace(&self, cell: usize) -> f64 {
        self.pace[cell]
    }

    pub(crate) fn diffusion(&self, cell: usize) -> f64 {
        self.diffusion[cell]
    }
}
