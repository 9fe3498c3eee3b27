use crate::error::SimError;

/// Per-cell state vectors, double buffered.
///
/// `current` holds the state at the simulation time; the stepper writes the
/// next macro step into `next` and the controller publishes it with
/// [`StateStore::swap`].
#[derive(Clone, Debug)]
pub struct StateStore {
    n_cells: usize,
    default: Vec<f64>,
    current: Vec<f64>,
    next: Vec<f64>,
}

impl StateStore {
    pub fn new(n_cells: usize, default: Vec<f64>) -> Self {
        let current = default.repeat(n_cells);
        let next = vec![0.0; current.len()];
        Self {
            n_cells,
            default,
            current,
            next,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.n_cells
    }

    pub fn state_count(&self) -> usize {
        self.default.len()
    }

    pub fn default_state(&self) -> &[f64] {
        &self.default
    }

    /// Every cell's state, concatenated in cell order.
    pub fn all(&self) -> &[f64] {
        &self.current
    }

    pub fn cell(&self, idx: usize) -> &[f64] {
        let n = self.state_count();
        &self.current[idx * n..(idx + 1) * n]
    }

    pub fn broadcast(&mut self, values: &[f64]) -> Result<(), SimError> {
        self.check_cell_len(values)?;
        if !values.is_empty() {
            for chunk in self.current.chunks_exact_mut(values.len()) {
                chunk.copy_from_slice(values);
            }
        }
        Ok(())
    }

    pub fn set_cell(&mut self, idx: usize, values: &[f64]) -> Result<(), SimError> {
        self.check_cell_len(values)?;
        let n = self.state_count();
        self.current[idx * n..(idx + 1) * n].copy_from_slice(values);
        Ok(())
    }

    pub fn set_all(&mut self, values: &[f64]) -> Result<(), SimError> {
        if values.len() != self.current.len() {
            return Err(SimError::ShapeMismatch(format!(
                "state length {} does not match {} cells × {} states (expected {})",
                values.len(),
                self.n_cells,
                self.state_count(),
                self.current.len()
            )));
        }
        self.current.copy_from_slice(values);
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.default.is_empty() {
            return;
        }
        for chunk in self.current.chunks_exact_mut(self.default.len()) {
            chunk.copy_from_slice(&self.default);
        }
    }

    pub(crate) fn buffers(&mut self) -> (&[f64], &mut [f64]) {
        (&self.current, &mut self.next)
    }

    pub(crate) fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }

    fn check_cell_len(&self, values: &[f64]) -> Result<(), SimError> {
        if values.len() != self.state_count() {
            return Err(SimError::ShapeMismatch(format!(
                "state length {} does not match number of states {}",
                values.len(),
                self.state_count()
            )));
        }
        Ok(())
    }
}
