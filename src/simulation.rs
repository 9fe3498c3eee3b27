use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::ControlFlow;

use crate::config::{RunConfig, SubstepPolicy, DEFAULT_STEP_SIZE};
use crate::error::SimError;
use crate::logger::{Log, Logger};
use crate::model::CellModel;
use crate::pacing::PacingSet;
use crate::protocol::Protocol;
use crate::state::StateStore;
use crate::stepper::Stepper;
use crate::topology::{Cell, Connection, Shape, Topology};
use crate::TIME_EPSILON;

/// Receives the fraction of a run completed after every macro step.
pub trait ProgressReporter {
    fn update(&mut self, progress: f64) -> ControlFlow<()>;
}

impl<F> ProgressReporter for F
where
    F: FnMut(f64) -> ControlFlow<()>,
{
    fn update(&mut self, progress: f64) -> ControlFlow<()> {
        self(progress)
    }
}

/// Reports progress through the `log` facade in fixed increments.
#[derive(Clone, Debug)]
pub struct LogProgress {
    increment: f64,
    next: f64,
}

impl LogProgress {
    pub fn new(increment: f64) -> Self {
        let increment = if increment > 0.0 { increment } else { 0.1 };
        Self {
            increment,
            next: increment,
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl ProgressReporter for LogProgress {
    fn update(&mut self, progress: f64) -> ControlFlow<()> {
        if progress + TIME_EPSILON >= self.next {
            info!("simulation {:.0}% complete", progress * 100.0);
            while self.next <= progress + TIME_EPSILON {
                self.next += self.increment;
            }
        }
        ControlFlow::Continue(())
    }
}

/// Per-run settings of [`Simulation::run`].
#[derive(Default)]
pub struct RunOptions<'a> {
    pub log: Vec<String>,
    pub log_interval: Option<f64>,
    pub progress: Option<&'a mut dyn ProgressReporter>,
    pub cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> RunOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn log_interval(mut self, interval: Option<f64>) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn progress(mut self, reporter: &'a mut dyn ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn cancel(mut self, check: &'a dyn Fn() -> bool) -> Self {
        self.cancel = Some(check);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// A network of identical cells driven by a pacing protocol.
pub struct Simulation<M: CellModel> {
    model: M,
    protocol: Option<Protocol>,
    topology: Topology,
    pacing: PacingSet,
    store: StateStore,
    time: f64,
    step_size: f64,
    substeps: SubstepPolicy,
    threads: Option<usize>,
    run_state: RunState,
}

impl<M: CellModel> Simulation<M> {
    pub fn new(model: M, protocol: Option<Protocol>, shape: Shape) -> Result<Self, SimError> {
        if !model.is_valid() {
            return Err(SimError::MissingRhs(
                "model has unassigned or unresolved right-hand sides".into(),
            ));
        }
        if model.has_interdependent_components() {
            return Err(SimError::CoupledComponents(
                "the model's components depend on each other cyclically".into(),
            ));
        }
        let default = model.default_state();
        if default.is_empty() || default.len() != model.state_count() {
            return Err(SimError::ShapeMismatch(format!(
                "default state length {} does not match number of states {}",
                default.len(),
                model.state_count()
            )));
        }
        if model.coupling_state() >= default.len() {
            return Err(SimError::OutOfRange(format!(
                "coupling state {} out of range [0, {})",
                model.coupling_state(),
                default.len()
            )));
        }
        let topology = Topology::new(shape)?;
        let pacing = PacingSet::new(&topology);
        let store = StateStore::new(topology.cell_count(), default);
        debug!(
            "created simulation of {:?} with {} states per cell",
            shape,
            store.state_count()
        );
        Ok(Self {
            model,
            protocol,
            topology,
            pacing,
            store,
            time: 0.0,
            step_size: DEFAULT_STEP_SIZE,
            substeps: SubstepPolicy::default(),
            threads: None,
            run_state: RunState::Ready,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn shape(&self) -> Shape {
        self.topology.shape()
    }

    pub fn is_2d(&self) -> bool {
        self.topology.is_2d()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) -> Result<(), SimError> {
        if !time.is_finite() {
            return Err(SimError::InvalidArgument("time must be finite".into()));
        }
        self.time = time;
        Ok(())
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn set_step_size(&mut self, step_size: f64) -> Result<(), SimError> {
        if !(step_size > 0.0) || !step_size.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "step size must be positive, got {step_size}"
            )));
        }
        debug!("step size set to {step_size}");
        self.step_size = step_size;
        Ok(())
    }

    pub fn set_substep_policy(&mut self, policy: SubstepPolicy) -> Result<(), SimError> {
        policy.validate()?;
        debug!("substep policy set to {policy:?}");
        self.substeps = policy;
        Ok(())
    }

    /// Runs on a dedicated pool of `threads` workers, or the global rayon pool
    /// when `None`.
    pub fn set_threads(&mut self, threads: Option<usize>) -> Result<(), SimError> {
        if threads == Some(0) {
            return Err(SimError::InvalidArgument(
                "thread count must be greater than zero".into(),
            ));
        }
        self.threads = threads;
        Ok(())
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn set_protocol(&mut self, protocol: Option<Protocol>) {
        debug!(
            "protocol replaced ({} events)",
            protocol.as_ref().map_or(0, |protocol| protocol.events().len())
        );
        self.protocol = protocol;
    }

    pub fn reset(&mut self) {
        self.time = 0.0;
        self.store.reset();
        self.run_state = RunState::Ready;
    }

    pub fn neighbors(&self, addr: &[i64]) -> Result<Vec<Cell>, SimError> {
        self.topology.neighbors(addr)
    }

    pub fn connections(&self) -> &[Connection] {
        self.topology.connections()
    }

    pub fn set_connections(&mut self, edges: &[(i64, i64, f64)]) -> Result<(), SimError> {
        self.topology.set_connections(edges)
    }

    pub fn conductance(&self) -> (f64, f64) {
        self.topology.conductance()
    }

    pub fn set_conductance(&mut self, g: f64) -> Result<(), SimError> {
        self.topology.set_conductance(g)
    }

    pub fn set_conductance_xy(&mut self, gx: f64, gy: f64) -> Result<(), SimError> {
        self.topology.set_conductance_xy(gx, gy)
    }

    pub fn set_paced_cells(&mut self, counts: &[i64], offsets: &[i64]) -> Result<(), SimError> {
        self.pacing.set_range(&self.topology, counts, offsets)
    }

    pub fn set_paced_cell_list<I, A>(&mut self, cells: I) -> Result<(), SimError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[i64]>,
    {
        self.pacing.set_list(&self.topology, cells)
    }

    pub fn is_paced(&self, addr: &[i64]) -> Result<bool, SimError> {
        self.pacing.is_paced(&self.topology, addr)
    }

    pub fn paced_cells(&self) -> Vec<Cell> {
        self.pacing.cells(&self.topology)
    }

    /// The state of one cell, or of every cell concatenated when `addr` is
    /// `None`.
    pub fn state(&self, addr: Option<&[i64]>) -> Result<Vec<f64>, SimError> {
        match addr {
            Some(addr) => Ok(self.store.cell(self.topology.resolve(addr)?).to_vec()),
            None => Ok(self.store.all().to_vec()),
        }
    }

    /// Sets one cell's state, or every cell's when `addr` is `None`.
    pub fn set_state(&mut self, values: &[f64], addr: Option<&[i64]>) -> Result<(), SimError> {
        match addr {
            Some(addr) => {
                let idx = self.topology.resolve(addr)?;
                self.store.set_cell(idx, values)
            }
            None => self.store.broadcast(values),
        }
    }

    /// Sets the concatenated state of all cells.
    pub fn set_state_all(&mut self, values: &[f64]) -> Result<(), SimError> {
        self.store.set_all(values)
    }

    pub fn default_state(&self) -> Vec<f64> {
        self.store.default_state().to_vec()
    }

    /// Applies the step size, substep policy and thread count of `config`,
    /// then runs for its duration.
    pub fn run_config(&mut self, config: &RunConfig) -> Result<Log, SimError> {
        config.substeps.validate()?;
        self.set_step_size(config.step_size)?;
        self.set_threads(config.threads)?;
        self.substeps = config.substeps;
        self.run(
            config.duration,
            RunOptions::new()
                .log(config.log.iter().cloned())
                .log_interval(config.log_interval),
        )
    }

    /// Advances the simulation by `duration` and returns the sampled log.
    ///
    /// A cancelled or diverging run returns an error, produces no log and
    /// leaves time and state as they were before the call.
    pub fn run(&mut self, duration: f64, mut options: RunOptions<'_>) -> Result<Log, SimError> {
        if !(duration >= 0.0) || !duration.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "duration must be non-negative, got {duration}"
            )));
        }
        self.run_state = RunState::Ready;
        let interval = options
            .log_interval
            .filter(|&interval| interval > 0.0)
            .map_or(self.step_size, |interval| interval.max(self.step_size));
        let start = self.time;
        let end = start + duration;
        let mut logger = Logger::new(&self.model, &self.topology, &options.log, start, interval)?;
        let pool = match self.threads {
            Some(n) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| SimError::ThreadPool(e.to_string()))?,
            ),
            None => None,
        };

        let checkpoint = self.store.all().to_vec();
        let step_size = self.step_size;
        let n_steps = (duration / step_size - TIME_EPSILON).ceil().max(0.0) as u64;
        let time_at = |step: u64| {
            if step >= n_steps {
                end
            } else {
                start + step as f64 * step_size
            }
        };
        let mut stepper = Stepper::new(
            self.topology.cell_count(),
            self.model.state_count(),
            self.model.intermediate_count(),
        );

        info!(
            "running {} cells from t = {start} to t = {end} in {n_steps} steps",
            self.topology.cell_count()
        );
        self.run_state = RunState::Running;
        for step in 0..n_steps {
            if options.cancel.is_some_and(|cancel| cancel()) {
                return Err(self.abort(&checkpoint, start, SimError::Cancelled));
            }
            let t = time_at(step);
            let next = time_at(step + 1);
            let h = next - t;
            self.prepare(&mut stepper, pool.as_ref(), t);
            if logger.take_due(next) {
                logger.sample(t, self.store.all(), &stepper);
            }
            let advanced = {
                let (current, next) = self.store.buffers();
                let (model, topology, policy) = (&self.model, &self.topology, self.substeps);
                install(pool.as_ref(), || {
                    stepper.advance(model, topology, policy, current, next, t, h)
                })
            };
            if let Err(err) = advanced {
                return Err(self.abort(&checkpoint, start, err));
            }
            self.store.swap();
            if let Some(progress) = options.progress.as_deref_mut() {
                let fraction = (step + 1) as f64 / n_steps as f64;
                if progress.update(fraction).is_break() {
                    return Err(self.abort(&checkpoint, start, SimError::Cancelled));
                }
            }
        }

        self.prepare(&mut stepper, pool.as_ref(), end);
        logger.sample(end, self.store.all(), &stepper);
        self.time = end;
        self.run_state = RunState::Completed;
        info!("run completed at t = {end}");
        Ok(logger.finish())
    }

    fn prepare(&self, stepper: &mut Stepper, pool: Option<&ThreadPool>, time: f64) {
        let level = self
            .protocol
            .as_ref()
            .map_or(0.0, |protocol| protocol.level_at(time));
        let paced = self.pacing.flags();
        let current = self.store.all();
        install(pool, || {
            stepper.prepare(&self.model, &self.topology, paced, level, current, time)
        });
    }

    fn abort(&mut self, checkpoint: &[f64], start: f64, err: SimError) -> SimError {
        self.run_state = match err {
            SimError::Cancelled => RunState::Cancelled,
            _ => RunState::Failed,
        };
        warn!("run aborted, rolling back to t = {start}: {err}");
        if let Err(restore) = self.store.set_all(checkpoint) {
            warn!("failed to restore state after aborted run: {restore}");
        }
        self.time = start;
        err
    }
}

fn install<R, F>(pool: Option<&ThreadPool>, op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}
