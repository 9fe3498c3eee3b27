use log::warn;
use numpy::PyArray1;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::cell::Cell;
use std::mem;
use std::ops::ControlFlow;

use crate::{
    Cell as Address, CellModel, ExpressionModel, ExpressionModelBuilder, Protocol, RunOptions, Shape,
    SimError, Simulation,
};

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        match err {
            SimError::Cancelled => PyRuntimeError::new_err(err.to_string()),
            err => PyValueError::new_err(err.to_string()),
        }
    }
}

/// An error raised on the Python side during a run (a signal or a failing
/// callback) takes precedence over the cancellation it caused.
pub(crate) fn raise_pending<T>(result: Result<T, SimError>, pending: Option<PyErr>) -> PyResult<T> {
    match pending {
        Some(err) => Err(err),
        None => result.map_err(PyErr::from),
    }
}

fn address(obj: &Bound<'_, PyAny>) -> PyResult<Vec<i64>> {
    match obj.extract::<i64>() {
        Ok(idx) => Ok(vec![idx]),
        Err(_) => obj.extract::<Vec<i64>>(),
    }
}

fn cell_object(py: Python<'_>, cell: Address) -> PyResult<Py<PyAny>> {
    Ok(match cell {
        Address::Index(idx) => idx.into_pyobject(py)?.into_any().unbind(),
        Address::Xy(x, y) => (x, y).into_pyobject(py)?.into_any().unbind(),
    })
}

fn shape_from(ncells: Option<Vec<usize>>, graph: bool) -> Result<Shape, SimError> {
    match (ncells.as_deref(), graph) {
        (None, false) => Ok(Shape::Scalar),
        (Some(&[n]), false) => Ok(Shape::Linear(n)),
        (Some(&[n]), true) => Ok(Shape::Graph(n)),
        (Some(&[nx, ny]), false) => Ok(Shape::Grid(nx, ny)),
        (cells, _) => Err(SimError::InvalidArgument(format!(
            "unsupported cell layout {cells:?} (graph = {graph})"
        ))),
    }
}

/// Python-side builder for an [`ExpressionModel`].
#[pyclass(name = "Model", module = "cellnet")]
#[derive(Clone)]
pub struct PyModel {
    builder: ExpressionModelBuilder,
}

#[pymethods]
impl PyModel {
    #[new]
    #[pyo3(signature = (time="engine.time"))]
    fn new(time: &str) -> Self {
        Self {
            builder: ExpressionModel::builder(time),
        }
    }

    fn pace(&mut self, name: &str) {
        self.builder = mem::take(&mut self.builder).pace(name);
    }

    fn diffusion(&mut self, name: &str) {
        self.builder = mem::take(&mut self.builder).diffusion(name);
    }

    #[pyo3(signature = (name, initial, rhs=None))]
    fn state(&mut self, name: &str, initial: f64, rhs: Option<&str>) {
        self.builder = mem::take(&mut self.builder).state(name, initial, rhs);
    }

    #[pyo3(signature = (name, rhs=None))]
    fn variable(&mut self, name: &str, rhs: Option<&str>) {
        self.builder = mem::take(&mut self.builder).variable(name, rhs);
    }

    fn coupling_state(&mut self, name: &str) {
        self.builder = mem::take(&mut self.builder).coupling_state(name);
    }

    /// Reasons the model cannot be simulated; empty when it is valid.
    fn problems(&self) -> PyResult<Vec<String>> {
        let model = self.builder.clone().build().map_err(SimError::from)?;
        Ok(model.problems().to_vec())
    }
}

#[pyclass(name = "Protocol", module = "cellnet")]
#[derive(Clone, Default)]
pub struct PyProtocol {
    inner: Protocol,
}

#[pymethods]
impl PyProtocol {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    #[pyo3(signature = (level, start, duration, period=0.0, multiplier=0))]
    fn schedule(
        &mut self,
        level: f64,
        start: f64,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> PyResult<()> {
        self.inner
            .schedule(level, start, duration, period, multiplier)
            .map_err(PyErr::from)
    }

    fn level_at(&self, time: f64) -> f64 {
        self.inner.level_at(time)
    }

    fn __len__(&self) -> usize {
        self.inner.events().len()
    }
}

#[pyclass(name = "Simulation", module = "cellnet")]
pub struct PySimulation {
    inner: Simulation<ExpressionModel>,
}

#[pymethods]
impl PySimulation {
    #[new]
    #[pyo3(signature = (model, protocol=None, ncells=None, graph=false))]
    fn new(
        model: PyRef<'_, PyModel>,
        protocol: Option<PyRef<'_, PyProtocol>>,
        ncells: Option<Vec<usize>>,
        graph: bool,
    ) -> PyResult<Self> {
        let shape = shape_from(ncells, graph)?;
        let model = model.builder.clone().build().map_err(SimError::from)?;
        let protocol = protocol.map(|protocol| protocol.inner.clone());
        Ok(Self {
            inner: Simulation::new(model, protocol, shape)?,
        })
    }

    fn is_2d(&self) -> bool {
        self.inner.is_2d()
    }

    fn time(&self) -> f64 {
        self.inner.time()
    }

    fn set_time(&mut self, time: f64) -> PyResult<()> {
        Ok(self.inner.set_time(time)?)
    }

    fn step_size(&self) -> f64 {
        self.inner.step_size()
    }

    fn set_step_size(&mut self, step_size: f64) -> PyResult<()> {
        Ok(self.inner.set_step_size(step_size)?)
    }

    #[pyo3(signature = (threads=None))]
    fn set_threads(&mut self, threads: Option<usize>) -> PyResult<()> {
        Ok(self.inner.set_threads(threads)?)
    }

    #[pyo3(signature = (protocol=None))]
    fn set_protocol(&mut self, protocol: Option<PyRef<'_, PyProtocol>>) {
        self.inner
            .set_protocol(protocol.map(|protocol| protocol.inner.clone()));
    }

    #[pyo3(signature = (gx, gy=None))]
    fn set_conductance(&mut self, gx: f64, gy: Option<f64>) -> PyResult<()> {
        match gy {
            Some(gy) => Ok(self.inner.set_conductance_xy(gx, gy)?),
            None => Ok(self.inner.set_conductance(gx)?),
        }
    }

    fn conductance(&self) -> (f64, f64) {
        self.inner.conductance()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn neighbors(&self, py: Python<'_>, cell: &Bound<'_, PyAny>) -> PyResult<Vec<Py<PyAny>>> {
        self.inner
            .neighbors(&address(cell)?)?
            .into_iter()
            .map(|cell| cell_object(py, cell))
            .collect()
    }

    fn set_connections(&mut self, connections: Vec<(i64, i64, f64)>) -> PyResult<()> {
        Ok(self.inner.set_connections(&connections)?)
    }

    fn connections(&self) -> Vec<(usize, usize, f64)> {
        self.inner
            .connections()
            .iter()
            .map(|conn| (conn.a, conn.b, conn.conductance))
            .collect()
    }

    fn set_paced_cells(&mut self, counts: Vec<i64>, offsets: Vec<i64>) -> PyResult<()> {
        Ok(self.inner.set_paced_cells(&counts, &offsets)?)
    }

    fn set_paced_cell_list(&mut self, cells: Vec<Bound<'_, PyAny>>) -> PyResult<()> {
        let cells = cells
            .iter()
            .map(address)
            .collect::<PyResult<Vec<_>>>()?;
        Ok(self.inner.set_paced_cell_list(cells)?)
    }

    fn is_paced(&self, cell: &Bound<'_, PyAny>) -> PyResult<bool> {
        Ok(self.inner.is_paced(&address(cell)?)?)
    }

    fn paced_cells(&self, py: Python<'_>) -> PyResult<Vec<Py<PyAny>>> {
        self.inner
            .paced_cells()
            .into_iter()
            .map(|cell| cell_object(py, cell))
            .collect()
    }

    #[pyo3(signature = (cell=None))]
    fn state<'py>(
        &self,
        py: Python<'py>,
        cell: Option<&Bound<'py, PyAny>>,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        let addr = cell.map(address).transpose()?;
        let state = self.inner.state(addr.as_deref())?;
        Ok(PyArray1::from_slice(py, &state))
    }

    #[pyo3(signature = (state, cell=None))]
    fn set_state(&mut self, state: Vec<f64>, cell: Option<&Bound<'_, PyAny>>) -> PyResult<()> {
        let addr = cell.map(address).transpose()?;
        Ok(self.inner.set_state(&state, addr.as_deref())?)
    }

    fn set_state_all(&mut self, state: Vec<f64>) -> PyResult<()> {
        Ok(self.inner.set_state_all(&state)?)
    }

    fn default_state<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_slice(py, &self.inner.default_state())
    }

    fn state_names(&self) -> Vec<String> {
        self.inner.model().state_names().to_vec()
    }

    /// Runs for `duration` and returns a dict of numpy arrays keyed by
    /// variable. `progress` is called with the completed fraction after every
    /// step; returning `False` cancels the run.
    #[pyo3(signature = (duration, log=None, log_interval=None, progress=None))]
    fn run(
        &mut self,
        py: Python<'_>,
        duration: f64,
        log: Option<Vec<String>>,
        log_interval: Option<f64>,
        progress: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyDict>> {
        let names = log.unwrap_or_default();
        let sim = &mut self.inner;
        let (result, pending) = py.detach(|| {
            let mut callback_error: Option<PyErr> = None;
            let interrupt: Cell<Option<PyErr>> = Cell::new(None);
            let cancel = || {
                Python::attach(|py| match py.check_signals() {
                    Ok(()) => false,
                    Err(err) => {
                        interrupt.set(Some(err));
                        true
                    }
                })
            };
            let mut report = |fraction: f64| {
                let Some(callback) = progress.as_ref() else {
                    return ControlFlow::Continue(());
                };
                Python::attach(|py| match callback.call1(py, (fraction,)) {
                    Ok(value) if matches!(value.extract::<bool>(py), Ok(false)) => {
                        ControlFlow::Break(())
                    }
                    Ok(_) => ControlFlow::Continue(()),
                    Err(err) => {
                        warn!("progress callback raised, cancelling run");
                        callback_error = Some(err);
                        ControlFlow::Break(())
                    }
                })
            };
            let mut options = RunOptions::new()
                .log(names)
                .log_interval(log_interval)
                .cancel(&cancel);
            if progress.is_some() {
                options = options.progress(&mut report);
            }
            let result = sim.run(duration, options);
            (result, interrupt.take().or(callback_error))
        });
        let log = raise_pending(result, pending)?;
        let dict = PyDict::new(py);
        for (key, values) in log.iter() {
            dict.set_item(key, PyArray1::from_slice(py, values))?;
        }
        Ok(dict.unbind())
    }
}

#[pymodule]
fn cellnet(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyModel>()?;
    module.add_class::<PyProtocol>()?;
    module.add_class::<PySimulation>()?;
    Ok(())
}
