use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::SimError;

/// Cell layout of a simulation, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    Linear(usize),
    /// `(nx, ny)`, stored row-major: flat index `y * nx + x`.
    Grid(usize, usize),
    /// `n` cells coupled only through explicit connections.
    Graph(usize),
}

impl Shape {
    pub fn cell_count(&self) -> usize {
        match *self {
            Shape::Scalar => 1,
            Shape::Linear(n) | Shape::Graph(n) => n,
            Shape::Grid(nx, ny) => nx * ny,
        }
    }

    pub fn is_2d(&self) -> bool {
        matches!(self, Shape::Grid(..))
    }

    fn dimensions(&self) -> usize {
        if self.is_2d() {
            2
        } else {
            1
        }
    }
}

/// A validated cell address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cell {
    Index(usize),
    Xy(usize, usize),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Index(idx) => write!(f, "{idx}"),
            Cell::Xy(x, y) => write!(f, "{x}.{y}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub a: usize,
    pub b: usize,
    pub conductance: f64,
}

/// Compressed neighbor lists: row `i` is `targets[offsets[i]..offsets[i + 1]]`.
#[derive(Clone, Debug, Default)]
pub(crate) struct Adjacency {
    offsets: Vec<usize>,
    targets: Vec<usize>,
    weights: Vec<f64>,
}

impl Adjacency {
    fn from_rows(mut rows: Vec<Vec<(usize, f64)>>) -> Self {
        let total = rows.iter().map(Vec::len).sum();
        let mut adjacency = Self {
            offsets: Vec::with_capacity(rows.len() + 1),
            targets: Vec::with_capacity(total),
            weights: Vec::with_capacity(total),
        };
        adjacency.offsets.push(0);
        for row in rows.iter_mut() {
            row.sort_by_key(|&(target, _)| target);
            for &(target, weight) in row.iter() {
                adjacency.targets.push(target);
                adjacency.weights.push(weight);
            }
            adjacency.offsets.push(adjacency.targets.len());
        }
        adjacency
    }

    pub(crate) fn row(&self, cell: usize) -> (&[usize], &[f64]) {
        let range = self.offsets[cell]..self.offsets[cell + 1];
        (&self.targets[range.clone()], &self.weights[range])
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn relation_count(&self) -> usize {
        self.targets.len()
    }
}

#[derive(Clone, Debug)]
pub struct Topology {
    shape: Shape,
    gx: f64,
    gy: f64,
    connections: Vec<Connection>,
    adjacency: Adjacency,
}

impl Topology {
    pub fn new(shape: Shape) -> Result<Self, SimError> {
        let empty = match shape {
            Shape::Scalar => false,
            Shape::Linear(n) | Shape::Graph(n) => n == 0,
            Shape::Grid(nx, ny) => nx == 0 || ny == 0,
        };
        if empty {
            return Err(SimError::InvalidArgument(format!(
                "{shape:?} must contain at least one cell"
            )));
        }
        let mut topology = Self {
            shape,
            gx: 1.0,
            gy: 1.0,
            connections: Vec::new(),
            adjacency: Adjacency::default(),
        };
        topology.rebuild();
        Ok(topology)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn cell_count(&self) -> usize {
        self.shape.cell_count()
    }

    pub fn is_2d(&self) -> bool {
        self.shape.is_2d()
    }

    /// Validates an address against the shape and returns its flat index.
    pub fn resolve(&self, addr: &[i64]) -> Result<usize, SimError> {
        if addr.len() != self.shape.dimensions() {
            return Err(SimError::DimensionMismatch(format!(
                "topology is {}-dimensional, got a {}-dimensional address",
                self.shape.dimensions(),
                addr.len()
            )));
        }
        match (self.shape, addr) {
            (Shape::Grid(nx, ny), &[x, y]) => {
                let x = check_index(x, nx, "x")?;
                let y = check_index(y, ny, "y")?;
                Ok(y * nx + x)
            }
            (_, &[idx]) => check_index(idx, self.cell_count(), "cell index"),
            _ => unreachable!("address arity checked above"),
        }
    }

    pub fn cell(&self, idx: usize) -> Cell {
        match self.shape {
            Shape::Grid(nx, _) => Cell::Xy(idx % nx, idx / nx),
            _ => Cell::Index(idx),
        }
    }

    pub fn neighbors(&self, addr: &[i64]) -> Result<Vec<Cell>, SimError> {
        let idx = self.resolve(addr)?;
        let (targets, _) = self.adjacency.row(idx);
        Ok(targets.iter().map(|&target| self.cell(target)).collect())
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Replaces the connection set of a `Graph` topology.
    ///
    /// Edges are `(a, b, conductance)`. Nothing changes unless every edge is
    /// valid.
    pub fn set_connections(&mut self, edges: &[(i64, i64, f64)]) -> Result<(), SimError> {
        let Shape::Graph(n) = self.shape else {
            return Err(SimError::InvalidArgument(format!(
                "connections can only be set on a graph topology, not {:?}",
                self.shape
            )));
        };
        let mut seen = HashSet::with_capacity(edges.len());
        let mut connections = Vec::with_capacity(edges.len());
        for &(a, b, conductance) in edges {
            let invalid = || SimError::InvalidConnection(format!("({a}, {b}, {conductance})"));
            let a = usize::try_from(a).ok().filter(|&a| a < n).ok_or_else(invalid)?;
            let b = usize::try_from(b).ok().filter(|&b| b < n).ok_or_else(invalid)?;
            if a == b || !conductance.is_finite() || conductance <= 0.0 {
                return Err(invalid());
            }
            if !seen.insert((a.min(b), a.max(b))) {
                return Err(SimError::DuplicateConnection(format!("({a}, {b})")));
            }
            connections.push(Connection { a, b, conductance });
        }
        debug!("setting {} connections on {n} cells", connections.len());
        self.connections = connections;
        self.rebuild();
        Ok(())
    }

    pub fn conductance(&self) -> (f64, f64) {
        (self.gx, self.gy)
    }

    pub fn set_conductance(&mut self, g: f64) -> Result<(), SimError> {
        self.set_conductance_xy(g, g)
    }

    /// Conductances of the implicit grid: `gx` between horizontal (or linear)
    /// neighbors, `gy` between vertical ones.
    pub fn set_conductance_xy(&mut self, gx: f64, gy: f64) -> Result<(), SimError> {
        if !gx.is_finite() || !gy.is_finite() || gx < 0.0 || gy < 0.0 {
            return Err(SimError::InvalidArgument(format!(
                "conductances must be finite and non-negative, got ({gx}, {gy})"
            )));
        }
        self.gx = gx;
        self.gy = gy;
        self.rebuild();
        Ok(())
    }

    pub(crate) fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    fn rebuild(&mut self) {
        let n = self.cell_count();
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        match self.shape {
            Shape::Scalar => {}
            Shape::Linear(_) => {
                for idx in 1..n {
                    rows[idx - 1].push((idx, self.gx));
                    rows[idx].push((idx - 1, self.gx));
                }
            }
            Shape::Grid(nx, ny) => {
                for y in 0..ny {
                    for x in 0..nx {
                        let idx = y * nx + x;
                        if x + 1 < nx {
                            rows[idx].push((idx + 1, self.gx));
                            rows[idx + 1].push((idx, self.gx));
                        }
                        if y + 1 < ny {
                            rows[idx].push((idx + nx, self.gy));
                            rows[idx + nx].push((idx, self.gy));
                        }
                    }
                }
            }
            Shape::Graph(_) => {
                for connection in &self.connections {
                    rows[connection.a].push((connection.b, connection.conductance));
                    rows[connection.b].push((connection.a, connection.conductance));
                }
            }
        }
        self.adjacency = Adjacency::from_rows(rows);
    }
}

fn check_index(value: i64, len: usize, what: &str) -> Result<usize, SimError> {
    usize::try_from(value)
        .ok()
        .filter(|&idx| idx < len)
        .ok_or_else(|| SimError::OutOfRange(format!("{what} {value} out of range [0, {len})")))
}
