use log::debug;
use std::ops::Range;

use crate::error::SimError;
use crate::topology::{Cell, Shape, Topology};

/// Cells that receive the protocol's stimulus, stored as one flag per cell.
#[derive(Clone, Debug)]
pub struct PacingSet {
    paced: Vec<bool>,
}

impl PacingSet {
    /// Paces the first cell (`0`, or `(0, 0)` on a grid).
    pub fn new(topology: &Topology) -> Self {
        let mut paced = vec![false; topology.cell_count()];
        paced[0] = true;
        Self { paced }
    }

    /// Paces a contiguous block per dimension, replacing the current set.
    ///
    /// `counts` and `offsets` hold one entry per dimension. A negative offset
    /// counts from the end; a negative count selects the `|count|` cells
    /// before the offset, where an offset of zero then means the end. Blocks
    /// are clipped to the topology.
    pub fn set_range(
        &mut self,
        topology: &Topology,
        counts: &[i64],
        offsets: &[i64],
    ) -> Result<(), SimError> {
        let dims = if topology.is_2d() { 2 } else { 1 };
        if counts.len() != dims || offsets.len() != dims {
            return Err(SimError::DimensionMismatch(format!(
                "topology is {dims}-dimensional, got {} counts and {} offsets",
                counts.len(),
                offsets.len()
            )));
        }
        let mut paced = vec![false; topology.cell_count()];
        match topology.shape() {
            Shape::Grid(nx, ny) => {
                let xs = resolve_block(counts[0], offsets[0], nx);
                let ys = resolve_block(counts[1], offsets[1], ny);
                for y in ys {
                    for x in xs.clone() {
                        paced[y * nx + x] = true;
                    }
                }
            }
            shape => {
                for idx in resolve_block(counts[0], offsets[0], shape.cell_count()) {
                    paced[idx] = true;
                }
            }
        }
        debug!(
            "paced block counts={counts:?} offsets={offsets:?}: {} cells",
            paced.iter().filter(|&&flag| flag).count()
        );
        self.paced = paced;
        Ok(())
    }

    /// Replaces the set with the given addresses. Duplicates collapse; any
    /// invalid address leaves the set untouched.
    pub fn set_list<I, A>(&mut self, topology: &Topology, cells: I) -> Result<(), SimError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[i64]>,
    {
        let mut paced = vec![false; topology.cell_count()];
        for addr in cells {
            paced[topology.resolve(addr.as_ref())?] = true;
        }
        self.paced = paced;
        Ok(())
    }

    pub fn is_paced(&self, topology: &Topology, addr: &[i64]) -> Result<bool, SimError> {
        Ok(self.paced[topology.resolve(addr)?])
    }

    pub fn cells(&self, topology: &Topology) -> Vec<Cell> {
        self.paced
            .iter()
            .enumerate()
            .filter(|(_, &flag)| flag)
            .map(|(idx, _)| topology.cell(idx))
            .collect()
    }

    pub(crate) fn flags(&self) -> &[bool] {
        &self.paced
    }
}

/// Resolves one dimension of a paced block.
///
/// | count | offset | block |
/// |-------|--------|-------|
/// | c >= 0 | o >= 0 | `[o, o + c)` |
/// | c >= 0 | o < 0  | `[n + o, n + o + c)` |
/// | c < 0  | o > 0  | `[o + c, o)` |
/// | c < 0  | o <= 0 | `[n + o + c, n + o)` |
fn resolve_block(count: i64, offset: i64, len: usize) -> Range<usize> {
    let n = len as i64;
    let origin = if offset < 0 || (offset == 0 && count < 0) {
        offset.saturating_add(n)
    } else {
        offset
    };
    let (lo, hi) = if count < 0 {
        (origin.saturating_add(count), origin)
    } else {
        (origin, origin.saturating_add(count))
    };
    let lo = lo.clamp(0, n) as usize;
    let hi = hi.clamp(0, n) as usize;
    lo..hi.max(lo)
}
