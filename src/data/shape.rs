//! Array shapes and slicers.
//!
//! Array cells are dense, laid out minor-axis-first: axis 0 varies
//! fastest, so `linear = pos[0] + pos[1]*shape[0] + ...`. Slicers select
//! a strided sub-rectangle of a cell.

use serde::{Deserialize, Serialize};

use crate::{Result, TableError};

/// Extent of a dense multidimensional array, one entry per axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub Vec<u64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<u64>>) -> Self {
        Shape(dims.into())
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn product(&self) -> u64 {
        self.0.iter().product()
    }

    pub fn dims(&self) -> &[u64] {
        &self.0
    }

    /// Per-axis strides for the minor-axis-first layout.
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![0u64; self.0.len()];
        let mut acc = 1u64;
        for (i, d) in self.0.iter().enumerate() {
            strides[i] = acc;
            acc *= d;
        }
        strides
    }

    /// Linear offset of `pos` within this shape.
    pub fn linear(&self, pos: &[u64]) -> u64 {
        debug_assert_eq!(pos.len(), self.0.len());
        let mut acc = 0u64;
        let mut stride = 1u64;
        for (i, d) in self.0.iter().enumerate() {
            debug_assert!(pos[i] < *d);
            acc += pos[i] * stride;
            stride *= d;
        }
        acc
    }

    /// Whether `pos` is a valid coordinate of this shape.
    pub fn contains(&self, pos: &[u64]) -> bool {
        pos.len() == self.0.len() && pos.iter().zip(&self.0).all(|(p, d)| p < d)
    }

    /// Append one axis (used by the shared-column tile layout, where the
    /// row dimension is the last axis of the cube).
    pub fn with_axis(&self, extent: u64) -> Shape {
        let mut dims = self.0.clone();
        dims.push(extent);
        Shape(dims)
    }

    /// Visit every coordinate of the shape in minor-axis-first order.
    ///
    /// The visitor receives a scratch coordinate slice that is reused
    /// between calls.
    pub fn for_each(&self, mut f: impl FnMut(&[u64]) -> Result<()>) -> Result<()> {
        if self.0.iter().any(|&d| d == 0) {
            return Ok(());
        }
        let mut pos = vec![0u64; self.0.len()];
        if self.0.is_empty() {
            return f(&pos);
        }
        loop {
            f(&pos)?;
            // Odometer increment, axis 0 fastest.
            let mut axis = 0;
            loop {
                pos[axis] += 1;
                if pos[axis] < self.0[axis] {
                    break;
                }
                pos[axis] = 0;
                axis += 1;
                if axis == self.0.len() {
                    return Ok(());
                }
            }
        }
    }
}

impl From<Vec<u64>> for Shape {
    fn from(dims: Vec<u64>) -> Self {
        Shape(dims)
    }
}

impl From<&[u64]> for Shape {
    fn from(dims: &[u64]) -> Self {
        Shape(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

/// Strided sub-rectangle of an array cell: per-axis start, length, and
/// stride. A stride of 1 selects consecutive elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slicer {
    pub start: Vec<u64>,
    pub length: Vec<u64>,
    pub stride: Vec<u64>,
}

impl Slicer {
    pub fn new(start: impl Into<Vec<u64>>, length: impl Into<Vec<u64>>) -> Self {
        let start = start.into();
        let length = length.into();
        let stride = vec![1; start.len()];
        Slicer { start, length, stride }
    }

    pub fn with_stride(
        start: impl Into<Vec<u64>>,
        length: impl Into<Vec<u64>>,
        stride: impl Into<Vec<u64>>,
    ) -> Self {
        Slicer { start: start.into(), length: length.into(), stride: stride.into() }
    }

    /// Whole-cell slicer.
    pub fn full(shape: &Shape) -> Self {
        Slicer::new(vec![0; shape.ndim()], shape.dims().to_vec())
    }

    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Shape of the selected result.
    pub fn result_shape(&self) -> Shape {
        Shape(self.length.clone())
    }

    /// Last selected coordinate per axis (inclusive).
    pub fn last(&self) -> Vec<u64> {
        self.start
            .iter()
            .zip(&self.length)
            .zip(&self.stride)
            .map(|((s, l), st)| s + l.saturating_sub(1) * st)
            .collect()
    }

    /// Check the slicer lies fully inside `cell_shape`.
    ///
    /// Reads that fall outside the cell are programming errors, reported
    /// as `ShapeMismatch`, never silently zero-filled.
    pub fn validate(&self, cell_shape: &Shape) -> Result<()> {
        if self.ndim() != cell_shape.ndim()
            || self.length.len() != self.ndim()
            || self.stride.len() != self.ndim()
        {
            return Err(TableError::ShapeMismatch(format!(
                "slicer dimensionality {} does not match cell shape {cell_shape}",
                self.ndim()
            )));
        }
        if self.stride.iter().any(|&s| s == 0) {
            return Err(TableError::ShapeMismatch("slicer stride of 0".into()));
        }
        for (axis, last) in self.last().iter().enumerate() {
            let extent = cell_shape.dims()[axis];
            if self.length[axis] > 0 && *last >= extent {
                return Err(TableError::ShapeMismatch(format!(
                    "slice reaches {last} on axis {axis}, cell extent is {extent}"
                )));
            }
        }
        Ok(())
    }

    /// Visit every selected cell coordinate together with its linear
    /// offset in the result array, in minor-axis-first result order.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&[u64], u64) -> Result<()>,
    ) -> Result<()> {
        let result = Shape(self.length.clone());
        let mut cell_pos = vec![0u64; self.ndim()];
        let mut out_index = 0u64;
        result.for_each(|res_pos| {
            for axis in 0..res_pos.len() {
                cell_pos[axis] = self.start[axis] + res_pos[axis] * self.stride[axis];
            }
            let r = f(&cell_pos, out_index);
            out_index += 1;
            r
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_minor_axis_first() {
        let shape = Shape::new(vec![15, 21]);
        assert_eq!(shape.linear(&[0, 0]), 0);
        assert_eq!(shape.linear(&[1, 0]), 1);
        assert_eq!(shape.linear(&[0, 1]), 15);
        assert_eq!(shape.linear(&[2, 3]), 2 + 3 * 15);
    }

    #[test]
    fn test_for_each_order() {
        let shape = Shape::new(vec![2, 3]);
        let mut seen = Vec::new();
        shape
            .for_each(|pos| {
                seen.push(pos.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 0]);
        assert_eq!(seen[1], vec![1, 0]);
        assert_eq!(seen[2], vec![0, 1]);
        assert_eq!(seen[5], vec![1, 2]);
    }

    #[test]
    fn test_slicer_validate() {
        let cell = Shape::new(vec![15, 21]);
        assert!(Slicer::new(vec![2, 3], vec![10, 15]).validate(&cell).is_ok());
        // 2 + 14 = 16 > 14: off the end of axis 0.
        assert!(Slicer::new(vec![2, 3], vec![14, 15]).validate(&cell).is_err());
        assert!(Slicer::new(vec![0], vec![1]).validate(&cell).is_err());
    }

    #[test]
    fn test_slicer_strided_walk() {
        let slicer = Slicer::with_stride(vec![1], vec![3], vec![2]);
        let mut cells = Vec::new();
        slicer
            .for_each(|pos, out| {
                cells.push((pos[0], out));
                Ok(())
            })
            .unwrap();
        assert_eq!(cells, vec![(1, 0), (3, 1), (5, 2)]);
    }

    #[test]
    fn test_empty_shape_is_scalar() {
        let shape = Shape::scalar();
        assert_eq!(shape.product(), 1);
        let mut calls = 0;
        shape
            .for_each(|_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 1);
    }
}
