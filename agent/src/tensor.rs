//! Row-major f32 buffer exchanged with the compute collaborators.
//!
//! `TensorBuffer` is the only tensor abstraction the routing engine needs:
//! a batch of `rows` vectors, each `width` wide. Arithmetic beyond the
//! weighted accumulation used by aggregation lives in the external kernels.

use crate::errors::{MoeError, Result};
use serde::{Deserialize, Serialize};

/// Batch of equally sized f32 vectors stored contiguously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorBuffer {
    data: Vec<f32>,
    rows: usize,
    width: usize,
}

impl TensorBuffer {
    /// Create a buffer from flattened data.
    ///
    /// # Errors
    /// Returns `InvalidDimension` if `data.len() != rows * width`.
    pub fn new(data: Vec<f32>, rows: usize, width: usize) -> Result<Self> {
        let expected = rows * width;
        if data.len() != expected {
            return Err(MoeError::InvalidDimension {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, rows, width })
    }

    /// Create a buffer of zeros
    pub fn zeros(rows: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; rows * width],
            rows,
            width,
        }
    }

    /// Stack rows of identical width into one buffer.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R], width: usize) -> Result<Self> {
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            let row = row.as_ref();
            if row.len() != width {
                return Err(MoeError::InvalidDimension {
                    expected: width,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            rows: rows.len(),
            width,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Borrow row `idx`.
    ///
    /// # Panics
    /// Panics if `idx >= rows`.
    pub fn row(&self, idx: usize) -> &[f32] {
        let start = idx * self.width;
        &self.data[start..start + self.width]
    }

    /// Mutably borrow row `idx`.
    pub fn row_mut(&mut self, idx: usize) -> &mut [f32] {
        let start = idx * self.width;
        &mut self.data[start..start + self.width]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        (0..self.rows).map(move |idx| self.row(idx))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// `acc += weight * values`, element-wise.
pub(crate) fn axpy(acc: &mut [f32], weight: f32, values: &[f32]) {
    for (a, v) in acc.iter_mut().zip(values) {
        *a += weight * v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_shape() {
        assert!(TensorBuffer::new(vec![1.0; 6], 2, 3).is_ok());
        let err = TensorBuffer::new(vec![1.0; 5], 2, 3).unwrap_err();
        assert!(matches!(
            err,
            MoeError::InvalidDimension {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_from_rows_and_row_access() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let buf = TensorBuffer::from_rows(&rows, 2).unwrap();
        assert_eq!(buf.rows(), 3);
        assert_eq!(buf.width(), 2);
        assert_eq!(buf.row(1), &[3.0, 4.0]);
        let collected: Vec<&[f32]> = buf.iter_rows().collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[2], &[5.0, 6.0]);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(TensorBuffer::from_rows(&rows, 2).is_err());
    }

    #[test]
    fn test_row_mut_and_axpy() {
        let mut buf = TensorBuffer::zeros(2, 3);
        axpy(buf.row_mut(1), 0.5, &[2.0, 4.0, 6.0]);
        axpy(buf.row_mut(1), 0.25, &[4.0, 4.0, 4.0]);
        assert_eq!(buf.row(0), &[0.0, 0.0, 0.0]);
        assert_eq!(buf.row(1), &[2.0, 3.0, 4.0]);
    }
}
