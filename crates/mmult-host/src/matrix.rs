//! Square integer matrices and the host-side reference multiply.

use crate::error::{HostError, Result};

/// A square `dim x dim` matrix of `i32`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    dim: usize,
    data: Vec<i32>,
}

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(dim: usize) -> Self {
        Self { dim, data: vec![0; dim * dim] }
    }

    /// Wrap an existing row-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::DimensionMismatch`] if `data.len() != dim * dim`.
    pub fn from_vec(dim: usize, data: Vec<i32>) -> Result<Self> {
        let expected = element_count(dim)?;
        if data.len() != expected {
            return Err(HostError::DimensionMismatch { expected, actual: data.len() });
        }
        Ok(Self { dim, data })
    }

    /// Test pattern used by the host program: element `i` is `i % modulus`.
    pub fn sequential_mod(dim: usize, modulus: i32) -> Self {
        let data = (0..dim * dim).map(|i| (i as i64 % i64::from(modulus)) as i32).collect();
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of elements (`dim * dim`).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the element storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<i32>()
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[row * self.dim + col]
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [i32] {
        &mut self.data
    }
}

/// Element count for a `dim x dim` matrix, rejecting overflow.
pub fn element_count(dim: usize) -> Result<usize> {
    dim.checked_mul(dim)
        .filter(|n| n.checked_mul(std::mem::size_of::<i32>()).is_some())
        .ok_or_else(|| HostError::InvalidConfig(format!("matrix dimension {dim} overflows")))
}

/// Host reference for the accelerator kernel: `C = A x B`.
///
/// Accumulation wraps on overflow, matching two's-complement device
/// arithmetic.
///
/// # Errors
///
/// Returns [`HostError::DimensionMismatch`] if the operands differ in size.
pub fn reference_multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.dim != b.dim {
        return Err(HostError::DimensionMismatch { expected: a.len(), actual: b.len() });
    }
    let n = a.dim;
    let mut out = Matrix::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let mut acc = 0i32;
            for k in 0..n {
                acc = acc.wrapping_add(a.data[i * n + k].wrapping_mul(b.data[k * n + j]));
            }
            out.data[i * n + j] = acc;
        }
    }
    Ok(out)
}
