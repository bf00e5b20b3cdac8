use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::error::ContinuationError;

/// Interface implemented by any underdetermined system F(X) = 0 whose solution
/// curve can be traced.
///
/// With N unknowns the residual supplies N - 1 equations; the missing equation
/// is the engine's local parameterization.
pub trait CurveFunction {
    /// Number of unknowns N (at least 2).
    fn dimension(&self) -> usize;

    /// Evaluate the (N - 1)-vector of residuals at `x` into `out`.
    fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    /// Evaluate the (N - 1) x N Jacobian at `x`, or return `Ok(None)` to ask
    /// the engine for a finite-difference approximation.
    fn jacobian(&mut self, _x: &DVector<f64>) -> Result<Option<JacobianMatrix>> {
        Ok(None)
    }
}

/// Jacobian of the residual in one of the two supported storage layouts.
#[derive(Debug, Clone)]
pub enum JacobianMatrix {
    Dense(DMatrix<f64>),
    Banded(BandedJacobian),
}

/// Band storage with a full final column.
///
/// Columns `0..n-2` are banded with lower bandwidth `ml` and upper bandwidth
/// `mu`; the final column is dense because it usually carries the problem
/// parameter and couples into every equation.
#[derive(Debug, Clone)]
pub struct BandedJacobian {
    pub ml: usize,
    pub mu: usize,
    /// (ml + mu + 1) x (n - 1) storage; entry (i, j) of the Jacobian lives at
    /// `bands[(mu + i - j, j)]`.
    pub bands: DMatrix<f64>,
    /// Full final column, one entry per equation.
    pub last_col: DVector<f64>,
}

impl BandedJacobian {
    /// Jacobian entry (i, j), zero outside the band.
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        if j == self.bands.ncols() {
            return self.last_col[i];
        }
        let offset = self.mu as isize + i as isize - j as isize;
        if offset < 0 || offset >= self.bands.nrows() as isize {
            0.0
        } else {
            self.bands[(offset as usize, j)]
        }
    }
}

impl JacobianMatrix {
    /// Number of equations (N - 1).
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(m) => m.nrows(),
            Self::Banded(b) => b.last_col.len(),
        }
    }

    /// Number of unknowns N.
    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(m) => m.ncols(),
            Self::Banded(b) => b.bands.ncols() + 1,
        }
    }

    pub fn entry(&self, i: usize, j: usize) -> f64 {
        match self {
            Self::Dense(m) => m[(i, j)],
            Self::Banded(b) => b.entry(i, j),
        }
    }

    /// Expand into dense storage.
    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Self::Dense(m) => m.clone(),
            Self::Banded(b) => {
                let rows = self.nrows();
                let cols = self.ncols();
                let mut dense = DMatrix::zeros(rows, cols);
                for i in 0..rows {
                    for j in 0..cols {
                        dense[(i, j)] = b.entry(i, j);
                    }
                }
                dense
            }
        }
    }

    /// Check the storage against the problem dimension `n`.
    pub fn validate(&self, n: usize) -> Result<(), ContinuationError> {
        let (rows, cols) = (self.nrows(), self.ncols());
        if rows + 1 != n || cols != n {
            return Err(ContinuationError::InvalidInput(format!(
                "Jacobian shape {}x{} does not match dimension {} (expected {}x{})",
                rows,
                cols,
                n,
                n - 1,
                n
            )));
        }
        if let Self::Banded(b) = self {
            if b.bands.nrows() != b.ml + b.mu + 1 {
                return Err(ContinuationError::InvalidInput(format!(
                    "band storage has {} rows, expected ml + mu + 1 = {}",
                    b.bands.nrows(),
                    b.ml + b.mu + 1
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tridiagonal_banded() -> BandedJacobian {
        // 3 equations, 4 unknowns, ml = mu = 1
        let mut bands = DMatrix::zeros(3, 3);
        for j in 0..3usize {
            for i in 0..3usize {
                let offset = 1 + i as isize - j as isize;
                if (0..3).contains(&offset) {
                    bands[(offset as usize, j)] = (10 * i + j + 1) as f64;
                }
            }
        }
        BandedJacobian {
            ml: 1,
            mu: 1,
            bands,
            last_col: DVector::from_vec(vec![0.5, -0.5, 2.0]),
        }
    }

    #[test]
    fn banded_entries_match_dense_expansion() {
        let banded = JacobianMatrix::Banded(tridiagonal_banded());
        let dense = banded.to_dense();
        assert_eq!(dense.nrows(), 3);
        assert_eq!(dense.ncols(), 4);
        for i in 0..3 {
            for j in 0..4 {
                assert_eq!(dense[(i, j)], banded.entry(i, j));
            }
        }
        // outside the band
        assert_eq!(banded.entry(0, 2), 0.0);
        assert_eq!(banded.entry(2, 0), 0.0);
        // full final column
        assert_eq!(banded.entry(2, 3), 2.0);
    }

    #[test]
    fn validate_rejects_shape_mismatch() {
        let dense = JacobianMatrix::Dense(DMatrix::zeros(2, 4));
        let err = dense.validate(4).expect_err("expected shape error");
        assert!(format!("{err}").contains("does not match dimension"));
    }

    #[test]
    fn validate_accepts_consistent_banded_layout() {
        let banded = JacobianMatrix::Banded(tridiagonal_banded());
        banded.validate(4).expect("layout should validate");
    }
}
