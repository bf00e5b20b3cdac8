//! Bordered linear solvers.
//!
//! The continuation engine repeatedly solves the N x N augmented system made
//! of the N - 1 Jacobian rows plus one unit border row that pins the held
//! coordinate. Two implementations are provided: a dense LU and a band LU
//! that exploits the banded-plus-full-last-column Jacobian layout.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::problem::{BandedJacobian, JacobianMatrix};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("bordered matrix is numerically singular")]
    Singular,
}

/// Solution of one bordered system.
#[derive(Debug, Clone)]
pub struct BorderedSolution {
    pub solution: DVector<f64>,
    /// Sign of the determinant of the bordered matrix.
    pub det_sign: i8,
    /// Smallest over largest pivot magnitude; a successful solve with a tiny
    /// ratio signals ill conditioning, which is distinct from singularity.
    pub pivot_ratio: f64,
}

/// Factor the bordered matrix for a held coordinate and solve one right-hand
/// side.
pub trait BorderedSolver {
    fn solve_bordered(
        &mut self,
        jacobian: &JacobianMatrix,
        held: usize,
        rhs: &DVector<f64>,
    ) -> Result<BorderedSolution, SolveError>;
}

/// Dense LU over the fully assembled bordered matrix.
#[derive(Debug, Default)]
pub struct DenseSolver;

impl BorderedSolver for DenseSolver {
    fn solve_bordered(
        &mut self,
        jacobian: &JacobianMatrix,
        held: usize,
        rhs: &DVector<f64>,
    ) -> Result<BorderedSolution, SolveError> {
        solve_dense(&jacobian.to_dense(), held, rhs)
    }
}

/// Band LU with a Schur-complement step for the full final column.
///
/// Dense Jacobians are accepted and routed through the dense path, so a run
/// can mix providers without reconfiguring the solver.
#[derive(Debug, Default)]
pub struct BandedSolver;

impl BorderedSolver for BandedSolver {
    fn solve_bordered(
        &mut self,
        jacobian: &JacobianMatrix,
        held: usize,
        rhs: &DVector<f64>,
    ) -> Result<BorderedSolution, SolveError> {
        match jacobian {
            JacobianMatrix::Dense(dense) => solve_dense(dense, held, rhs),
            JacobianMatrix::Banded(banded) => solve_banded(banded, held, rhs),
        }
    }
}

fn solve_dense(
    jacobian: &DMatrix<f64>,
    held: usize,
    rhs: &DVector<f64>,
) -> Result<BorderedSolution, SolveError> {
    let n = jacobian.ncols();
    let mut a = DMatrix::zeros(n, n);
    a.view_mut((0, 0), (n - 1, n)).copy_from(jacobian);
    a[(n - 1, held)] = 1.0;

    let lu = a.lu();
    let upper = lu.u();
    let mut min_pivot = f64::INFINITY;
    let mut max_pivot = 0.0f64;
    for i in 0..n {
        let d = upper[(i, i)].abs();
        min_pivot = min_pivot.min(d);
        max_pivot = max_pivot.max(d);
    }
    if min_pivot == 0.0 || !min_pivot.is_finite() {
        return Err(SolveError::Singular);
    }
    let det = lu.determinant();
    if det == 0.0 || !det.is_finite() {
        return Err(SolveError::Singular);
    }
    let solution = lu.solve(rhs).ok_or(SolveError::Singular)?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(SolveError::Singular);
    }
    Ok(BorderedSolution {
        solution,
        det_sign: if det > 0.0 { 1 } else { -1 },
        pivot_ratio: min_pivot / max_pivot,
    })
}

/// Solve the bordered system for a banded Jacobian.
///
/// The border row `e_held` fixes one solution component outright, so the
/// bordered solve reduces to the (N - 1) x (N - 1) system obtained by
/// deleting column `held`. That reduced matrix is banded except (when the
/// held coordinate is not the last one) for a single full trailing column,
/// which is folded in through a Schur complement on the band factorization.
fn solve_banded(
    jacobian: &BandedJacobian,
    held: usize,
    rhs: &DVector<f64>,
) -> Result<BorderedSolution, SolveError> {
    let m = jacobian.last_col.len();
    let n = m + 1;
    let held_value = rhs[m];

    // Move the held column to the right-hand side.
    let mut reduced_rhs = DVector::zeros(m);
    for i in 0..m {
        reduced_rhs[i] = rhs[i] - jacobian.entry(i, held) * held_value;
    }

    // Reduced column `c` maps back to Jacobian column `source(c)`.
    let source = |c: usize| if c < held { c } else { c + 1 };
    // Expanding the determinant along the border row.
    let parity: i8 = if (m + held) % 2 == 0 { 1 } else { -1 };

    let (z, det_sign, min_pivot, max_pivot) = if held == n - 1 {
        // Deleting the last column leaves a purely banded matrix; band LU
        // with partial pivoting handles every nonsingular one.
        let lu = BandLu::factor(m, jacobian.ml, jacobian.mu, |i, c| jacobian.entry(i, c))?;
        let z = lu.solve(&reduced_rhs);
        (z, lu.det_sign, lu.min_pivot, lu.max_pivot)
    } else {
        match schur_bordered(jacobian, &source, &reduced_rhs) {
            Ok(parts) => parts,
            // The Schur split pivots only inside the leading block, so it can
            // fail on an elimination order the full bordered matrix survives.
            // Singularity must be a property of the matrix, not the ordering:
            // re-solve densely before concluding anything.
            Err(SolveError::Singular) => {
                let dense = JacobianMatrix::Banded(jacobian.clone()).to_dense();
                return solve_dense(&dense, held, rhs);
            }
        }
    };

    let mut solution = DVector::zeros(n);
    for c in 0..m {
        solution[source(c)] = z[c];
    }
    solution[held] = held_value;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(SolveError::Singular);
    }
    Ok(BorderedSolution {
        solution,
        det_sign: parity * det_sign,
        pivot_ratio: if max_pivot > 0.0 {
            min_pivot / max_pivot
        } else {
            0.0
        },
    })
}

/// Eliminate the reduced system through its leading (m - 1) band block plus a
/// Schur complement for the full trailing column.
///
/// Columns shifted across the deleted one widen the lower band by one.
fn schur_bordered(
    jacobian: &BandedJacobian,
    source: &impl Fn(usize) -> usize,
    reduced_rhs: &DVector<f64>,
) -> Result<(DVector<f64>, i8, f64, f64), SolveError> {
    let m = jacobian.last_col.len();
    let kl = jacobian.ml + 1;
    let ku = jacobian.mu;
    let lead = m - 1;
    let lu = BandLu::factor(lead, kl, ku, |i, c| jacobian.entry(i, source(c)))?;

    let mut full_top = DVector::zeros(lead);
    for i in 0..lead {
        full_top[i] = jacobian.last_col[i];
    }
    let full_bottom = jacobian.last_col[m - 1];
    let mut bottom_row = DVector::zeros(lead);
    for c in 0..lead {
        bottom_row[c] = jacobian.entry(m - 1, source(c));
    }

    let y = lu.solve(&full_top);
    let w = lu.solve(&reduced_rhs.rows(0, lead).into_owned());
    let schur = full_bottom - bottom_row.dot(&y);
    if schur == 0.0 || !schur.is_finite() {
        return Err(SolveError::Singular);
    }
    let z_last = (reduced_rhs[m - 1] - bottom_row.dot(&w)) / schur;
    let mut z = DVector::zeros(m);
    for i in 0..lead {
        z[i] = w[i] - y[i] * z_last;
    }
    z[m - 1] = z_last;

    let det_sign = lu.det_sign * if schur > 0.0 { 1 } else { -1 };
    let min_pivot = lu.min_pivot.min(schur.abs());
    let max_pivot = lu.max_pivot.max(schur.abs());
    Ok((z, det_sign, min_pivot, max_pivot))
}

/// Band LU with partial pivoting, LAPACK-style storage with `kl` extra
/// superdiagonals of fill-in room.
struct BandLu {
    m: usize,
    kl: usize,
    ku: usize,
    ab: DMatrix<f64>,
    ipiv: Vec<usize>,
    det_sign: i8,
    min_pivot: f64,
    max_pivot: f64,
}

impl BandLu {
    fn factor(
        m: usize,
        kl: usize,
        ku: usize,
        entry: impl Fn(usize, usize) -> f64,
    ) -> Result<Self, SolveError> {
        let width = 2 * kl + ku + 1;
        // Row kl + ku holds the diagonal; rows above it hold superdiagonals
        // and fill-in, rows below hold the multipliers.
        let mut ab = DMatrix::zeros(width, m);
        for j in 0..m {
            let lo = j.saturating_sub(ku);
            let hi = (j + kl).min(m - 1);
            for i in lo..=hi {
                ab[(kl + ku + i - j, j)] = entry(i, j);
            }
        }

        let mut ipiv = vec![0usize; m];
        let mut det_sign: i8 = 1;
        let mut min_pivot = f64::INFINITY;
        let mut max_pivot = 0.0f64;

        for j in 0..m {
            let reach = kl.min(m - 1 - j);
            let mut p = 0;
            for q in 1..=reach {
                if ab[(kl + ku + q, j)].abs() > ab[(kl + ku + p, j)].abs() {
                    p = q;
                }
            }
            ipiv[j] = j + p;
            if p != 0 {
                det_sign = -det_sign;
                let last_col = (j + ku + kl).min(m - 1);
                for c in j..=last_col {
                    let r = (kl + ku + j) - c;
                    ab.swap((r, c), (r + p, c));
                }
            }
            let pivot = ab[(kl + ku, j)];
            if pivot == 0.0 || !pivot.is_finite() {
                return Err(SolveError::Singular);
            }
            if pivot < 0.0 {
                det_sign = -det_sign;
            }
            min_pivot = min_pivot.min(pivot.abs());
            max_pivot = max_pivot.max(pivot.abs());
            for q in 1..=reach {
                ab[(kl + ku + q, j)] /= pivot;
            }
            let last_col = (j + ku + kl).min(m.saturating_sub(1));
            for c in (j + 1)..=last_col {
                let u = ab[((kl + ku + j) - c, c)];
                if u != 0.0 {
                    for q in 1..=reach {
                        ab[((kl + ku + j) - c + q, c)] -= ab[(kl + ku + q, j)] * u;
                    }
                }
            }
        }

        Ok(Self {
            m,
            kl,
            ku,
            ab,
            ipiv,
            det_sign,
            min_pivot,
            max_pivot,
        })
    }

    fn solve(&self, b: &DVector<f64>) -> DVector<f64> {
        let (m, kl, ku) = (self.m, self.kl, self.ku);
        let mut x = b.clone();
        for j in 0..m {
            let jp = self.ipiv[j];
            if jp != j {
                x.swap_rows(j, jp);
            }
            let reach = kl.min(m - 1 - j);
            for q in 1..=reach {
                x[j + q] -= self.ab[(kl + ku + q, j)] * x[j];
            }
        }
        for i in (0..m).rev() {
            let mut s = x[i];
            let last_col = (i + ku + kl).min(m - 1);
            for c in (i + 1)..=last_col {
                s -= self.ab[((kl + ku + i) - c, c)] * x[c];
            }
            x[i] = s / self.ab[(kl + ku, i)];
        }
        x
    }
}
