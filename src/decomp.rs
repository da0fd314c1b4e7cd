//! Covariance matrix with its cached eigendecomposition.

use nalgebra::DMatrix;
use rayon::prelude::*;

/// Smallest eigenvalue kept by [`DecompMatrix::update_eigensystem`].
///
/// Anything below is clamped up to this floor and counted, so callers can
/// tell a drifted matrix from a healthy one.
pub const EIGENVALUE_FLOOR: f64 = 1e-20;

fn symmetric_eigen_from_data(data: &[f64], n: usize) -> (Vec<f64>, Vec<f64>) {
    let mat = DMatrix::from_row_slice(n, n, data);
    let se = nalgebra::linalg::SymmetricEigen::new(mat);
    let eigenvalues: Vec<f64> = se.eigenvalues.iter().copied().collect();
    let mut eigenbasis = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            eigenbasis[i * n + j] = se.eigenvectors[(i, j)];
        }
    }
    (eigenvalues, eigenbasis)
}

/// Adaptive covariance state for CMA-ES.
///
/// All matrices are stored row-major in flat vectors of length `n * n`.
/// Column `k` of `eigenbasis` is the eigenvector for `eigenvalues[k]`.
#[derive(Debug, Clone)]
pub struct DecompMatrix {
    n: usize,
    data: Vec<f64>,
    eigenbasis: Vec<f64>,
    eigenvalues: Vec<f64>,
    invsqrt: Vec<f64>,
    condition_number: f64,
    clamped: usize,
}

impl DecompMatrix {
    /// Identity covariance of dimension `n`.
    pub fn identity(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        let eigenbasis = data.clone();
        let invsqrt = data.clone();
        Self {
            n,
            data,
            eigenbasis,
            eigenvalues: vec![1.0; n],
            invsqrt,
            condition_number: 1.0,
            clamped: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.n
    }

    /// The covariance matrix `C`, row-major.
    pub fn covariance(&self) -> &[f64] {
        &self.data
    }

    pub fn eigenbasis(&self) -> &[f64] {
        &self.eigenbasis
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// `C^{-1/2}` as of the last eigensystem update, row-major.
    pub fn invsqrt(&self) -> &[f64] {
        &self.invsqrt
    }

    pub fn condition_number(&self) -> f64 {
        self.condition_number
    }

    /// Number of eigenvalues clamped to [`EIGENVALUE_FLOOR`] at the last update.
    pub fn clamped_eigenvalues(&self) -> usize {
        self.clamped
    }

    pub fn max_eigenvalue(&self) -> f64 {
        self.eigenvalues.iter().cloned().fold(0.0f64, f64::max)
    }

    pub fn diag(&self) -> Vec<f64> {
        (0..self.n).map(|i| self.data[i * self.n + i]).collect()
    }

    /// Overwrite `C` with a full row-major matrix. The eigensystem is not refreshed.
    ///
    /// # Panics
    /// Panics if `data.len() != n * n`.
    pub fn set_covariance(&mut self, data: &[f64]) {
        assert_eq!(data.len(), self.n * self.n, "covariance must be n*n");
        self.data.copy_from_slice(data);
    }

    /// Return to the identity matrix and its trivial eigensystem.
    pub fn reset(&mut self) {
        *self = Self::identity(self.n);
    }

    /// `C *= factor`.
    pub fn scale(&mut self, factor: f64) {
        self.data.par_iter_mut().for_each(|v| *v *= factor);
    }

    /// `C += factor * (b ⊗ b)`.
    pub fn add_outer(&mut self, b: &[f64], factor: f64) {
        let n = self.n;
        self.data
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, row)| {
                let scale = factor * b[i];
                for (v, &bj) in row.iter_mut().zip(b.iter()) {
                    *v += scale * bj;
                }
            });
    }

    fn enforce_symmetry(&mut self) {
        let n = self.n;
        for i in 0..n {
            for j in 0..i {
                let avg = 0.5 * (self.data[i * n + j] + self.data[j * n + i]);
                self.data[i * n + j] = avg;
                self.data[j * n + i] = avg;
            }
        }
    }

    /// Symmetrize `C`, decompose it, and refresh the condition number and `C^{-1/2}`.
    ///
    /// Returns the number of eigenvalues that fell below [`EIGENVALUE_FLOOR`]
    /// (or were NaN) and had to be clamped. A non-zero count means `C`
    /// drifted away from positive-definite; the decomposition is still usable
    /// but no longer describes `C` exactly.
    pub fn update_eigensystem(&mut self) -> usize {
        self.enforce_symmetry();
        let (mut eigs, basis) = symmetric_eigen_from_data(&self.data, self.n);

        let mut clamped = 0;
        for ev in &mut eigs {
            // also catches NaN
            if !(*ev >= EIGENVALUE_FLOOR) {
                *ev = EIGENVALUE_FLOOR;
                clamped += 1;
            }
        }
        if clamped > 0 {
            tracing::warn!(
                clamped,
                dimension = self.n,
                "covariance lost positive-definiteness, eigenvalues clamped"
            );
        }

        let min_ev = eigs.iter().fold(f64::INFINITY, |m, &v| m.min(v));
        let max_ev = eigs.iter().fold(0.0f64, |m, &v| m.max(v));

        let n = self.n;
        let inv_roots: Vec<f64> = eigs.iter().map(|ev| 1.0 / ev.sqrt()).collect();
        let mut invsqrt = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += basis[i * n + k] * basis[j * n + k] * inv_roots[k];
                }
                invsqrt[i * n + j] = sum;
                invsqrt[j * n + i] = sum;
            }
        }

        self.eigenbasis = basis;
        self.eigenvalues = eigs;
        self.invsqrt = invsqrt;
        self.condition_number = if n == 0 { 1.0 } else { max_ev / min_ev };
        self.clamped = clamped;
        clamped
    }

    /// `C^{-1/2} · y`.
    pub fn invsqrt_mul(&self, y: &[f64]) -> Vec<f64> {
        mat_vec(&self.invsqrt, self.n, y)
    }

    /// `B · (sqrt(λ) ⊙ z)`: maps a standard normal draw onto `N(0, C)`.
    pub fn sample_step(&self, z: &[f64]) -> Vec<f64> {
        let scaled: Vec<f64> = z
            .iter()
            .zip(self.eigenvalues.iter())
            .map(|(zi, ev)| ev.max(0.0).sqrt() * zi)
            .collect();
        mat_vec(&self.eigenbasis, self.n, &scaled)
    }
}

fn mat_vec(m: &[f64], n: usize, v: &[f64]) -> Vec<f64> {
    (0..n)
        .map(|i| {
            m[i * n..(i + 1) * n]
                .iter()
                .zip(v.iter())
                .map(|(a, b)| a * b)
                .sum()
        })
        .collect()
}
