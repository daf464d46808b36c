//! Small dense linear algebra for the bandit
//!
//! Matrices are row-major `Vec<f64>` of size `n × n`. Only what LinUCB needs is
//! provided: a Cholesky factorization of a symmetric positive-definite matrix,
//! the triangular solves built on it, and a rank-one update.

use crate::error::ComputeError;

/// Lower-triangular Cholesky factor `L` with `A = L·Lᵗ`
#[derive(Debug, Clone)]
pub struct Cholesky {
    n: usize,
    lower: Vec<f64>,
}

impl Cholesky {
    /// Factor a symmetric positive-definite `n × n` matrix
    pub fn factor(matrix: &[f64], n: usize) -> Result<Self, ComputeError> {
        if matrix.len() != n * n {
            return Err(ComputeError::NumericalError(format!(
                "matrix holds {} values, expected {n}×{n}",
                matrix.len()
            )));
        }
        let mut lower = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = matrix[i * n + j];
                for k in 0..j {
                    sum -= lower[i * n + k] * lower[j * n + k];
                }
                if i == j {
                    if !(sum.is_finite() && sum > 0.0) {
                        return Err(ComputeError::NumericalError(format!(
                            "matrix is not positive-definite (pivot {i} = {sum})"
                        )));
                    }
                    lower[i * n + i] = sum.sqrt();
                } else {
                    lower[i * n + j] = sum / lower[j * n + j];
                }
            }
        }
        Ok(Self { n, lower })
    }

    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Solve `L·y = b`
    pub fn forward(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.lower[i * n + k] * y[k];
            }
            y[i] = sum / self.lower[i * n + i];
        }
        y
    }

    /// Solve `Lᵗ·x = y`
    pub fn backward(&self, y: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in i + 1..n {
                sum -= self.lower[k * n + i] * x[k];
            }
            x[i] = sum / self.lower[i * n + i];
        }
        x
    }

    /// Solve `A·x = b`
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, ComputeError> {
        if b.len() != self.n {
            return Err(ComputeError::NumericalError(format!(
                "right-hand side has {} values, expected {}",
                b.len(),
                self.n
            )));
        }
        let x = self.backward(&self.forward(b));
        ensure_finite(&x, "solution")?;
        Ok(x)
    }

    /// Quadratic form `xᵗ·A⁻¹·x`, computed as `‖L⁻¹x‖²`
    pub fn inverse_quadratic(&self, x: &[f64]) -> Result<f64, ComputeError> {
        if x.len() != self.n {
            return Err(ComputeError::NumericalError(format!(
                "vector has {} values, expected {}",
                x.len(),
                self.n
            )));
        }
        let value: f64 = self.forward(x).iter().map(|v| v * v).sum();
        if !value.is_finite() {
            return Err(ComputeError::NumericalError(
                "confidence term is not finite".to_string(),
            ));
        }
        Ok(value)
    }
}

/// `λ·I` of size `n × n`
pub fn scaled_identity(n: usize, lambda: f64) -> Vec<f64> {
    let mut matrix = vec![0.0; n * n];
    for i in 0..n {
        matrix[i * n + i] = lambda;
    }
    matrix
}

/// `A ← A + x·xᵗ`
pub fn rank_one_update(matrix: &mut [f64], x: &[f64]) {
    let n = x.len();
    for i in 0..n {
        for j in 0..n {
            matrix[i * n + j] += x[i] * x[j];
        }
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn ensure_finite(values: &[f64], what: &str) -> Result<(), ComputeError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ComputeError::NumericalError(format!(
            "{what} contains non-finite values"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn test_solve_spd_system() {
        // A = [[4, 2], [2, 3]]
        let a = vec![4.0, 2.0, 2.0, 3.0];
        let chol = Cholesky::factor(&a, 2).unwrap();
        let x = chol.solve(&[2.0, 1.0]).unwrap();
        // 4x + 2y = 2, 2x + 3y = 1 → x = 0.5, y = 0
        assert!(close(&x, &[0.5, 0.0]), "{x:?}");
    }

    #[test]
    fn test_inverse_quadratic_of_identity() {
        let chol = Cholesky::factor(&scaled_identity(3, 2.0), 3).unwrap();
        let q = chol.inverse_quadratic(&[1.0, 1.0, 0.0]).unwrap();
        assert!((q - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rank_one_update() {
        let mut a = scaled_identity(2, 1.0);
        rank_one_update(&mut a, &[1.0, 2.0]);
        assert_eq!(a, vec![2.0, 2.0, 2.0, 5.0]);
    }

    #[test]
    fn test_indefinite_matrix_is_numerical_error() {
        let a = vec![1.0, 2.0, 2.0, 1.0];
        assert!(matches!(
            Cholesky::factor(&a, 2),
            Err(ComputeError::NumericalError(_))
        ));
        let a = vec![f64::NAN, 0.0, 0.0, 1.0];
        assert!(Cholesky::factor(&a, 2).is_err());
    }

    #[test]
    fn test_dimension_checked() {
        assert!(Cholesky::factor(&[1.0, 0.0, 0.0], 2).is_err());
        let chol = Cholesky::factor(&scaled_identity(2, 1.0), 2).unwrap();
        assert!(chol.solve(&[1.0]).is_err());
    }
}
