//! Robust loss functions on squared residual norms.
//!
//! Each loss maps `s = ||r||²` to `ρ(s)` and its derivative `ρ'(s)`; the
//! solver scales residuals and Jacobians by `sqrt(ρ')` and reports the cost
//! `½ Σ ρ(s)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LossFunctionType {
    #[default]
    Trivial,
    SoftL1,
    Cauchy,
    Huber,
}

/// A loss type together with its scale `a`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossFunction {
    kind: LossFunctionType,
    scale_sq: f64,
}

impl LossFunction {
    pub fn new(kind: LossFunctionType, scale: f64) -> Self {
        Self {
            kind,
            scale_sq: scale * scale,
        }
    }

    pub fn trivial() -> Self {
        Self::new(LossFunctionType::Trivial, 1.0)
    }

    /// `(ρ(s), ρ'(s))`.
    pub fn evaluate(&self, s: f64) -> (f64, f64) {
        let b = self.scale_sq;
        match self.kind {
            LossFunctionType::Trivial => (s, 1.0),
            LossFunctionType::Huber => {
                if s <= b {
                    (s, 1.0)
                } else {
                    let r = s.sqrt();
                    let a = b.sqrt();
                    (2.0 * a * r - b, a / r)
                }
            }
            LossFunctionType::SoftL1 => {
                let sum = 1.0 + s / b;
                let tmp = sum.sqrt();
                (2.0 * b * (tmp - 1.0), 1.0 / tmp)
            }
            LossFunctionType::Cauchy => {
                let sum = 1.0 + s / b;
                (b * sum.ln(), 1.0 / sum)
            }
        }
    }

    pub fn rho(&self, s: f64) -> f64 {
        self.evaluate(s).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_losses_match_quadratic_near_zero() {
        for kind in [
            LossFunctionType::Trivial,
            LossFunctionType::SoftL1,
            LossFunctionType::Cauchy,
            LossFunctionType::Huber,
        ] {
            let loss = LossFunction::new(kind, 2.0);
            let (rho, drho) = loss.evaluate(1e-8);
            assert_relative_eq!(rho, 1e-8, epsilon = 1e-12);
            assert_relative_eq!(drho, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_derivatives() {
        let h = 1e-6;
        for kind in [LossFunctionType::SoftL1, LossFunctionType::Cauchy, LossFunctionType::Huber] {
            let loss = LossFunction::new(kind, 1.5);
            let s = 9.0;
            let numeric = (loss.rho(s + h) - loss.rho(s - h)) / (2.0 * h);
            assert_relative_eq!(loss.evaluate(s).1, numeric, epsilon = 1e-6);
            // Robust losses grow slower than the squared norm
            assert!(loss.rho(s) < s);
        }
    }
}
