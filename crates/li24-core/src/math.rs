//! Secret-sharing utilities: polynomials, Feldman commitments, Lagrange weights

use crate::types::{party_scalar, point_vec_serde};
use crate::{Error, PartyId, Result};
use elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Secret polynomial f(X) = a₀ + a₁X + … + aₜXᵗ over the scalar field
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Sample a random polynomial of the given degree
    ///
    /// When `constant` is set it becomes f(0), otherwise f(0) is random too.
    pub fn random<R: RngCore + CryptoRng>(
        rng: &mut R,
        degree: usize,
        constant: Option<Scalar>,
    ) -> Self {
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(constant.unwrap_or_else(|| Scalar::random(&mut *rng)));
        for _ in 0..degree {
            coefficients.push(Scalar::random(&mut *rng));
        }
        Self { coefficients }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// f(0)
    pub fn constant(&self) -> &Scalar {
        &self.coefficients[0]
    }

    /// Horner evaluation at `x`
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, c| acc * x + c)
    }

    /// Evaluate at a party's field embedding
    pub fn evaluate_at(&self, id: PartyId) -> Scalar {
        self.evaluate(&party_scalar(id))
    }

    /// Feldman commitment F(X) = f(X)·G
    pub fn commit(&self) -> Commitment {
        Commitment {
            coefficients: self
                .coefficients
                .iter()
                .map(|c| ProjectivePoint::GENERATOR * c)
                .collect(),
        }
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        for c in self.coefficients.iter_mut() {
            *c = Scalar::ZERO;
        }
    }
}

/// Polynomial "in the exponent": every coefficient multiplied by G
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    #[serde(with = "point_vec_serde")]
    coefficients: Vec<ProjectivePoint>,
}

impl Commitment {
    /// Degree of the committed polynomial, `None` for an empty commitment
    pub fn degree(&self) -> Option<usize> {
        self.coefficients.len().checked_sub(1)
    }

    /// F(0) = f(0)·G
    pub fn constant(&self) -> ProjectivePoint {
        self.coefficients
            .first()
            .copied()
            .unwrap_or(ProjectivePoint::IDENTITY)
    }

    /// True when the committed polynomial has f(0) = 0
    pub fn has_zero_constant(&self) -> bool {
        self.constant() == ProjectivePoint::IDENTITY
    }

    /// Horner evaluation at `x`
    pub fn evaluate(&self, x: &Scalar) -> ProjectivePoint {
        self.coefficients
            .iter()
            .rev()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c)
    }

    /// Evaluate at a party's field embedding
    pub fn evaluate_at(&self, id: PartyId) -> ProjectivePoint {
        self.evaluate(&party_scalar(id))
    }

    /// Check share·G == F(id)
    pub fn verify_share(&self, id: PartyId, share: &Scalar) -> bool {
        ProjectivePoint::GENERATOR * share == self.evaluate_at(id)
    }

    /// Coefficient-wise sum of commitments of equal degree
    pub fn sum<'a>(commitments: impl IntoIterator<Item = &'a Commitment>) -> Result<Commitment> {
        let mut iter = commitments.into_iter();
        let mut acc = iter
            .next()
            .cloned()
            .ok_or_else(|| Error::Internal("Sum of no commitments".into()))?;
        for commitment in iter {
            if commitment.coefficients.len() != acc.coefficients.len() {
                return Err(Error::Internal("Commitment degrees differ".into()));
            }
            for (a, b) in acc.coefficients.iter_mut().zip(&commitment.coefficients) {
                *a += b;
            }
        }
        Ok(acc)
    }
}

/// Lagrange coefficients at X = 0 for a set of distinct party ids
///
/// For every polynomial f of degree < |ids|, Σⱼ λⱼ·f(j) = f(0).
pub fn lagrange_coefficients(ids: &[PartyId]) -> BTreeMap<PartyId, Scalar> {
    ids.iter()
        .map(|&j| {
            let x_j = party_scalar(j);
            let mut numerator = Scalar::ONE;
            let mut denominator = Scalar::ONE;
            for &m in ids {
                if m == j {
                    continue;
                }
                let x_m = party_scalar(m);
                numerator *= x_m;
                denominator *= x_m - x_j;
            }
            // distinct ids keep the denominator invertible
            let inverse = Option::<Scalar>::from(denominator.invert()).unwrap_or(Scalar::ZERO);
            (j, numerator * inverse)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    #[test]
    fn test_evaluate_matches_naive() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let poly = Polynomial::random(&mut rng, 3, None);
        let x = Scalar::from(9u64);

        let mut expected = Scalar::ZERO;
        let mut power = Scalar::ONE;
        for c in &poly.coefficients {
            expected += *c * power;
            power *= x;
        }
        assert_eq!(poly.evaluate(&x), expected);
        assert_eq!(poly.evaluate(&Scalar::ZERO), *poly.constant());
    }

    #[test]
    fn test_commitment_binds_shares() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let poly = Polynomial::random(&mut rng, 2, None);
        let commitment = poly.commit();
        assert_eq!(commitment.degree(), Some(2));

        for id in 0..5 {
            let share = poly.evaluate_at(id);
            assert!(commitment.verify_share(id, &share));
            assert!(!commitment.verify_share(id, &(share + Scalar::ONE)));
        }
    }

    #[test]
    fn test_zero_constant_commitment() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let poly = Polynomial::random(&mut rng, 2, Some(Scalar::ZERO));
        assert!(poly.commit().has_zero_constant());
        let poly = Polynomial::random(&mut rng, 2, None);
        assert!(!poly.commit().has_zero_constant());
    }

    #[test]
    fn test_lagrange_reconstructs_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let secret = Scalar::random(&mut rng);
        let poly = Polynomial::random(&mut rng, 2, Some(secret));

        for subset in [vec![0, 1, 2], vec![1, 3, 4], vec![0, 2, 3, 4]] {
            let lambda = lagrange_coefficients(&subset);
            let reconstructed = subset
                .iter()
                .fold(Scalar::ZERO, |acc, j| acc + lambda[j] * poly.evaluate_at(*j));
            assert_eq!(reconstructed, secret);
        }

        // too few points reconstruct something else
        let lambda = lagrange_coefficients(&[0, 1]);
        let guess = lambda[&0] * poly.evaluate_at(0) + lambda[&1] * poly.evaluate_at(1);
        assert_ne!(guess, secret);
    }

    #[test]
    fn test_commitment_sum() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let a = Polynomial::random(&mut rng, 2, None);
        let b = Polynomial::random(&mut rng, 2, None);
        let sum = Commitment::sum([&a.commit(), &b.commit()]).unwrap();
        let x = party_scalar(3);
        assert_eq!(
            sum.evaluate(&x),
            ProjectivePoint::GENERATOR * (a.evaluate(&x) + b.evaluate(&x))
        );

        let c = Polynomial::random(&mut rng, 1, None);
        assert!(Commitment::sum([&a.commit(), &c.commit()]).is_err());
        assert!(Commitment::sum(std::iter::empty()).is_err());
    }
}
