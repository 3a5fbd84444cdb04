//! Native fixed-point arithmetic over the BN254 scalar field.
//!
//! Signed quantities never rely on field wraparound for anything that is later squared or
//! compared: `a - b` with `b > a` is `p - (b - a)` in the field, an enormous value. Instead
//! every signed value that feeds a norm or comparison is carried as a [`SignMagnitude`] pair.
//!
//! These functions are the host-side mirror of the gadgets in [`crate::gadgets`]; witnesses are
//! computed here and re-checked there.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use serde::{Deserialize, Serialize};

use crate::constants::{MAGNITUDE_BITS, PRECISION, SQRT_ITERATIONS};
use crate::errors::FixedPointError;

/// Encode a real as `floor(r * PRECISION)`.
pub fn to_fixed(r: f64) -> Result<i64, FixedPointError> {
    let scaled = (r * PRECISION as f64).floor();
    if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
        return Err(FixedPointError::Overflow(format!("{r}")));
    }
    Ok(scaled as i64)
}

pub fn from_fixed(v: i64) -> f64 {
    v as f64 / PRECISION as f64
}

/// A signed value as (positive part, negative part); at most one part is non-zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignMagnitude {
    pub pos: u64,
    pub neg: u64,
}

impl SignMagnitude {
    /// Split `v` into its parts. The magnitude must fit `MAGNITUDE_BITS`.
    pub fn decompose(v: i64) -> Result<Self, FixedPointError> {
        let magnitude = v.unsigned_abs();
        if magnitude >> MAGNITUDE_BITS != 0 {
            return Err(FixedPointError::Overflow(format!("{v}")));
        }
        Ok(if v >= 0 {
            Self { pos: magnitude, neg: 0 }
        } else {
            Self { pos: 0, neg: magnitude }
        })
    }

    pub fn reconstruct(&self) -> i64 {
        self.pos as i64 - self.neg as i64
    }

    /// `pos - neg` as a field element (wraps for negative values, which is fine for hashing and
    /// masking but never for comparison).
    pub fn to_field(&self) -> Fr {
        Fr::from(self.pos) - Fr::from(self.neg)
    }

    pub fn squared_magnitude(&self) -> u128 {
        let pos = self.pos as u128;
        let neg = self.neg as u128;
        pos * pos + neg * neg
    }
}

pub fn decompose_gradient(gradient: &[i64]) -> Result<Vec<SignMagnitude>, FixedPointError> {
    gradient.iter().map(|&g| SignMagnitude::decompose(g)).collect()
}

pub fn reconstruct_gradient(parts: &[SignMagnitude]) -> Vec<i64> {
    parts.iter().map(SignMagnitude::reconstruct).collect()
}

/// Squared L2 norm in `PRECISION^2` units, computed from the decomposition.
pub fn norm_squared(parts: &[SignMagnitude]) -> u128 {
    parts.iter().map(SignMagnitude::squared_magnitude).sum()
}

/// Quotient and remainder of an integer division.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DivRem {
    pub quotient: u128,
    pub remainder: u128,
}

impl DivRem {
    /// `dividend == quotient * divisor + remainder` and `remainder < divisor`.
    pub fn holds(&self, dividend: u128, divisor: u128) -> bool {
        let Some(product) = self.quotient.checked_mul(divisor) else {
            return false;
        };
        product.checked_add(self.remainder) == Some(dividend) && self.remainder < divisor
    }
}

/// Checked division: the hint is re-derived before it is returned.
pub fn div_rem(dividend: u128, divisor: u128) -> Result<DivRem, FixedPointError> {
    if divisor == 0 {
        return Err(FixedPointError::DivisionByZero);
    }
    let hint = DivRem {
        quotient: dividend / divisor,
        remainder: dividend % divisor,
    };
    debug_assert!(hint.holds(dividend, divisor));
    Ok(hint)
}

/// `floor(a * b / PRECISION)` for fixed-point magnitudes.
pub fn fixed_mul(a: u64, b: u64) -> Result<u64, FixedPointError> {
    let q = (a as u128 * b as u128) / PRECISION as u128;
    u64::try_from(q).map_err(|_| FixedPointError::Overflow(format!("{a}*{b}")))
}

/// `floor(a * PRECISION / b)` for fixed-point magnitudes.
pub fn fixed_div(a: u64, b: u64) -> Result<u64, FixedPointError> {
    let DivRem { quotient, .. } = div_rem(a as u128 * PRECISION as u128, b as u128)?;
    u64::try_from(quotient).map_err(|_| FixedPointError::Overflow(format!("{a}/{b}")))
}

/// Floor square root with a fixed number of Newton steps.
///
/// The result is accepted only if `s^2 <= x < (s + 1)^2`.
pub fn isqrt(x: u128) -> Result<u128, FixedPointError> {
    if x == 0 {
        return Ok(0);
    }
    let bits = 128 - x.leading_zeros();
    let mut s: u128 = 1 << bits.div_ceil(2);
    for _ in 0..SQRT_ITERATIONS {
        let next = (s + x / s) / 2;
        s = s.min(next);
    }

    let below = s.checked_mul(s).is_some_and(|sq| sq <= x);
    let above = (s + 1).checked_mul(s + 1).is_none_or(|sq| sq > x);
    if below && above {
        Ok(s)
    } else {
        Err(FixedPointError::SqrtOutOfBound { input: x, root: s })
    }
}

/// Fixed-point square root of a fixed-point value.
pub fn fixed_sqrt(v: u64) -> Result<u64, FixedPointError> {
    let root = isqrt(v as u128 * PRECISION as u128)?;
    u64::try_from(root).map_err(|_| FixedPointError::Overflow(format!("sqrt({v})")))
}

/// Scale `gradient` so that its norm is at most `tau` (both fixed point).
///
/// Uses the ceiling of the norm and truncates every scaled magnitude, so the result always
/// satisfies `norm_squared <= tau^2`.
pub fn clip_gradient(gradient: &[i64], tau: u64) -> Result<Vec<i64>, FixedPointError> {
    let parts = decompose_gradient(gradient)?;
    let norm_sq = norm_squared(&parts);
    let tau_sq = tau as u128 * tau as u128;
    if norm_sq <= tau_sq {
        return Ok(gradient.to_vec());
    }

    let mut norm = isqrt(norm_sq)?;
    if norm * norm < norm_sq {
        norm += 1;
    }

    let clipped = parts
        .iter()
        .map(|p| {
            let magnitude = (p.pos + p.neg) as u128;
            let DivRem { quotient, .. } = div_rem(magnitude * tau as u128, norm)?;
            let q = quotient as i64;
            Ok(if p.neg > 0 { -q } else { q })
        })
        .collect::<Result<Vec<_>, FixedPointError>>()?;

    debug_assert!(norm_squared(&decompose_gradient(&clipped)?) <= tau_sq);
    Ok(clipped)
}

/// One step of `w - lr * g`, truncating each product toward zero.
pub fn apply_update(weights: &[i64], gradient: &[i64], learning_rate: u64) -> Result<Vec<i64>, FixedPointError> {
    if weights.len() != gradient.len() {
        return Err(FixedPointError::Overflow(format!(
            "weights ({}) and gradient ({}) differ in length",
            weights.len(),
            gradient.len()
        )));
    }
    weights
        .iter()
        .zip(gradient)
        .map(|(&w, &g)| {
            let product = fixed_mul(learning_rate, g.unsigned_abs())?;
            let step = i64::try_from(product).map_err(|_| FixedPointError::Overflow(format!("step {product}")))?;
            let delta = if g < 0 { -step } else { step };
            w.checked_sub(delta)
                .ok_or_else(|| FixedPointError::Overflow(format!("{w} - {delta}")))
        })
        .collect()
}

pub fn fr_from_i64(v: i64) -> Fr {
    if v >= 0 {
        Fr::from(v as u64)
    } else {
        -Fr::from(v.unsigned_abs())
    }
}

fn limbs_to_u128(limbs: &[u64]) -> Option<u128> {
    if limbs.iter().skip(2).any(|&l| l != 0) {
        return None;
    }
    let lo = limbs.first().copied().unwrap_or(0) as u128;
    let hi = limbs.get(1).copied().unwrap_or(0) as u128;
    Some(lo | (hi << 64))
}

/// The canonical residue of `x` as an integer, if it fits in 128 bits.
pub fn fr_to_u128(x: Fr) -> Option<u128> {
    limbs_to_u128(x.into_bigint().as_ref())
}

/// Centered lift: residues above `(p - 1) / 2` decode as negative.
pub fn fr_to_i64(x: Fr) -> Option<i64> {
    if x.into_bigint() <= Fr::MODULUS_MINUS_ONE_DIV_TWO {
        fr_to_u128(x).and_then(|v| i64::try_from(v).ok())
    } else {
        fr_to_u128(-x).and_then(|v| i64::try_from(-(v as i128)).ok())
    }
}

/// Little-endian bits of the canonical residue.
pub fn fr_bits_le(x: Fr) -> Vec<bool> {
    x.into_bigint().to_bits_le()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_encoding_floors() {
        assert_eq!(to_fixed(1.0).unwrap(), 1000);
        assert_eq!(to_fixed(0.0015).unwrap(), 1);
        assert_eq!(to_fixed(-0.0015).unwrap(), -2);
        assert!((from_fixed(-250) + 0.25).abs() < 1e-12);
        assert!(to_fixed(f64::NAN).is_err());
    }

    #[test]
    fn sign_magnitude_round_trip() {
        for v in [0i64, 1, -1, 999, -4321, (1 << 32) - 1, -((1 << 32) - 1)] {
            let parts = SignMagnitude::decompose(v).unwrap();
            assert_eq!(parts.pos * parts.neg, 0);
            assert_eq!(parts.reconstruct(), v);
            assert_eq!(parts.to_field(), fr_from_i64(v));
        }
        assert!(SignMagnitude::decompose(1 << 32).is_err());
        assert!(SignMagnitude::decompose(i64::MIN).is_err());
    }

    #[test]
    fn decomposed_norm_matches_l2() {
        let g = [300i64, -400, 0, 1200];
        let parts = decompose_gradient(&g).unwrap();
        let direct: u128 = g.iter().map(|&v| (v as i128 * v as i128) as u128).sum();
        assert_eq!(norm_squared(&parts), direct);
        assert_eq!(reconstruct_gradient(&parts), g.to_vec());
    }

    #[test]
    fn div_rem_rederives() {
        let hint = div_rem(1_000_001, 1000).unwrap();
        assert_eq!(hint, DivRem { quotient: 1000, remainder: 1 });
        assert!(hint.holds(1_000_001, 1000));
        assert!(!DivRem { quotient: 1001, remainder: 0 }.holds(1_000_001, 1000));
        assert!(!DivRem { quotient: 999, remainder: 1001 }.holds(1_000_001, 1000));
        assert_eq!(div_rem(5, 0), Err(FixedPointError::DivisionByZero));
    }

    #[test]
    fn fixed_mul_and_div() {
        assert_eq!(fixed_mul(1500, 2000), Ok(3000));
        assert_eq!(fixed_mul(10, 1), Ok(0));
        assert!(matches!(fixed_mul(u64::MAX, u64::MAX), Err(FixedPointError::Overflow(_))));
        assert_eq!(fixed_div(3000, 2000).unwrap(), 1500);
        assert!(fixed_div(1, 0).is_err());
    }

    #[test]
    fn isqrt_is_exact_floor() {
        for x in [0u128, 1, 2, 3, 4, 15, 16, 17, 1_000_000, 999_999, u64::MAX as u128, u128::MAX] {
            let s = isqrt(x).unwrap();
            assert!(s * s <= x);
            assert!((s + 1).checked_mul(s + 1).is_none_or(|sq| sq > x));
        }
        assert_eq!(fixed_sqrt(4000).unwrap(), 2000);
        assert_eq!(fixed_sqrt(2000).unwrap(), 1414);
    }

    #[test]
    fn clipping_respects_bound() {
        let tau = 1000;
        let small = [100i64, -200, 300, 0];
        assert_eq!(clip_gradient(&small, tau).unwrap(), small.to_vec());

        let big = [3000i64, -4000, 0, 0];
        let clipped = clip_gradient(&big, tau).unwrap();
        assert_eq!(clipped, vec![600, -800, 0, 0]);

        let awkward = [1234i64, -5678, 91, -1011];
        let clipped = clip_gradient(&awkward, tau).unwrap();
        let parts = decompose_gradient(&clipped).unwrap();
        assert!(norm_squared(&parts) <= (tau * tau) as u128);
        assert!(clipped.iter().zip(awkward).all(|(c, a)| c.signum() == a.signum() || *c == 0));
    }

    #[test]
    fn update_truncates_toward_zero() {
        let w = [1000i64, -500, 0];
        let g = [1999i64, -1999, 7];
        // lr = 0.5: steps are 999, -999, 3
        let next = apply_update(&w, &g, 500).unwrap();
        assert_eq!(next, vec![1, 499, -3]);
        assert!(apply_update(&w, &g[..2], 500).is_err());
    }

    #[test]
    fn oversized_step_is_an_error_not_a_sign_flip() {
        // lr * |g| / PRECISION exceeds i64 here; it must not wrap into a negative step.
        let err = apply_update(&[0], &[i64::MAX], 2000).unwrap_err();
        assert!(matches!(err, FixedPointError::Overflow(_)));
        let err = apply_update(&[0], &[i64::MIN], u64::MAX).unwrap_err();
        assert!(matches!(err, FixedPointError::Overflow(_)));
    }

    #[test]
    fn centered_lift() {
        for v in [0i64, 5, -5, i64::MAX, i64::MIN + 1] {
            assert_eq!(fr_to_i64(fr_from_i64(v)), Some(v));
        }
        assert_eq!(fr_to_u128(Fr::from(u128::MAX)), Some(u128::MAX));
        assert_eq!(fr_to_u128(-Fr::from(1u64)), None);
    }
}
