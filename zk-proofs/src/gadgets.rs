//! In-circuit fixed-point arithmetic.
//!
//! Every value the prover supplies as a hint (bit decompositions, quotients, remainders, square
//! roots) is allocated as a plain witness and then tied back to its inputs by a checked relation.
//! A hint that is used without such a relation lets the prover pick any value it likes.

use ark_bn254::Fr;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSystemRef, SynthesisError};

use crate::constants::{MAGNITUDE_BITS, PRECISION};
use crate::fixed_point::{div_rem, fr_bits_le, fr_to_u128, isqrt, SignMagnitude};

/// Convert little-endian boolean bits into an FpVar.
pub fn bits_le_to_fp(bits_le: &[Boolean<Fr>]) -> FpVar<Fr> {
    let mut acc = FpVar::<Fr>::zero();
    let mut coeff = Fr::from(1u64);

    for b in bits_le {
        acc += FpVar::from(b.clone()) * coeff;
        coeff = coeff + coeff;
    }

    acc
}

/// Enforce that `v` fits in `width` bits and return its little-endian bits.
pub fn enforce_bit_width(v: &FpVar<Fr>, width: usize) -> Result<Vec<Boolean<Fr>>, SynthesisError> {
    if let FpVar::Constant(c) = v {
        let bits = fr_bits_le(*c);
        if bits.iter().skip(width).any(|b| *b) {
            return Err(SynthesisError::Unsatisfiable);
        }
        return Ok(bits.into_iter().take(width).map(Boolean::constant).collect());
    }

    let cs = v.cs();
    let value = v.value().ok().map(fr_bits_le);

    let mut bits = Vec::with_capacity(width);
    for i in 0..width {
        let bit = Boolean::new_witness(cs.clone(), || {
            value
                .as_ref()
                .map(|b| b[i])
                .ok_or(SynthesisError::AssignmentMissing)
        })?;
        bits.push(bit);
    }

    bits_le_to_fp(&bits).enforce_equal(v)?;
    Ok(bits)
}

/// Enforce `a <= b`. Both operands MUST already be known to fit `width` bits.
///
/// `b - a` is then either in `[0, 2^width)` or wrapped near `p`, and only the former has a
/// `width`-bit decomposition.
pub fn enforce_leq(a: &FpVar<Fr>, b: &FpVar<Fr>, width: usize) -> Result<(), SynthesisError> {
    enforce_bit_width(&(b - a), width).map(|_| ())
}

/// Enforce `a < b` under the same precondition as [`enforce_leq`].
pub fn enforce_lt(a: &FpVar<Fr>, b: &FpVar<Fr>, width: usize) -> Result<(), SynthesisError> {
    enforce_leq(&(a + FpVar::constant(Fr::from(1u64))), b, width)
}

/// Checked quotient and remainder.
#[derive(Clone, Debug)]
pub struct DivRemVar {
    pub quotient: FpVar<Fr>,
    pub remainder: FpVar<Fr>,
}

/// Divide `dividend` by `divisor`, both known to fit `width` bits.
///
/// Enforces `dividend == quotient * divisor + remainder`, `remainder < divisor` and
/// `quotient < 2^width`, so the relation cannot wrap around the modulus.
pub fn checked_div(dividend: &FpVar<Fr>, divisor: &FpVar<Fr>, width: usize) -> Result<DivRemVar, SynthesisError> {
    let cs = dividend.cs().or(divisor.cs());

    // A bad value still gets a (wrong) hint so the system reports unsatisfied instead of failing
    // to synthesize.
    let hint = match (dividend.value(), divisor.value()) {
        (Ok(a), Ok(b)) => Some(
            fr_to_u128(a)
                .zip(fr_to_u128(b))
                .and_then(|(a, b)| div_rem(a, b).ok())
                .map(|h| (Fr::from(h.quotient), Fr::from(h.remainder)))
                .unwrap_or_default(),
        ),
        _ => None,
    };

    let quotient = FpVar::new_witness(cs.clone(), || hint.map(|h| h.0).ok_or(SynthesisError::AssignmentMissing))?;
    let remainder = FpVar::new_witness(cs, || hint.map(|h| h.1).ok_or(SynthesisError::AssignmentMissing))?;

    enforce_bit_width(&quotient, width)?;
    enforce_bit_width(&remainder, width)?;
    enforce_lt(&remainder, divisor, width)?;
    (&quotient * divisor + &remainder).enforce_equal(dividend)?;

    Ok(DivRemVar { quotient, remainder })
}

/// `floor(a * b / PRECISION)` for magnitudes of at most `width` bits each.
pub fn fixed_mul(a: &FpVar<Fr>, b: &FpVar<Fr>, width: usize) -> Result<FpVar<Fr>, SynthesisError> {
    let product = a * b;
    let precision = FpVar::constant(Fr::from(PRECISION));
    Ok(checked_div(&product, &precision, 2 * width)?.quotient)
}

/// Floor square root of `x` (known to fit `width` bits), checked as `s^2 <= x <= s^2 + 2s`.
pub fn isqrt_var(x: &FpVar<Fr>, width: usize) -> Result<FpVar<Fr>, SynthesisError> {
    let root_width = width.div_ceil(2) + 1;

    let hint = x.value().ok().map(|v| {
        fr_to_u128(v)
            .and_then(|v| isqrt(v).ok())
            .map(Fr::from)
            .unwrap_or_default()
    });
    let root = FpVar::new_witness(x.cs(), || hint.ok_or(SynthesisError::AssignmentMissing))?;
    enforce_bit_width(&root, root_width)?;

    let square = root.square()?;
    let upper = &square + &root + &root;
    // `upper` is below 2^(width + 2) given the root width.
    enforce_leq(&square, x, width + 2)?;
    enforce_leq(x, &upper, width + 2)?;
    Ok(root)
}

/// A signed value as a (positive, negative) pair of range-checked magnitudes.
#[derive(Clone, Debug)]
pub struct SignMagnitudeVar {
    pub pos: FpVar<Fr>,
    pub neg: FpVar<Fr>,
}

impl SignMagnitudeVar {
    /// Allocate both parts, range-check them and enforce `pos * neg == 0`.
    pub fn new_witness(cs: ConstraintSystemRef<Fr>, value: SignMagnitude) -> Result<Self, SynthesisError> {
        let pos = FpVar::new_witness(cs.clone(), || Ok(Fr::from(value.pos)))?;
        let neg = FpVar::new_witness(cs, || Ok(Fr::from(value.neg)))?;

        enforce_bit_width(&pos, MAGNITUDE_BITS)?;
        enforce_bit_width(&neg, MAGNITUDE_BITS)?;
        pos.mul_equals(&neg, &FpVar::zero())?;

        Ok(Self { pos, neg })
    }

    /// `pos - neg` in the field.
    pub fn signed_value(&self) -> FpVar<Fr> {
        &self.pos - &self.neg
    }

    pub fn squared_magnitude(&self) -> Result<FpVar<Fr>, SynthesisError> {
        Ok(self.pos.square()? + self.neg.square()?)
    }
}

/// Squared L2 norm computed from the decomposition, never taken from the prover.
pub fn norm_squared_var(parts: &[SignMagnitudeVar]) -> Result<FpVar<Fr>, SynthesisError> {
    let mut acc = FpVar::<Fr>::zero();
    for part in parts {
        acc += part.squared_magnitude()?;
    }
    Ok(acc)
}
