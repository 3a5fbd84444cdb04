//! Crate-wide constants shared by the circuits and host-side orchestration.

use std::sync::OnceLock;

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ff::PrimeField;

/// Fixed-point scale: a real `r` is carried as `floor(r * PRECISION)`.
pub const PRECISION: u64 = 1000;

/// Width of a gradient component magnitude (each half of the sign-magnitude pair).
pub const MAGNITUDE_BITS: usize = 32;

/// Width of the public learning rate (fixed point).
pub const LEARNING_RATE_BITS: usize = 32;

/// Width of the norm comparator.
///
/// `dim * (2^32)^2` must stay below `2^NORM_BITS`, which caps the model dimension at 2^16.
pub const NORM_BITS: usize = 80;

/// Largest model dimension the norm comparator can handle.
pub const MAX_DIM: usize = 1 << (NORM_BITS - 2 * MAGNITUDE_BITS);

/// Largest supported Merkle depth.
pub const MAX_TREE_DEPTH: usize = 20;

/// Newton iterations used by the square root. Constant so proving cost does not depend on data.
pub const SQRT_ITERATIONS: usize = 8;

// Domain tags. Every tagged hash absorbs its tag first so no two uses can collide.
pub const TAG_LEAF: u64 = 1;
pub const TAG_GRADIENT: u64 = 2;
pub const TAG_MODEL: u64 = 3;
pub const TAG_MASK: u64 = 4;
pub const TAG_KEY: u64 = 5;
pub const TAG_CONTENT: u64 = 6;

// Poseidon sponge configuration.
//
// We use a width-3 sponge (rate=2, capacity=1) to efficiently absorb pairs of field elements,
// which is exactly one Merkle node per permutation.
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;

// Typical Poseidon parameters for width=3.
pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent (alpha).
pub const POSEIDON_ALPHA: u64 = 5;

static POSEIDON: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

/// Poseidon parameters for BN254::Fr, derived once and shared by the native hasher and the
/// in-circuit gadget.
pub fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    POSEIDON.get_or_init(|| {
        let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
            prime_bits,
            POSEIDON_RATE,
            POSEIDON_FULL_ROUNDS as u64,
            POSEIDON_PARTIAL_ROUNDS as u64,
            0,
        );

        PoseidonConfig::new(
            POSEIDON_FULL_ROUNDS,
            POSEIDON_PARTIAL_ROUNDS,
            POSEIDON_ALPHA,
            mds,
            ark,
            POSEIDON_RATE,
            POSEIDON_CAPACITY,
        )
    })
}
