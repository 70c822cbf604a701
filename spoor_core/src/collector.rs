//! Runner-side feature collection.
//!
//! After each input the runner quiesces its writers, drains the coverage
//! byte-sets through the feature encoders into a bounded [`FeatureArray`],
//! and ships the resulting batch to the engine in the 64-bit little-endian
//! wire format. Compare observations are encoded here as well.

use crate::byteset::ByteSet;
use crate::feature::{
    ab_to_cmp_difflog, ab_to_cmp_hamming, ab_to_cmp_moddiff, convert_8bit_counter_to_number,
    domains, Domain, Feature, FeatureArray, FeatureVec,
};
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::error::{DecodeError, EncodeError};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from the feature wire format.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// A feature batch could not be encoded.
    #[error("feature batch encoding failed: {0}")]
    Encode(String),
    /// A feature batch could not be decoded (truncated or corrupt bytes).
    #[error("feature batch decoding failed: {0}")]
    Decode(String),
}

impl From<EncodeError> for CollectorError {
    fn from(err: EncodeError) -> Self {
        CollectorError::Encode(err.to_string())
    }
}

impl From<DecodeError> for CollectorError {
    fn from(err: DecodeError) -> Self {
        CollectorError::Decode(err.to_string())
    }
}

/// Selects which of the 16 user domains are currently live. Features of
/// disabled user domains are discarded before insertion; features of
/// non-user domains always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDomainMask(pub u64);

impl UserDomainMask {
    pub const ALL: Self = Self(u64::MAX);
    pub const NONE: Self = Self(0);

    pub fn is_enabled(self, slot: usize) -> bool {
        assert!(
            slot < domains::USER_DOMAIN_COUNT,
            "user domain slot {slot} out of range"
        );
        self.0 & (1 << slot) != 0
    }

    /// Whether `feature` survives the mask.
    pub fn admits(self, feature: Feature) -> bool {
        let domain_id = Domain::of_feature(feature);
        let first_user = domains::USER[0].id();
        if domain_id < first_user || domain_id > domains::USER[domains::USER_DOMAIN_COUNT - 1].id()
        {
            return true;
        }
        self.is_enabled((domain_id - first_user) as usize)
    }
}

impl Default for UserDomainMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Mixes a compare context (e.g. the caller PC) into 64 pseudo-random bits
/// so structured context spaces alias uniformly under the domain modulus.
/// The splitmix64 finalizer.
pub fn hash_context(context: u64) -> u64 {
    let mut mixed = context.wrapping_add(0x9E37_79B9_7F4A_7C15);
    mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    mixed ^ (mixed >> 31)
}

/// Encodes one executed comparison `lhs CMP rhs` at `context` into compare
/// features, emitting each through `emit`.
///
/// Equal operands yield a single `cmp_eq` feature keyed by the hashed
/// context. Distinct operands yield one feature in each of the moddiff,
/// hamming and difflog domains, with the hashed context in the high bits and
/// the operand relation in the low six.
pub fn encode_cmp_observation(context: u64, lhs: u64, rhs: u64, mut emit: impl FnMut(Feature)) {
    let ctx = hash_context(context);
    if lhs == rhs {
        emit(domains::CMP_EQ.to_feature(ctx));
        return;
    }
    let keyed = |low: u64| ctx.wrapping_mul(64).wrapping_add(low);
    emit(domains::CMP_MODDIFF.to_feature(keyed(ab_to_cmp_moddiff(lhs, rhs))));
    emit(domains::CMP_HAMMING.to_feature(keyed(ab_to_cmp_hamming(lhs, rhs))));
    emit(domains::CMP_DIFFLOG.to_feature(keyed(ab_to_cmp_difflog(lhs, rhs))));
}

/// Drains a byte-set of 8-bit PC counters into `counters8` features.
///
/// Each non-zero counter byte becomes one feature via
/// [`convert_8bit_counter_to_number`]; the byte-set is left zeroed.
pub fn collect_counter_features<B: ByteSet, const CAPACITY: usize>(
    counters: &mut B,
    features: &mut FeatureArray<CAPACITY>,
) {
    counters.for_each_nonzero(
        |pc_index, value| {
            features
                .push(domains::COUNTERS8.to_feature(convert_8bit_counter_to_number(pc_index, value)));
        },
        0,
        B::SIZE_IN_BYTES,
    );
}

/// Drains a byte-set of PC presence flags into `pc` features, one per
/// touched index. The byte-set is left zeroed.
pub fn collect_pc_features<B: ByteSet, const CAPACITY: usize>(
    pcs: &mut B,
    features: &mut FeatureArray<CAPACITY>,
) {
    pcs.for_each_nonzero(
        |pc_index, _value| {
            features.push(domains::PC.to_feature(pc_index as u64));
        },
        0,
        B::SIZE_IN_BYTES,
    );
}

/// Pushes a user-domain feature, unless the mask has the slot disabled.
pub fn push_user_feature<const CAPACITY: usize>(
    mask: UserDomainMask,
    slot: usize,
    number: u64,
    features: &mut FeatureArray<CAPACITY>,
) {
    if mask.is_enabled(slot) {
        features.push(domains::USER[slot].to_feature(number));
    }
}

/// Bincode configuration of the wire format: little-endian, fixed-width
/// integers, so each feature occupies exactly eight bytes.
fn wire_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Encodes a feature batch for the engine.
///
/// The wire format requires at least one element, so an empty batch is sent
/// as the single [`domains::NO_FEATURE`] sentinel.
pub fn encode_feature_batch(features: &[Feature]) -> Result<Vec<u8>, CollectorError> {
    if features.is_empty() {
        return Ok(bincode::encode_to_vec(
            &[domains::NO_FEATURE][..],
            wire_config(),
        )?);
    }
    Ok(bincode::encode_to_vec(features, wire_config())?)
}

/// Decodes a feature batch from the runner, mapping the lone
/// [`domains::NO_FEATURE`] sentinel back to an empty batch.
pub fn decode_feature_batch(bytes: &[u8]) -> Result<FeatureVec, CollectorError> {
    let (features, _consumed): (FeatureVec, usize) =
        bincode::decode_from_slice(bytes, wire_config())?;
    if features == [domains::NO_FEATURE] {
        return Ok(Vec::new());
    }
    Ok(features)
}

/// Per-domain feature counts, keyed by domain label, for stats displays.
pub fn domain_breakdown(features: &[Feature]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for &feature in features {
        let id = Domain::of_feature(feature);
        let name = if id <= domains::NUM_DOMAINS {
            Domain::new(id).name()
        } else {
            "invalid"
        };
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}
