//! Bucket identifiers.
//!
//! The keyspace is split into buckets. A [`BucketId`] packs two things into a single u64:
//!  - the number of location bits that are significant for this bucket (the "used bits"), stored in the 6 most significant bits
//!  - the location bits themselves, stored in the remaining 58 bits
//!
//! A bucket with `n` used bits covers every location whose lowest `n` bits match its own.
//! Splitting a bucket increases the used bits by one, which is why ownership of every bucket
//! that shares the lowest `distribution_bits` bits is decided by the same seed.
//!
//! Buckets are always addressed within a [`BucketSpace`], each space having its own numbering and distribution.
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Number of bits reserved for the used-bits counter
pub const COUNT_BITS: u32 = 6;
/// Largest number of location bits a bucket can use
pub const MAX_USED_BITS: u8 = 58;

const LOCATION_MASK: u64 = (1u64 << (64 - COUNT_BITS)) - 1;

/// Returns a mask with the lowest `bits` bits set
pub(crate) fn low_bits_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "BucketIdRepr", into = "BucketIdRepr")]
pub struct BucketId(u64);

impl BucketId {
    /// Constructs a [`BucketId`] that uses `used_bits` bits of `location`.
    ///
    /// Location bits above `used_bits` are dropped. `used_bits` saturates at [`MAX_USED_BITS`].
    pub fn new(used_bits: u8, location: u64) -> Self {
        let used_bits = used_bits.min(MAX_USED_BITS);
        let location = location & low_bits_mask(used_bits) & LOCATION_MASK;
        Self(((used_bits as u64) << (64 - COUNT_BITS)) | location)
    }

    /// Reconstructs a [`BucketId`] from its packed representation
    pub fn from_raw(raw: u64) -> Self {
        Self::new((raw >> (64 - COUNT_BITS)) as u8, raw & LOCATION_MASK)
    }

    pub fn used_bits(&self) -> u8 {
        (self.0 >> (64 - COUNT_BITS)) as u8
    }

    /// The significant location bits of this bucket
    pub fn location(&self) -> u64 {
        self.0 & LOCATION_MASK
    }

    /// The packed u64 (used bits + location)
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Location bits truncated to the lowest `bits` bits.
    ///
    /// All buckets sharing this value are decided by the same distribution seed.
    pub fn seed(&self, bits: u8) -> u64 {
        self.location() & low_bits_mask(bits)
    }
}

impl std::fmt::Debug for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketId({:#018x})", self.0)
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Serialized form of a [`BucketId`]. Easier to write by hand than the packed integer.
#[derive(Clone, Serialize, Deserialize)]
struct BucketIdRepr {
    used_bits: u8,
    location: u64,
}

impl TryFrom<BucketIdRepr> for BucketId {
    type Error = String;

    fn try_from(repr: BucketIdRepr) -> Result<Self, Self::Error> {
        if repr.used_bits > MAX_USED_BITS {
            return Err(format!(
                "bucket id can use at most {} bits, got {}",
                MAX_USED_BITS, repr.used_bits
            ));
        }

        Ok(BucketId::new(repr.used_bits, repr.location))
    }
}

impl From<BucketId> for BucketIdRepr {
    fn from(id: BucketId) -> Self {
        Self {
            used_bits: id.used_bits(),
            location: id.location(),
        }
    }
}

/// A named partition universe. Each space has its own cluster state and distribution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BucketSpace {
    Default,
    Global,
}

impl BucketSpace {
    pub const ALL: [BucketSpace; 2] = [BucketSpace::Default, BucketSpace::Global];
}

/// A bucket within a given bucket space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub space: BucketSpace,
    pub id: BucketId,
}

impl Bucket {
    pub fn new(space: BucketSpace, id: BucketId) -> Self {
        Self { space, id }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bucket({}, {})", self.space, self.id)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{BucketId, BucketSpace, MAX_USED_BITS};

    #[test]
    fn location_is_masked_to_used_bits() {
        let id = BucketId::new(4, 0xff);
        assert_eq!(id.used_bits(), 4);
        assert_eq!(id.location(), 0xf);
    }

    #[test]
    fn packed_representation_round_trips() {
        let id = BucketId::new(16, 0x4);
        assert_eq!(id.raw(), (16u64 << 58) | 0x4);
        assert_eq!(BucketId::from_raw(id.raw()), id);
    }

    #[test]
    fn used_bits_saturate() {
        let id = BucketId::new(63, u64::MAX);
        assert_eq!(id.used_bits(), MAX_USED_BITS);
    }

    #[test]
    fn zero_used_bits_has_no_location() {
        let id = BucketId::new(0, 0x1234);
        assert_eq!(id.used_bits(), 0);
        assert_eq!(id.location(), 0);
    }

    #[test]
    fn seed_keeps_lowest_bits() {
        let id = BucketId::new(20, 0xabcde);
        assert_eq!(id.seed(8), 0xde);
        assert_eq!(id.seed(16), 0xbcde);
    }

    #[test]
    fn deserialize_rejects_too_many_bits() {
        let err = serde_json::from_str::<BucketId>(r#"{"used_bits": 60, "location": 1}"#);
        assert!(err.is_err());

        let id: BucketId = serde_json::from_str(r#"{"used_bits": 16, "location": 4}"#).unwrap();
        assert_eq!(id, BucketId::new(16, 4));
    }

    #[test]
    fn bucket_space_names() {
        assert_eq!(BucketSpace::Global.to_string(), "global");
        assert_eq!(
            BucketSpace::from_str("default").unwrap(),
            BucketSpace::Default
        );
    }
}
