use fxhash::hash64;

/// An opaque 128-bit key fingerprint.
///
/// The `bucket` half drives both cache-index bucket selection and shard
/// assignment; the `tag` half disambiguates entries within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint {
    /// Uniformly distributed bucket component.
    pub bucket: u64,
    /// Tag component for in-bucket disambiguation.
    pub tag: u64,
}

impl KeyFingerprint {
    /// Fingerprints a raw key. The two halves are derived from
    /// independently seeded hashes so bucket and tag collisions are
    /// uncorrelated.
    pub fn from_key(key: &[u8]) -> Self {
        KeyFingerprint {
            bucket: hash64(key),
            tag: hash64(&(hash64(key), 0x9e37_79b9_7f4a_7c15u64)),
        }
    }

    /// Builds a fingerprint from raw parts. Used by the wire codec and
    /// by tests that need to pin shard placement.
    pub fn from_parts(bucket: u64, tag: u64) -> Self {
        KeyFingerprint { bucket, tag }
    }
}
