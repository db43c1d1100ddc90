//! Feature hashing of categorical values.
//!
//! Buckets are compatible with scikit-learn's `FeatureHasher(input_type="string",
//! alternate_sign=False)`: the value's UTF-8 bytes are hashed with 32 bit MurmurHash3 (x86
//! variant, seed 0), the hash is read as a signed integer and its absolute value modulo the
//! bucket count selects the bucket. Every value adds `1.0` to its bucket, so there is no sign
//! cancellation between colliding values.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Computes the 32 bit x86 MurmurHash3 of `data`.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        hash ^= scramble(k);
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0_u32;
        for (shift, byte) in tail.iter().enumerate() {
            k ^= u32::from(*byte) << (8 * shift);
        }
        hash ^= scramble(k);
    }

    hash ^= data.len() as u32;
    fmix32(hash)
}

fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

fn fmix32(mut hash: u32) -> u32 {
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^ (hash >> 16)
}

/// Maps a categorical value to one of `buckets` columns.
///
/// # Panics
/// Panics if `buckets` is zero.
pub fn bucket(value: &str, buckets: usize) -> usize {
    assert!(buckets > 0, "at least one hash bucket is required");
    let signed = murmur3_32(value.as_bytes(), 0) as i32;
    // `unsigned_abs` also covers i32::MIN, i.e. 2^31 mod buckets
    (signed.unsigned_abs() as u64 % buckets as u64) as usize
}
