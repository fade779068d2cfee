//! Deterministic hashing used to bucket contexts into variants.
//!
//! All "randomness" in assignment is a hash of identity fields. Sharders are injectable so tests
//! can assert exact bucket outputs.
use std::io;

use serde::Serialize;
use serde_json::{ser::Formatter, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::AssignmentError;

/// Hash function used to derive buckets.
pub trait Sharder {
    /// Raw digest of `input`.
    fn digest(&self, input: &[u8]) -> Vec<u8>;

    /// Lowercase hex encoding of [`Sharder::digest`].
    fn hex_digest(&self, input: &[u8]) -> String {
        self.digest(input)
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }
}

/// SHA-256 sharder. Used for the assignment key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Sharder;

impl Sharder for Sha256Sharder {
    fn digest(&self, input: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(input);
        hasher.finalize().to_vec()
    }
}

/// MD5 sharder. Used for geographic and user-attribute buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn digest(&self, input: &[u8]) -> Vec<u8> {
        md5::compute(input).0.to_vec()
    }
}

/// Position of a context in the `[0, 0xFFFFFFFF]` hash space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// First 32 bits of the hash, big-endian.
    pub hash_value: u32,
    /// `hash_value` scaled to `[0, 100]`.
    pub hash_percentage: f64,
}

impl Bucket {
    /// Derive a bucket from the first 8 hex characters of `hex`.
    pub fn from_hex(hex: &str) -> Option<Bucket> {
        let prefix = hex.get(0..8)?;
        u32::from_str_radix(prefix, 16).ok().map(Bucket::from_value)
    }

    /// Wrap a raw hash value.
    pub fn from_value(hash_value: u32) -> Bucket {
        Bucket {
            hash_value,
            hash_percentage: hash_value as f64 / u32::MAX as f64 * 100.0,
        }
    }

    /// `hash_value` scaled to `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        self.hash_value as f64 / u32::MAX as f64
    }

    /// Index into a list of `len` items (`hash_value mod len`). `len` must be non-zero.
    pub fn index(&self, len: usize) -> usize {
        (self.hash_value as u64 % len as u64) as usize
    }

    /// Traffic gate: the bucket is admitted when it does not exceed `traffic_percentage`. Zero
    /// traffic admits nothing.
    pub fn admitted(&self, traffic_percentage: f64) -> bool {
        traffic_percentage > 0.0 && self.hash_percentage <= traffic_percentage
    }
}

/// Hash `value` with `sharder` and derive a [`Bucket`] from its hex digest.
pub(crate) fn bucket_for<T: Serialize + ?Sized>(
    sharder: &dyn Sharder,
    value: &T,
) -> Result<Bucket, AssignmentError> {
    let input = canonical_json(value).map_err(|err| AssignmentError::HashInput(err.to_string()))?;
    Bucket::from_hex(&sharder.hex_digest(&input)).ok_or(AssignmentError::ShortDigest)
}

/// Serialize `value` as JSON with recursively sorted object keys and `", "` / `": "` separators.
///
/// This is the byte layout existing experiment buckets were computed over, so it must not
/// change.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_keys_and_spaces_separators() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a": {"c": "x", "d": [1, 2]}, "b": 1}"#
        );
    }

    #[test]
    fn md5_hex_digest() {
        assert_eq!(
            Md5Sharder.hex_digest(b"US_CA"),
            "7b64b48ba4089cb64d2ce5d6d3835ca2"
        );
    }

    #[test]
    fn sha256_hex_digest() {
        assert_eq!(
            Sha256Sharder.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bucket_from_hex() {
        let bucket = Bucket::from_hex("ffffffff00").unwrap();
        assert_eq!(bucket.hash_value, u32::MAX);
        assert_eq!(bucket.hash_percentage, 100.0);

        let bucket = Bucket::from_hex("00000000").unwrap();
        assert_eq!(bucket.hash_percentage, 0.0);
        assert!(!bucket.admitted(0.0));
        assert!(bucket.admitted(0.5));

        assert_eq!(Bucket::from_hex("0000001").map(|b| b.hash_value), None);
        assert_eq!(Bucket::from_hex("zzzzzzzz"), None);
    }

    #[test]
    fn bucket_index_wraps() {
        let bucket = Bucket::from_value(7);
        assert_eq!(bucket.index(3), 1);
        assert_eq!(bucket.index(1), 0);
    }
}
