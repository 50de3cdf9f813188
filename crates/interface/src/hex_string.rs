use std::fmt::Display;

/// A [`hex`]-encoded 32-byte value, as used for vote ids, roots and
/// transaction hashes in wire-facing structures.
pub type HexHash = HexString<[u8; 32]>;

/// A [`serde`]-compatible newtype wrapper around [`Vec<u8>`] or other
/// bytes-like types, serialized as a 0x-prefixed hex string in
/// human-readable formats and as raw bytes otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HexString<T = Vec<u8>>(pub T);

impl<T> HexString<T> {
    /// Creates a new [`HexString`] from its inner contents.
    pub const fn new(bytes: T) -> Self {
        Self(bytes)
    }
}

impl<T> From<T> for HexString<T> {
    fn from(bytes: T) -> Self {
        Self(bytes)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for HexString<T> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<T> Display for HexString<T>
where
    T: AsRef<[u8]>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl<T> serde::Serialize for HexString<T>
where
    T: AsRef<[u8]>,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(self.0.as_ref())
        }
    }
}

impl<'de, T> serde::Deserialize<'de> for HexString<T>
where
    T: TryFrom<Vec<u8>>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize;

        let bytes = if deserializer.is_human_readable() {
            let string = String::deserialize(deserializer)?;
            let s = string
                .strip_prefix("0x")
                .ok_or_else(|| serde::de::Error::custom("Missing 0x prefix"))?;

            hex::decode(s)
                .map_err(|e| anyhow::anyhow!("failed to decode hex: {}", e))
                .map_err(serde::de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };

        Ok(HexString(bytes.try_into().map_err(|_| {
            serde::de::Error::custom("Invalid hex string length")
        })?))
    }
}

/// [`serde`] (de)serialization functions for [`HexString`], to be used with
/// `#[serde(with = "...")]`.
pub mod hex_string_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::HexString;

    /// Serializes `data` as a lowercase hex string prefixed with `0x`.
    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        HexString::<T>::new(data).serialize(serializer)
    }

    /// Deserializes a hex string into raw bytes.
    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        HexString::<T>::deserialize(deserializer).map(|s| s.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_string_display_and_roundtrip() {
        let value = HexString(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(value.to_string(), "0xdeadbeef");

        let serialized = serde_json::to_string(&value).unwrap();
        assert_eq!(serialized, "\"0xdeadbeef\"");
        let deserialized: HexString = serde_json::from_str(&serialized).unwrap();
        assert_eq!(value, deserialized);
    }

    #[test]
    fn fixed_length_hash_rejects_wrong_size() {
        let result: Result<HexHash, _> = serde_json::from_str("\"0xdead\"");
        assert!(result.is_err());

        let result: Result<HexHash, _> = serde_json::from_str("\"deadbeef\"");
        assert!(result.is_err());
    }
}
