//! Message encoding schemes.
//!
//! A codec converts between the application payload seen by choreographies
//! and the representation a transport carries. Codec failures are reported as
//! [`TroupeError::Encoding`], never as transmission failures.

use std::marker::PhantomData;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{Result, TroupeError};

/// Bidirectional payload codec.
pub trait MessageCodec<P, M>: Send + Sync {
    /// Encode an application payload.
    fn encode(&self, payload: &P) -> Result<M>;

    /// Decode a transport payload.
    fn decode(&self, raw: M) -> Result<P>;
}

/// Passes payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl<P: Clone + Send + Sync> MessageCodec<P, P> for IdentityCodec {
    fn encode(&self, payload: &P) -> Result<P> {
        Ok(payload.clone())
    }

    fn decode(&self, raw: P) -> Result<P> {
        Ok(raw)
    }
}

/// Serializes payloads to bytes with bincode.
#[derive(Debug)]
pub struct BincodeCodec<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> BincodeCodec<P> {
    /// Create a bincode codec.
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<P> Default for BincodeCodec<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for BincodeCodec<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<P: Serialize + DeserializeOwned> MessageCodec<P, Vec<u8>> for BincodeCodec<P> {
    fn encode(&self, payload: &P) -> Result<Vec<u8>> {
        Ok(bincode::serialize(payload)?)
    }

    fn decode(&self, raw: Vec<u8>) -> Result<P> {
        Ok(bincode::deserialize(&raw)?)
    }
}

/// Serializes payloads with bincode, then wraps the bytes in standard base64
/// so they survive text-only transports.
#[derive(Debug)]
pub struct Base64Codec<P> {
    bytes: BincodeCodec<P>,
}

impl<P> Base64Codec<P> {
    /// Create a base64 codec.
    pub fn new() -> Self {
        Self {
            bytes: BincodeCodec::new(),
        }
    }
}

impl<P> Default for Base64Codec<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for Base64Codec<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<P: Serialize + DeserializeOwned> MessageCodec<P, String> for Base64Codec<P> {
    fn encode(&self, payload: &P) -> Result<String> {
        Ok(STANDARD.encode(self.bytes.encode(payload)?))
    }

    fn decode(&self, raw: String) -> Result<P> {
        let bytes = STANDARD
            .decode(raw.as_bytes())
            .map_err(|e| TroupeError::encoding(format!("invalid base64: {e}")))?;
        self.bytes.decode(bytes)
    }
}

/// A codec built from a pair of closures.
pub struct FnCodec<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> FnCodec<E, D> {
    /// Create a codec from an encoder and a decoder.
    pub fn new(encode: E, decode: D) -> Self {
        Self { encode, decode }
    }
}

impl<P, M, E, D> MessageCodec<P, M> for FnCodec<E, D>
where
    E: Fn(&P) -> Result<M> + Send + Sync,
    D: Fn(M) -> Result<P> + Send + Sync,
{
    fn encode(&self, payload: &P) -> Result<M> {
        (self.encode)(payload)
    }

    fn decode(&self, raw: M) -> Result<P> {
        (self.decode)(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_base64_is_text_safe() {
        let codec = Base64Codec::<Vec<u32>>::new();
        let text = codec.encode(&vec![1, 2, 3]).unwrap();
        assert!(text.is_ascii());
        assert_eq!(codec.decode(text).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_failures_are_encoding_errors() {
        let codec = Base64Codec::<u64>::new();
        assert_matches!(
            codec.decode("not base64!".to_string()),
            Err(TroupeError::Encoding { .. })
        );

        let bytes = BincodeCodec::<u64>::new();
        assert_matches!(bytes.decode(vec![1]), Err(TroupeError::Encoding { .. }));
    }

    #[test]
    fn test_fn_codec() {
        let codec = FnCodec::new(
            |n: &i64| -> Result<String> { Ok(n.to_string()) },
            |s: String| -> Result<i64> {
                s.parse::<i64>()
                    .map_err(|e| TroupeError::encoding(e.to_string()))
            },
        );
        assert_eq!(codec.encode(&-12).unwrap(), "-12");
        assert_eq!(codec.decode("7".to_string()).unwrap(), 7);
        assert!(codec.decode("seven".to_string()).is_err());
    }
}
