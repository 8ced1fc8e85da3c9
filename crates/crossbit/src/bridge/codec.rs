//! Framed codec for the bulk-data channel.
//!
//! Every payload is written as `XBIT` magic, one format-version byte, then a
//! length-delimited frame (4-byte big-endian length + payload). The payload is
//! serde_json for format 1 and bincode for format 2.

use std::fmt;
use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const MAGIC: &[u8; 4] = b"XBIT";

const HEADER_LEN: usize = MAGIC.len() + 1;

/// Serialization format used on the bulk-data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FormatVersion {
    Json = 1,
    Binary = 2,
}

impl FormatVersion {
    pub const MIN: Self = Self::Json;
    pub const LATEST: Self = Self::Binary;

    pub fn from_u8(version: u8) -> Result<Self, CodecError> {
        match version {
            1 => Ok(Self::Json),
            2 => Ok(Self::Binary),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The version a worker answers with when the controller asks for
    /// `requested`: the highest version both sides understand.
    pub fn negotiate(requested: u8) -> Result<Self, CodecError> {
        if requested < Self::MIN.as_u8() {
            return Err(CodecError::UnsupportedVersion(requested));
        }
        Self::from_u8(requested.min(Self::LATEST.as_u8()))
    }

    fn serialize<T: Serialize>(self, item: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(item).map_err(|e| CodecError::Encode(e.to_string())),
            Self::Binary => bincode::serialize(item).map_err(|e| CodecError::Encode(e.to_string())),
        }
    }

    fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            Self::Binary => {
                bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "1 (json)"),
            Self::Binary => write!(f, "2 (binary)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("format version mismatch: negotiated {expected}, payload has {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("bulk-data payload does not start with the expected magic bytes")]
    BadMagic,

    #[error("bulk-data payload is truncated")]
    Truncated,

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that writes the envelope header and serializes with the negotiated
/// format.
pub struct PayloadCodec<T> {
    version: FormatVersion,
    inner: LengthDelimitedCodec,
    header_seen: bool,
    _phantom: PhantomData<T>,
}

impl<T> PayloadCodec<T> {
    pub fn new(version: FormatVersion) -> Self {
        Self {
            version,
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(u32::MAX as usize)
                .new_codec(),
            header_seen: false,
            _phantom: PhantomData,
        }
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }
}

impl<T: DeserializeOwned> Decoder for PayloadCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.header_seen {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            if &src[..MAGIC.len()] != MAGIC {
                return Err(CodecError::BadMagic);
            }
            let found = src[MAGIC.len()];
            if found != self.version.as_u8() {
                return Err(CodecError::VersionMismatch {
                    expected: self.version.as_u8(),
                    found,
                });
            }
            src.advance(HEADER_LEN);
            self.header_seen = true;
        }
        match self.inner.decode(src)? {
            Some(frame) => {
                self.header_seen = false;
                Ok(Some(self.version.deserialize(&frame)?))
            }
            None => Ok(None),
        }
    }
}

impl<'a, T: Serialize> Encoder<&'a T> for PayloadCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: &'a T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.version.serialize(item)?;
        tracing::trace!(payload_size_bytes = payload.len(), version = %self.version, "Encoding payload");
        dst.reserve(HEADER_LEN);
        dst.put_slice(MAGIC);
        dst.put_u8(self.version.as_u8());
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

/// Encode one payload into a standalone buffer.
pub fn encode_payload<T: Serialize>(version: FormatVersion, item: &T) -> Result<Vec<u8>, CodecError> {
    let mut codec = PayloadCodec::<T>::new(version);
    let mut buf = BytesMut::new();
    codec.encode(item, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode exactly one payload from a complete buffer.
pub fn decode_payload<T: DeserializeOwned>(
    version: FormatVersion,
    bytes: &[u8],
) -> Result<T, CodecError> {
    let mut codec = PayloadCodec::<T>::new(version);
    let mut buf = BytesMut::from(bytes);
    match codec.decode(&mut buf)? {
        Some(item) => Ok(item),
        None if bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] != MAGIC => {
            Err(CodecError::BadMagic)
        }
        None => Err(CodecError::Truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Call, Kwargs, Value};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn sample() -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("pump"));
        map.insert("gain".to_string(), Value::from(-2.5));
        Value::List(vec![
            Value::None,
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::complex(1.0, -1.0),
            Value::bytes(vec![0u8, 255, 10]),
            Value::Map(map),
        ])
    }

    #[test]
    fn negotiate_picks_highest_common_version() {
        assert_eq!(FormatVersion::negotiate(1).unwrap(), FormatVersion::Json);
        assert_eq!(FormatVersion::negotiate(2).unwrap(), FormatVersion::Binary);
        assert_eq!(FormatVersion::negotiate(9).unwrap(), FormatVersion::Binary);
        assert!(matches!(
            FormatVersion::negotiate(0),
            Err(CodecError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn values_survive_both_formats() {
        for version in [FormatVersion::Json, FormatVersion::Binary] {
            let bytes = encode_payload(version, &sample()).unwrap();
            let decoded: Value = decode_payload(version, &bytes).unwrap();
            assert_eq!(decoded, sample(), "format {version}");
        }
    }

    #[test]
    fn calls_survive_both_formats() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("timeout".into(), Value::Float(0.25));
        let call = Call::new(vec![Value::from(2), Value::from("x")], kwargs);
        for version in [FormatVersion::Json, FormatVersion::Binary] {
            let bytes = encode_payload(version, &call).unwrap();
            assert_eq!(decode_payload::<Call>(version, &bytes).unwrap(), call);
        }
    }

    fn finite() -> impl Strategy<Value = f64> {
        prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO
    }

    fn value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::None),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            finite().prop_map(Value::Float),
            (finite(), finite()).prop_map(|(re, im)| Value::complex(re, im)),
            ".{0,16}".prop_map(Value::Str),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 48, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                prop::collection::btree_map(".{0,8}", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    fn call() -> impl Strategy<Value = Call> {
        (
            prop::collection::vec(value(), 0..4),
            prop::collection::btree_map("[a-z_]{1,12}", value(), 0..4),
        )
            .prop_map(|(args, kwargs)| Call::new(args, kwargs))
    }

    proptest! {
        #[test]
        fn any_value_survives_both_formats(original in value()) {
            for version in [FormatVersion::Json, FormatVersion::Binary] {
                let bytes = encode_payload(version, &original).unwrap();
                let decoded: Value = decode_payload(version, &bytes).unwrap();
                prop_assert_eq!(&decoded, &original, "format {}", version);
            }
        }

        #[test]
        fn any_call_survives_both_formats(original in call()) {
            for version in [FormatVersion::Json, FormatVersion::Binary] {
                let bytes = encode_payload(version, &original).unwrap();
                let decoded: Call = decode_payload(version, &bytes).unwrap();
                prop_assert_eq!(&decoded, &original, "format {}", version);
            }
        }
    }

    #[test]
    fn header_layout() {
        let bytes = encode_payload(FormatVersion::Json, &Value::Int(7)).unwrap();
        assert_eq!(&bytes[..4], b"XBIT");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 9]);
        assert_eq!(&bytes[9..], br#"{"int":7}"#);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode_payload(FormatVersion::Binary, &sample()).unwrap();
        bytes[0] = b'Z';
        assert!(matches!(
            decode_payload::<Value>(FormatVersion::Binary, &bytes),
            Err(CodecError::BadMagic)
        ));
    }

    #[test]
    fn rejects_other_version() {
        let bytes = encode_payload(FormatVersion::Json, &sample()).unwrap();
        assert!(matches!(
            decode_payload::<Value>(FormatVersion::Binary, &bytes),
            Err(CodecError::VersionMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = encode_payload(FormatVersion::Binary, &sample()).unwrap();
        assert!(matches!(
            decode_payload::<Value>(FormatVersion::Binary, &bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated)
        ));
        assert!(matches!(
            decode_payload::<Value>(FormatVersion::Binary, &bytes[..3]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn decoder_handles_partial_input() {
        let bytes = encode_payload(FormatVersion::Json, &sample()).unwrap();
        let mut codec = PayloadCodec::<Value>::new(FormatVersion::Json);
        let mut buf = BytesMut::from(&bytes[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[7..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample()));
    }
}
