//! Codec contract and built-in codecs.
//!
//! A codec runs in two phases on the encode side: `preencode` sizes the
//! output, then `encode` writes into a buffer reserved to exactly that
//! size. The [`encode`] and [`decode`] free functions are the standard
//! wrappers the rest of the workspace calls; they drive the state objects
//! so codec implementations never allocate themselves.

use crate::error::ProtocolError;
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Encoder state: a running size during `preencode`, a write buffer
/// during `encode`.
#[derive(Debug, Default)]
pub struct EncodeState {
    len: usize,
    buf: BytesMut,
}

impl EncodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` bytes to the predicted output size.
    pub fn add(&mut self, n: usize) {
        self.len += n;
    }

    /// Returns the predicted output size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserves the buffer sized by the preencode pass.
    pub fn reserve(&mut self) {
        self.buf.reserve(self.len);
    }

    /// Appends bytes to the output.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Appends a single byte to the output.
    pub fn put_u8(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    /// Consumes the state, yielding the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Decoder state: a cursor over the input bytes.
#[derive(Debug)]
pub struct DecodeState<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DecodeState<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes `n` bytes, failing if fewer remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::OutOfBounds {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consumes a single byte.
    pub fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Consumes everything left in the input.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Consumes an unsigned LEB128 varint.
    pub fn take_uvarint(&mut self) -> Result<u64, ProtocolError> {
        let mut out: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self
                .take_u8()
                .map_err(|_| ProtocolError::InvalidVarint)?;
            if shift == 63 && byte > 1 {
                return Err(ProtocolError::InvalidVarint);
            }
            out |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
            if shift > 63 {
                return Err(ProtocolError::InvalidVarint);
            }
        }
    }
}

/// Number of bytes an unsigned LEB128 varint occupies.
pub fn uvarint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Writes an unsigned LEB128 varint into the encoder state.
pub fn put_uvarint(state: &mut EncodeState, mut value: u64) {
    while value >= 0x80 {
        state.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    state.put_u8(value as u8);
}

/// A payload codec.
pub trait Codec: Send + Sync {
    /// First encode pass: predict the output size via [`EncodeState::add`].
    fn preencode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError>;

    /// Second encode pass: write the value into the reserved buffer.
    fn encode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError>;

    /// Decodes a value from the cursor.
    fn decode(&self, state: &mut DecodeState<'_>) -> Result<Value, ProtocolError>;

    /// Whether this codec is the raw pass-through (the identity on bytes
    /// and on already-decoded values).
    fn is_passthrough(&self) -> bool {
        false
    }
}

/// Encodes a value with the given codec, driving both encode phases.
pub fn encode(codec: &dyn Codec, value: &Value) -> Result<Bytes, ProtocolError> {
    let mut state = EncodeState::new();
    codec.preencode(&mut state, value)?;
    state.reserve();
    codec.encode(&mut state, value)?;
    Ok(state.finish())
}

/// Decodes a value with the given codec, rejecting trailing bytes.
pub fn decode(codec: &dyn Codec, bytes: &[u8]) -> Result<Value, ProtocolError> {
    let mut state = DecodeState::new(bytes);
    let value = codec.decode(&mut state)?;
    if state.remaining() > 0 {
        return Err(ProtocolError::TrailingBytes(state.remaining()));
    }
    Ok(value)
}

/// Decodes an in-pipeline value.
///
/// The pass-through codec leaves any value untouched; every other codec
/// expects the value to still be raw wire bytes.
pub fn decode_value(codec: &dyn Codec, value: Value) -> Result<Value, ProtocolError> {
    if codec.is_passthrough() {
        return Ok(value);
    }
    match value {
        Value::Raw(bytes) => decode(codec, &bytes),
        other => Err(ProtocolError::UnsupportedValue(other.kind())),
    }
}

/// The identity codec on bytes.
///
/// Text and JSON values are coerced to their byte form on encode so a
/// handler may return any variant under the default encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn preencode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        let len = match value {
            Value::Raw(bytes) => bytes.len(),
            Value::Text(text) => text.len(),
            Value::Json(doc) => serde_json::to_vec(doc)?.len(),
        };
        state.add(len);
        Ok(())
    }

    fn encode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        match value {
            Value::Raw(bytes) => state.put_slice(bytes),
            Value::Text(text) => state.put_slice(text.as_bytes()),
            Value::Json(doc) => state.put_slice(&serde_json::to_vec(doc)?),
        }
        Ok(())
    }

    fn decode(&self, state: &mut DecodeState<'_>) -> Result<Value, ProtocolError> {
        Ok(Value::Raw(Bytes::copy_from_slice(state.take_rest())))
    }

    fn is_passthrough(&self) -> bool {
        true
    }
}

/// Length-prefixed UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    fn preencode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        let text = value
            .as_text()
            .ok_or(ProtocolError::UnsupportedValue("utf8 codec expects text"))?;
        state.add(uvarint_len(text.len() as u64));
        state.add(text.len());
        Ok(())
    }

    fn encode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        let text = value
            .as_text()
            .ok_or(ProtocolError::UnsupportedValue("utf8 codec expects text"))?;
        put_uvarint(state, text.len() as u64);
        state.put_slice(text.as_bytes());
        Ok(())
    }

    fn decode(&self, state: &mut DecodeState<'_>) -> Result<Value, ProtocolError> {
        let len = state.take_uvarint()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidVarint)?;
        let bytes = state.take(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Value::Text(text.to_string()))
    }
}

/// JSON documents in their compact serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn preencode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        let doc = value
            .as_json()
            .ok_or(ProtocolError::UnsupportedValue("json codec expects json"))?;
        state.add(serde_json::to_vec(doc)?.len());
        Ok(())
    }

    fn encode(&self, state: &mut EncodeState, value: &Value) -> Result<(), ProtocolError> {
        let doc = value
            .as_json()
            .ok_or(ProtocolError::UnsupportedValue("json codec expects json"))?;
        state.put_slice(&serde_json::to_vec(doc)?);
        Ok(())
    }

    fn decode(&self, state: &mut DecodeState<'_>) -> Result<Value, ProtocolError> {
        let doc = serde_json::from_slice(state.take_rest())?;
        Ok(Value::Json(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_roundtrip_is_identity() {
        let input = Value::raw(&b"\x00\x01binary\xff"[..]);
        let bytes = encode(&RawCodec, &input).unwrap();
        assert_eq!(bytes.as_ref(), b"\x00\x01binary\xff");
        assert_eq!(decode(&RawCodec, &bytes).unwrap(), input);
    }

    #[test]
    fn test_raw_coerces_text_and_json() {
        let bytes = encode(&RawCodec, &Value::text("foo")).unwrap();
        assert_eq!(bytes.as_ref(), b"foo");

        let bytes = encode(&RawCodec, &Value::json(json!({"k": true}))).unwrap();
        assert_eq!(bytes.as_ref(), br#"{"k":true}"#);
    }

    #[test]
    fn test_utf8_roundtrip() {
        let input = Value::text("héllo wörld");
        let bytes = encode(&Utf8Codec, &input).unwrap();
        assert_eq!(decode(&Utf8Codec, &bytes).unwrap(), input);
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        // Valid length prefix, invalid UTF-8 body.
        let result = decode(&Utf8Codec, &[2, 0xff, 0xfe]);
        assert!(matches!(result, Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_utf8_rejects_truncated_body() {
        // Prefix promises 10 bytes but only 2 follow.
        let result = decode(&Utf8Codec, &[10, b'h', b'i']);
        assert!(matches!(result, Err(ProtocolError::OutOfBounds { .. })));
    }

    #[test]
    fn test_utf8_rejects_trailing_bytes() {
        let mut bytes = encode(&Utf8Codec, &Value::text("hi")).unwrap().to_vec();
        bytes.push(0);
        let result = decode(&Utf8Codec, &bytes);
        assert!(matches!(result, Err(ProtocolError::TrailingBytes(1))));
    }

    #[test]
    fn test_utf8_rejects_non_text_value() {
        let result = encode(&Utf8Codec, &Value::raw(&b"raw"[..]));
        assert!(matches!(result, Err(ProtocolError::UnsupportedValue(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let input = Value::json(json!({"a": [1, 2, 3], "b": "x"}));
        let bytes = encode(&JsonCodec, &input).unwrap();
        assert_eq!(decode(&JsonCodec, &bytes).unwrap(), input);
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(decode(&JsonCodec, b"not json").is_err());
    }

    #[test]
    fn test_decode_value_passthrough_preserves_decoded_form() {
        let text = Value::text("already decoded");
        let out = decode_value(&RawCodec, text.clone()).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn test_decode_value_rejects_double_decode() {
        let result = decode_value(&Utf8Codec, Value::text("decoded"));
        assert!(matches!(result, Err(ProtocolError::UnsupportedValue(_))));
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut state = EncodeState::new();
            state.add(uvarint_len(value));
            state.reserve();
            put_uvarint(&mut state, value);
            let bytes = state.finish();
            assert_eq!(bytes.len(), uvarint_len(value));

            let mut cursor = DecodeState::new(&bytes);
            assert_eq!(cursor.take_uvarint().unwrap(), value);
            assert_eq!(cursor.remaining(), 0);
        }
    }

    #[test]
    fn test_uvarint_rejects_overflow() {
        // Eleven continuation bytes overflow 64 bits.
        let bytes = [0xffu8; 11];
        let mut cursor = DecodeState::new(&bytes);
        assert!(matches!(
            cursor.take_uvarint(),
            Err(ProtocolError::InvalidVarint)
        ));
    }

    #[test]
    fn test_uvarint_rejects_truncation() {
        let mut cursor = DecodeState::new(&[0x80]);
        assert!(cursor.take_uvarint().is_err());
    }
}
