//! Byte-level primitive codec: the pluggable encoding layer the replication
//! core drives. Values cross the wire as opaque length-prefixed byte runs;
//! everything here is positional, with no names and no self-description.

use thiserror::Error;

/// Errors that can occur while decoding wire bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The payload ended before the value was complete
    #[error("payload truncated: needed {needed} more byte(s), {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A variable-length integer ran past its maximum width
    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    /// The decoded bytes are not a valid value of the expected type
    #[error("invalid {value_type} encoding")]
    InvalidValue { value_type: &'static str },
}

/// Growable buffer that wire payloads are serialized into.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// LEB128 unsigned variable-length integer, 1-10 bytes.
    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buffer.push(byte);
                return;
            }
            self.buffer.push(byte | 0x80);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Length-prefixed byte run (varint length, then the bytes).
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over an incoming wire payload.
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 63 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 70 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Length-prefixed byte run, mirror of `ByteWriter::write_blob`.
    pub fn read_blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_u64()? as usize;
        self.take(len)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEnd {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buffer[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// A value that can live in a replicated property or event channel.
///
/// Implementations must be deterministic: the same value must encode to the
/// same bytes on every peer, since the wire format carries no type
/// information at all.
pub trait NetValue: Clone + PartialEq + Send + Sync + 'static {
    fn encode(&self, writer: &mut ByteWriter);
    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError>;
}

impl NetValue for bool {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(*self as u8);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidValue { value_type: "bool" }),
        }
    }
}

impl NetValue for u8 {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(*self);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        reader.read_u8()
    }
}

macro_rules! unsigned_net_value {
    ($ty:ty, $name:literal) => {
        impl NetValue for $ty {
            fn encode(&self, writer: &mut ByteWriter) {
                writer.write_var_u64(u64::from(*self));
            }

            fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
                let raw = reader.read_var_u64()?;
                <$ty>::try_from(raw).map_err(|_| CodecError::InvalidValue { value_type: $name })
            }
        }
    };
}

unsigned_net_value!(u16, "u16");
unsigned_net_value!(u32, "u32");
unsigned_net_value!(u64, "u64");

macro_rules! signed_net_value {
    ($ty:ty, $name:literal) => {
        impl NetValue for $ty {
            fn encode(&self, writer: &mut ByteWriter) {
                writer.write_var_u64(zigzag_encode(i64::from(*self)));
            }

            fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
                let raw = zigzag_decode(reader.read_var_u64()?);
                <$ty>::try_from(raw).map_err(|_| CodecError::InvalidValue { value_type: $name })
            }
        }
    };
}

signed_net_value!(i16, "i16");
signed_net_value!(i32, "i32");
signed_net_value!(i64, "i64");

impl NetValue for f32 {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(&self.to_le_bytes());
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        let bytes = reader.read_exact(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl NetValue for f64 {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(&self.to_le_bytes());
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        let bytes = reader.read_exact(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }
}

impl NetValue for String {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_blob(self.as_bytes());
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        let bytes = reader.read_blob()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::InvalidValue { value_type: "String" })
    }
}

impl NetValue for Vec<u8> {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_blob(self);
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        Ok(reader.read_blob()?.to_vec())
    }
}

// Vector / quaternion payloads.
impl<const N: usize> NetValue for [f32; N] {
    fn encode(&self, writer: &mut ByteWriter) {
        for component in self {
            component.encode(writer);
        }
    }

    fn decode(reader: &mut ByteReader) -> Result<Self, CodecError> {
        let mut out = [0f32; N];
        for component in out.iter_mut() {
            *component = f32::decode(reader)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: NetValue + std::fmt::Debug>(value: T) {
        let mut writer = ByteWriter::new();
        value.encode(&mut writer);
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes);
        let decoded = T::decode(&mut reader).unwrap();
        assert_eq!(value, decoded);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn varint_boundaries() {
        let mut writer = ByteWriter::new();
        writer.write_var_u64(0);
        writer.write_var_u64(127);
        writer.write_var_u64(128);
        writer.write_var_u64(u64::MAX);
        let bytes = writer.into_vec();

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_var_u64().unwrap(), 0);
        assert_eq!(reader.read_var_u64().unwrap(), 127);
        assert_eq!(reader.read_var_u64().unwrap(), 128);
        assert_eq!(reader.read_var_u64().unwrap(), u64::MAX);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn varint_single_byte_for_small_values() {
        let mut writer = ByteWriter::new();
        writer.write_var_u64(127);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);
        let result = reader.read_exact(3);
        assert_eq!(
            result.unwrap_err(),
            CodecError::UnexpectedEnd {
                needed: 3,
                remaining: 2
            }
        );
    }

    #[test]
    fn unterminated_varint_is_an_error() {
        let bytes = [0x80u8; 11];
        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(
            reader.read_var_u64(),
            Err(CodecError::VarintOverflow)
        ));
    }

    #[test]
    fn primitive_round_trips() {
        round_trip(true);
        round_trip(42u8);
        round_trip(40_000u16);
        round_trip(7_000_000u32);
        round_trip(-123_456i32);
        round_trip(3.5f32);
        round_trip(-0.25f64);
        round_trip(String::from("avatar/head"));
        round_trip(vec![1u8, 2, 3]);
        round_trip([0.0f32, 1.5, -2.5]);
        round_trip([0.0f32, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn bad_bool_byte_rejected() {
        let mut reader = ByteReader::new(&[7]);
        assert_eq!(
            bool::decode(&mut reader).unwrap_err(),
            CodecError::InvalidValue { value_type: "bool" }
        );
    }

    #[test]
    fn blob_round_trip() {
        let mut writer = ByteWriter::new();
        writer.write_blob(b"hello");
        writer.write_blob(b"");
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_blob().unwrap(), b"hello");
        assert_eq!(reader.read_blob().unwrap(), b"");
    }
}
