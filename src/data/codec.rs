//! Endian-aware cell codec.
//!
//! Every primitive value on disk is encoded against the endianness tag
//! recorded in the table header, regardless of host byte order. The
//! codec is total: malformed input decodes to a `Corrupt` error, never
//! to a silent zero.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::types::{Complex32, Complex64, DataType, Value};
use crate::{Result, TableError};

/// On-disk byte order for one table.
///
/// `native()` resolves the host order at table-creation time; the
/// resolved tag is persisted and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Endian {
    Big = 0,
    Little = 1,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Endian::Big),
            1 => Some(Endian::Little),
            _ => None,
        }
    }

    #[inline]
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Big => BigEndian::read_u16(buf),
            Endian::Little => LittleEndian::read_u16(buf),
        }
    }

    #[inline]
    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Big => BigEndian::read_u32(buf),
            Endian::Little => LittleEndian::read_u32(buf),
        }
    }

    #[inline]
    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Big => BigEndian::read_u64(buf),
            Endian::Little => LittleEndian::read_u64(buf),
        }
    }

    #[inline]
    pub fn read_i16(self, buf: &[u8]) -> i16 {
        self.read_u16(buf) as i16
    }

    #[inline]
    pub fn read_i32(self, buf: &[u8]) -> i32 {
        self.read_u32(buf) as i32
    }

    #[inline]
    pub fn read_i64(self, buf: &[u8]) -> i64 {
        self.read_u64(buf) as i64
    }

    #[inline]
    pub fn read_f32(self, buf: &[u8]) -> f32 {
        f32::from_bits(self.read_u32(buf))
    }

    #[inline]
    pub fn read_f64(self, buf: &[u8]) -> f64 {
        f64::from_bits(self.read_u64(buf))
    }

    #[inline]
    pub fn write_u16(self, buf: &mut [u8], v: u16) {
        match self {
            Endian::Big => BigEndian::write_u16(buf, v),
            Endian::Little => LittleEndian::write_u16(buf, v),
        }
    }

    #[inline]
    pub fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            Endian::Big => BigEndian::write_u32(buf, v),
            Endian::Little => LittleEndian::write_u32(buf, v),
        }
    }

    #[inline]
    pub fn write_u64(self, buf: &mut [u8], v: u64) {
        match self {
            Endian::Big => BigEndian::write_u64(buf, v),
            Endian::Little => LittleEndian::write_u64(buf, v),
        }
    }

    #[inline]
    pub fn write_i16(self, buf: &mut [u8], v: i16) {
        self.write_u16(buf, v as u16)
    }

    #[inline]
    pub fn write_i32(self, buf: &mut [u8], v: i32) {
        self.write_u32(buf, v as u32)
    }

    #[inline]
    pub fn write_i64(self, buf: &mut [u8], v: i64) {
        self.write_u64(buf, v as u64)
    }

    #[inline]
    pub fn write_f32(self, buf: &mut [u8], v: f32) {
        self.write_u32(buf, v.to_bits())
    }

    #[inline]
    pub fn write_f64(self, buf: &mut [u8], v: f64) {
        self.write_u64(buf, v.to_bits())
    }

    /// Append a u32 to a growing buffer.
    #[inline]
    pub fn put_u32(self, out: &mut Vec<u8>, v: u32) {
        let mut b = [0u8; 4];
        self.write_u32(&mut b, v);
        out.extend_from_slice(&b);
    }

    /// Append a u64 to a growing buffer.
    #[inline]
    pub fn put_u64(self, out: &mut Vec<u8>, v: u64) {
        let mut b = [0u8; 8];
        self.write_u64(&mut b, v);
        out.extend_from_slice(&b);
    }

    /// Append a u16 to a growing buffer.
    #[inline]
    pub fn put_u16(self, out: &mut Vec<u8>, v: u16) {
        let mut b = [0u8; 2];
        self.write_u16(&mut b, v);
        out.extend_from_slice(&b);
    }
}

fn truncated(what: &str) -> TableError {
    TableError::Corrupt(format!("truncated record while decoding {what}"))
}

type EncodeFn = fn(&Value, Endian, &mut Vec<u8>) -> Result<usize>;
type DecodeFn = fn(&[u8], Endian) -> Result<(Value, usize)>;

/// Type-indexed encoder/decoder pair for one element type.
///
/// For variable-size types the encoder reports the encoded length so the
/// storage managers can size their in-bucket entries before writing.
#[derive(Clone, Copy)]
pub struct Codec {
    pub dtype: DataType,
    /// `None` marks a variable-length encoding.
    pub fixed_size: Option<usize>,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl Codec {
    /// Look up the codec for an element type.
    pub fn for_type(dtype: DataType) -> Codec {
        CODECS[dtype as u8 as usize]
    }

    /// Encode `v` into `out`, returning the encoded length.
    pub fn encode(&self, v: &Value, endian: Endian, out: &mut Vec<u8>) -> Result<usize> {
        if v.data_type() != self.dtype {
            return Err(TableError::TypeMismatch(format!(
                "cannot store {:?} value in {:?} column",
                v.data_type(),
                self.dtype
            )));
        }
        (self.encode)(v, endian, out)
    }

    /// Encoded length of `v` without writing it.
    pub fn encoded_len(&self, v: &Value) -> usize {
        match self.fixed_size {
            Some(n) => n,
            None => match v {
                Value::Str(s) => 4 + s.len(),
                _ => 0,
            },
        }
    }

    /// Decode one value from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode(&self, bytes: &[u8], endian: Endian) -> Result<(Value, usize)> {
        (self.decode)(bytes, endian)
    }
}

fn encode_bool(v: &Value, _e: Endian, out: &mut Vec<u8>) -> Result<usize> {
    if let Value::Bool(b) = v {
        out.push(if *b { 1 } else { 0 });
    }
    Ok(1)
}

fn decode_bool(bytes: &[u8], _e: Endian) -> Result<(Value, usize)> {
    match bytes.first() {
        Some(0) => Ok((Value::Bool(false), 1)),
        Some(1) => Ok((Value::Bool(true), 1)),
        Some(b) => Err(TableError::Corrupt(format!("invalid bool byte {b:#x}"))),
        None => Err(truncated("Bool")),
    }
}

fn encode_u8(v: &Value, _e: Endian, out: &mut Vec<u8>) -> Result<usize> {
    if let Value::U8(b) = v {
        out.push(*b);
    }
    Ok(1)
}

fn decode_u8(bytes: &[u8], _e: Endian) -> Result<(Value, usize)> {
    bytes
        .first()
        .map(|b| (Value::U8(*b), 1))
        .ok_or_else(|| truncated("U8"))
}

macro_rules! int_codec_fns {
    ($enc:ident, $dec:ident, $variant:ident, $size:expr, $put:ident, $get:ident, $label:expr) => {
        fn $enc(v: &Value, e: Endian, out: &mut Vec<u8>) -> Result<usize> {
            if let Value::$variant(x) = v {
                let mut b = [0u8; $size];
                e.$put(&mut b, *x);
                out.extend_from_slice(&b);
            }
            Ok($size)
        }

        fn $dec(bytes: &[u8], e: Endian) -> Result<(Value, usize)> {
            if bytes.len() < $size {
                return Err(truncated($label));
            }
            Ok((Value::$variant(e.$get(&bytes[..$size])), $size))
        }
    };
}

int_codec_fns!(encode_i16, decode_i16, I16, 2, write_i16, read_i16, "I16");
int_codec_fns!(encode_u16, decode_u16, U16, 2, write_u16, read_u16, "U16");
int_codec_fns!(encode_i32, decode_i32, I32, 4, write_i32, read_i32, "I32");
int_codec_fns!(encode_u32, decode_u32, U32, 4, write_u32, read_u32, "U32");
int_codec_fns!(encode_i64, decode_i64, I64, 8, write_i64, read_i64, "I64");
int_codec_fns!(encode_f32, decode_f32, F32, 4, write_f32, read_f32, "F32");
int_codec_fns!(encode_f64, decode_f64, F64, 8, write_f64, read_f64, "F64");

fn encode_c32(v: &Value, e: Endian, out: &mut Vec<u8>) -> Result<usize> {
    if let Value::C32(c) = v {
        let mut b = [0u8; 8];
        e.write_f32(&mut b[..4], c.re);
        e.write_f32(&mut b[4..], c.im);
        out.extend_from_slice(&b);
    }
    Ok(8)
}

fn decode_c32(bytes: &[u8], e: Endian) -> Result<(Value, usize)> {
    if bytes.len() < 8 {
        return Err(truncated("Complex32"));
    }
    let re = e.read_f32(&bytes[..4]);
    let im = e.read_f32(&bytes[4..8]);
    Ok((Value::C32(Complex32::new(re, im)), 8))
}

fn encode_c64(v: &Value, e: Endian, out: &mut Vec<u8>) -> Result<usize> {
    if let Value::C64(c) = v {
        let mut b = [0u8; 16];
        e.write_f64(&mut b[..8], c.re);
        e.write_f64(&mut b[8..], c.im);
        out.extend_from_slice(&b);
    }
    Ok(16)
}

fn decode_c64(bytes: &[u8], e: Endian) -> Result<(Value, usize)> {
    if bytes.len() < 16 {
        return Err(truncated("Complex64"));
    }
    let re = e.read_f64(&bytes[..8]);
    let im = e.read_f64(&bytes[8..16]);
    Ok((Value::C64(Complex64::new(re, im)), 16))
}

// String encoding is [u32 length][bytes], no terminator.
fn encode_str(v: &Value, e: Endian, out: &mut Vec<u8>) -> Result<usize> {
    if let Value::Str(s) = v {
        e.put_u32(out, s.len() as u32);
        out.extend_from_slice(s.as_bytes());
        return Ok(4 + s.len());
    }
    Ok(0)
}

fn decode_str(bytes: &[u8], e: Endian) -> Result<(Value, usize)> {
    if bytes.len() < 4 {
        return Err(truncated("Str length"));
    }
    let len = e.read_u32(&bytes[..4]) as usize;
    if bytes.len() < 4 + len {
        return Err(truncated("Str payload"));
    }
    let s = std::str::from_utf8(&bytes[4..4 + len])
        .map_err(|_| TableError::Corrupt("string cell is not valid UTF-8".into()))?;
    Ok((Value::Str(s.to_string()), 4 + len))
}

fn encode_other(_v: &Value, _e: Endian, _out: &mut Vec<u8>) -> Result<usize> {
    Err(TableError::Unsupported("I/O on a column of type Other".into()))
}

fn decode_other(_bytes: &[u8], _e: Endian) -> Result<(Value, usize)> {
    Err(TableError::Unsupported("I/O on a column of type Other".into()))
}

const CODECS: [Codec; 13] = [
    Codec { dtype: DataType::Bool, fixed_size: Some(1), encode: encode_bool, decode: decode_bool },
    Codec { dtype: DataType::U8, fixed_size: Some(1), encode: encode_u8, decode: decode_u8 },
    Codec { dtype: DataType::I16, fixed_size: Some(2), encode: encode_i16, decode: decode_i16 },
    Codec { dtype: DataType::U16, fixed_size: Some(2), encode: encode_u16, decode: decode_u16 },
    Codec { dtype: DataType::I32, fixed_size: Some(4), encode: encode_i32, decode: decode_i32 },
    Codec { dtype: DataType::U32, fixed_size: Some(4), encode: encode_u32, decode: decode_u32 },
    Codec { dtype: DataType::I64, fixed_size: Some(8), encode: encode_i64, decode: decode_i64 },
    Codec { dtype: DataType::F32, fixed_size: Some(4), encode: encode_f32, decode: decode_f32 },
    Codec { dtype: DataType::F64, fixed_size: Some(8), encode: encode_f64, decode: decode_f64 },
    Codec { dtype: DataType::Complex32, fixed_size: Some(8), encode: encode_c32, decode: decode_c32 },
    Codec { dtype: DataType::Complex64, fixed_size: Some(16), encode: encode_c64, decode: decode_c64 },
    Codec { dtype: DataType::Str, fixed_size: None, encode: encode_str, decode: decode_str },
    Codec { dtype: DataType::Other, fixed_size: None, encode: encode_other, decode: decode_other },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value, e: Endian) {
        let codec = Codec::for_type(v.data_type());
        let mut buf = Vec::new();
        let n = codec.encode(&v, e, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        let (back, consumed) = codec.decode(&buf, e).unwrap();
        assert_eq!(back, v);
        assert_eq!(consumed, n);
    }

    #[test]
    fn test_round_trip_both_endians() {
        for e in [Endian::Big, Endian::Little] {
            round_trip(Value::Bool(true), e);
            round_trip(Value::U8(250), e);
            round_trip(Value::I16(-12345), e);
            round_trip(Value::U16(54321), e);
            round_trip(Value::I32(-7_000_000), e);
            round_trip(Value::U32(4_000_000_000), e);
            round_trip(Value::I64(-9_000_000_000_000), e);
            round_trip(Value::F32(2.5), e);
            round_trip(Value::F64(-1e300), e);
            round_trip(Value::C32(Complex32::new(1.0, -2.0)), e);
            round_trip(Value::C64(Complex64::new(3.0, 4.0)), e);
            round_trip(Value::Str("row_17".into()), e);
            round_trip(Value::Str(String::new()), e);
        }
    }

    #[test]
    fn test_endianness_differs_on_disk() {
        let codec = Codec::for_type(DataType::I32);
        let mut big = Vec::new();
        let mut little = Vec::new();
        codec.encode(&Value::I32(1), Endian::Big, &mut big).unwrap();
        codec.encode(&Value::I32(1), Endian::Little, &mut little).unwrap();
        assert_eq!(big, vec![0, 0, 0, 1]);
        assert_eq!(little, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_fails_corrupt() {
        let codec = Codec::for_type(DataType::I64);
        let err = codec.decode(&[1, 2, 3], Endian::Little).unwrap_err();
        assert!(matches!(err, crate::TableError::Corrupt(_)));
    }

    #[test]
    fn test_other_type_refuses_io() {
        let codec = Codec::for_type(DataType::Other);
        assert!(matches!(
            codec.decode(&[0u8; 8], Endian::Little),
            Err(crate::TableError::Unsupported(_))
        ));
    }

    #[test]
    fn test_string_codec_layout() {
        let codec = Codec::for_type(DataType::Str);
        let mut buf = Vec::new();
        codec
            .encode(&Value::Str("ab".into()), Endian::Big, &mut buf)
            .unwrap();
        // [u32 length][bytes], no terminator.
        assert_eq!(buf, vec![0, 0, 0, 2, b'a', b'b']);
    }
}
