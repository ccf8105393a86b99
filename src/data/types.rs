//! Scalar type universe and dynamic cell values.

use serde::{Deserialize, Serialize};

use crate::{Result, TableError};

/// Element data type of a column cell.
///
/// `Other` is a structural placeholder: any attempted I/O on it fails
/// with `Unsupported`. It backs array-of-array refusals and acts as a
/// guard value in dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Bool = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    F32 = 7,
    F64 = 8,
    Complex32 = 9,
    Complex64 = 10,
    Str = 11,
    Other = 12,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataType::Bool),
            1 => Some(DataType::U8),
            2 => Some(DataType::I16),
            3 => Some(DataType::U16),
            4 => Some(DataType::I32),
            5 => Some(DataType::U32),
            6 => Some(DataType::I64),
            7 => Some(DataType::F32),
            8 => Some(DataType::F64),
            9 => Some(DataType::Complex32),
            10 => Some(DataType::Complex64),
            11 => Some(DataType::Str),
            12 => Some(DataType::Other),
            _ => None,
        }
    }

    /// Encoded size in bytes, or `None` for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::U8 => Some(1),
            DataType::I16 | DataType::U16 => Some(2),
            DataType::I32 | DataType::U32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::F64 | DataType::Complex32 => Some(8),
            DataType::Complex64 => Some(16),
            DataType::Str => None,
            DataType::Other => None,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        matches!(self, DataType::Str)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::U8 | DataType::I16 | DataType::U16 | DataType::I32 | DataType::U32 | DataType::I64
        )
    }

    pub fn is_real(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, DataType::Complex32 | DataType::Complex64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_real() || self.is_complex()
    }

    /// Whether a stored value of `self` may be read as `target` under the
    /// widening-promotion rules. Identity is always allowed; an integer
    /// reads as a wider integer of its signedness family and as any
    /// floating or complex type; a real reads as a wider real and as any
    /// complex type (zero imaginary part); complex only widens.
    /// Fractional precision loss (an `I64` read as `F32`) is accepted.
    /// Integer narrowing, real narrowing, complex to real, and
    /// non-numeric promotions are rejected.
    pub fn promotes_to(&self, target: DataType) -> bool {
        use DataType::*;
        if *self == target {
            return true;
        }
        match *self {
            U8 => matches!(target, I16 | U16 | I32 | U32 | I64 | F32 | F64 | Complex32 | Complex64),
            I16 => matches!(target, I32 | I64 | F32 | F64 | Complex32 | Complex64),
            U16 => matches!(target, I32 | U32 | I64 | F32 | F64 | Complex32 | Complex64),
            I32 => matches!(target, I64 | F32 | F64 | Complex32 | Complex64),
            U32 => matches!(target, I64 | F32 | F64 | Complex32 | Complex64),
            I64 => matches!(target, F32 | F64 | Complex32 | Complex64),
            F32 => matches!(target, F64 | Complex32 | Complex64),
            F64 => matches!(target, Complex32 | Complex64),
            Complex32 => matches!(target, Complex64),
            _ => false,
        }
    }
}

/// Single-precision complex value, stored as `(re, im)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

impl Complex32 {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }
}

/// Double-precision complex value, stored as `(re, im)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex64 {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

/// Dynamic scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    C32(Complex32),
    C64(Complex64),
    Str(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::U8(_) => DataType::U8,
            Value::I16(_) => DataType::I16,
            Value::U16(_) => DataType::U16,
            Value::I32(_) => DataType::I32,
            Value::U32(_) => DataType::U32,
            Value::I64(_) => DataType::I64,
            Value::F32(_) => DataType::F32,
            Value::F64(_) => DataType::F64,
            Value::C32(_) => DataType::Complex32,
            Value::C64(_) => DataType::Complex64,
            Value::Str(_) => DataType::Str,
        }
    }

    /// The zero/empty value used to initialize fresh rows.
    pub fn default_for(dtype: DataType) -> Result<Value> {
        Ok(match dtype {
            DataType::Bool => Value::Bool(false),
            DataType::U8 => Value::U8(0),
            DataType::I16 => Value::I16(0),
            DataType::U16 => Value::U16(0),
            DataType::I32 => Value::I32(0),
            DataType::U32 => Value::U32(0),
            DataType::I64 => Value::I64(0),
            DataType::F32 => Value::F32(0.0),
            DataType::F64 => Value::F64(0.0),
            DataType::Complex32 => Value::C32(Complex32::default()),
            DataType::Complex64 => Value::C64(Complex64::default()),
            DataType::Str => Value::Str(String::new()),
            DataType::Other => {
                return Err(TableError::Unsupported(
                    "cannot construct a value of type Other".into(),
                ))
            }
        })
    }

    /// Convert to `target` under the widening-promotion rules.
    ///
    /// The conversion is the mathematical promotion of the stored value;
    /// a real promoted to complex gets a zero imaginary part.
    pub fn promote_to(&self, target: DataType) -> Result<Value> {
        let src = self.data_type();
        if src == target {
            return Ok(self.clone());
        }
        if !src.promotes_to(target) {
            return Err(TableError::TypeMismatch(format!(
                "cannot read {src:?} value as {target:?}"
            )));
        }
        // Promotion goes through i64 for integers and f64 for reals;
        // both are wide enough for every sanctioned source type.
        let v = match (self, target) {
            (_, DataType::I16) => Value::I16(self.to_i64()? as i16),
            (_, DataType::U16) => Value::U16(self.to_i64()? as u16),
            (_, DataType::I32) => Value::I32(self.to_i64()? as i32),
            (_, DataType::U32) => Value::U32(self.to_i64()? as u32),
            (_, DataType::I64) => Value::I64(self.to_i64()?),
            (_, DataType::F32) => Value::F32(self.to_f64()? as f32),
            (_, DataType::F64) => Value::F64(self.to_f64()?),
            (Value::C32(c), DataType::Complex64) => {
                Value::C64(Complex64::new(c.re as f64, c.im as f64))
            }
            (_, DataType::Complex32) => Value::C32(Complex32::new(self.to_f64()? as f32, 0.0)),
            (_, DataType::Complex64) => Value::C64(Complex64::new(self.to_f64()?, 0.0)),
            _ => {
                return Err(TableError::TypeMismatch(format!(
                    "cannot read {src:?} value as {target:?}"
                )))
            }
        };
        Ok(v)
    }

    fn to_i64(&self) -> Result<i64> {
        Ok(match self {
            Value::U8(v) => *v as i64,
            Value::I16(v) => *v as i64,
            Value::U16(v) => *v as i64,
            Value::I32(v) => *v as i64,
            Value::U32(v) => *v as i64,
            Value::I64(v) => *v,
            _ => {
                return Err(TableError::TypeMismatch(format!(
                    "{:?} is not an integer value",
                    self.data_type()
                )))
            }
        })
    }

    fn to_f64(&self) -> Result<f64> {
        Ok(match self {
            Value::F32(v) => *v as f64,
            Value::F64(v) => *v,
            _ => self.to_i64()? as f64,
        })
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(TableError::TypeMismatch(format!(
                "{:?} is not a string value",
                self.data_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(DataType::Bool.fixed_size(), Some(1));
        assert_eq!(DataType::I32.fixed_size(), Some(4));
        assert_eq!(DataType::Complex64.fixed_size(), Some(16));
        assert_eq!(DataType::Str.fixed_size(), None);
    }

    #[test]
    fn test_promotion_table() {
        assert!(DataType::U8.promotes_to(DataType::I64));
        assert!(DataType::I32.promotes_to(DataType::F64));
        assert!(DataType::F32.promotes_to(DataType::Complex32));
        assert!(DataType::I64.promotes_to(DataType::F64));
        // Integers read as floats and complexes of any width.
        assert!(DataType::I32.promotes_to(DataType::F32));
        assert!(DataType::I64.promotes_to(DataType::F32));
        assert!(DataType::I64.promotes_to(DataType::Complex32));
        // A real reads as any complex type.
        assert!(DataType::F64.promotes_to(DataType::Complex32));
        // Narrowing and non-numeric are rejected.
        assert!(!DataType::I64.promotes_to(DataType::I32));
        assert!(!DataType::F64.promotes_to(DataType::F32));
        assert!(!DataType::Complex64.promotes_to(DataType::F64));
        assert!(!DataType::Str.promotes_to(DataType::I32));
        assert!(!DataType::Bool.promotes_to(DataType::U8));
    }

    #[test]
    fn test_value_promotion() {
        let v = Value::I16(-7).promote_to(DataType::F64).unwrap();
        assert_eq!(v, Value::F64(-7.0));

        let v = Value::F32(1.5).promote_to(DataType::Complex64).unwrap();
        assert_eq!(v, Value::C64(Complex64::new(1.5, 0.0)));

        let v = Value::I64(5_000_000).promote_to(DataType::F32).unwrap();
        assert_eq!(v, Value::F32(5_000_000.0));

        let v = Value::F64(-2.25).promote_to(DataType::Complex32).unwrap();
        assert_eq!(v, Value::C32(Complex32::new(-2.25, 0.0)));

        assert!(Value::Str("x".into()).promote_to(DataType::I32).is_err());
    }

    #[test]
    fn test_round_trip_u8() {
        assert_eq!(DataType::from_u8(DataType::Complex32 as u8), Some(DataType::Complex32));
        assert_eq!(DataType::from_u8(200), None);
    }
}
