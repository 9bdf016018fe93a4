//! Typed storage for the items a format program converts.
//!
//! Each [`Slot`] borrows one caller-owned value or array. A single value is
//! treated as an array of length one, so the interpreter only ever deals
//! with element indices:
//!
//! ```
//! use cardfmt::slots::Slot;
//!
//! let mut width = 0_i16;
//! let mut gains = [0.0_f32; 4];
//! let mut name = String::new();
//! let slots = [Slot::from(&mut width), Slot::from(&mut gains[..]), Slot::from(&mut name)];
//! assert_eq!(slots.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![1, 4, 1]);
//! ```
use crate::codec::{Num, NumKind, NumSpec};
use crate::marker::Diag;

/// One item of a conversion list.
#[derive(Debug)]
pub enum Slot<'a> {
    I8(&'a mut [i8]),
    I16(&'a mut [i16]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
    U8(&'a mut [u8]),
    U16(&'a mut [u16]),
    U32(&'a mut [u32]),
    U64(&'a mut [u64]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    Text(&'a mut [String]),
}

macro_rules! slot_from {
    ($t:ty, $variant:ident) => {
        impl<'a> From<&'a mut $t> for Slot<'a> {
            fn from(value: &'a mut $t) -> Self {
                Slot::$variant(std::slice::from_mut(value))
            }
        }

        impl<'a> From<&'a mut [$t]> for Slot<'a> {
            fn from(value: &'a mut [$t]) -> Self {
                Slot::$variant(value)
            }
        }

        impl<'a, const N: usize> From<&'a mut [$t; N]> for Slot<'a> {
            fn from(value: &'a mut [$t; N]) -> Self {
                Slot::$variant(&mut value[..])
            }
        }
    };
}

slot_from!(i8, I8);
slot_from!(i16, I16);
slot_from!(i32, I32);
slot_from!(i64, I64);
slot_from!(u8, U8);
slot_from!(u16, U16);
slot_from!(u32, U32);
slot_from!(u64, U64);
slot_from!(f32, F32);
slot_from!(f64, F64);
slot_from!(String, Text);

impl<'a> Slot<'a> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Slot::I8(v) => v.len(),
            Slot::I16(v) => v.len(),
            Slot::I32(v) => v.len(),
            Slot::I64(v) => v.len(),
            Slot::U8(v) => v.len(),
            Slot::U16(v) => v.len(),
            Slot::U32(v) => v.len(),
            Slot::U64(v) => v.len(),
            Slot::F32(v) => v.len(),
            Slot::F64(v) => v.len(),
            Slot::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the element type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Slot::I8(_) => "i8",
            Slot::I16(_) => "i16",
            Slot::I32(_) => "i32",
            Slot::I64(_) => "i64",
            Slot::U8(_) => "u8",
            Slot::U16(_) => "u16",
            Slot::U32(_) => "u32",
            Slot::U64(_) => "u64",
            Slot::F32(_) => "f32",
            Slot::F64(_) => "f64",
            Slot::Text(_) => "text",
        }
    }

    /// Element width in bits, `None` for text.
    pub fn elem_bits(&self) -> Option<u32> {
        match self {
            Slot::I8(_) | Slot::U8(_) => Some(8),
            Slot::I16(_) | Slot::U16(_) => Some(16),
            Slot::I32(_) | Slot::U32(_) | Slot::F32(_) => Some(32),
            Slot::I64(_) | Slot::U64(_) | Slot::F64(_) => Some(64),
            Slot::Text(_) => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Slot::F32(_) | Slot::F64(_))
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float() && !self.is_text()
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Slot::Text(_))
    }

    /// The codec description of this slot's elements, `None` for text.
    pub fn num_spec(&self) -> Option<NumSpec> {
        let bits = self.elem_bits()?;
        Some(match self {
            Slot::I8(_) | Slot::I16(_) | Slot::I32(_) | Slot::I64(_) => NumSpec::signed(bits),
            Slot::F32(_) | Slot::F64(_) => NumSpec::float(bits),
            _ => NumSpec::unsigned(bits),
        })
    }

    /// Read element `i` as a number, `None` for text or an index out of range.
    pub fn get_num(&self, i: usize) -> Option<Num> {
        Some(match self {
            Slot::I8(v) => Num::Int(*v.get(i)? as i128),
            Slot::I16(v) => Num::Int(*v.get(i)? as i128),
            Slot::I32(v) => Num::Int(*v.get(i)? as i128),
            Slot::I64(v) => Num::Int(*v.get(i)? as i128),
            Slot::U8(v) => Num::Int(*v.get(i)? as i128),
            Slot::U16(v) => Num::Int(*v.get(i)? as i128),
            Slot::U32(v) => Num::Int(*v.get(i)? as i128),
            Slot::U64(v) => Num::Int(*v.get(i)? as i128),
            Slot::F32(v) => Num::Float(*v.get(i)? as f64),
            Slot::F64(v) => Num::Float(*v.get(i)?),
            Slot::Text(_) => return None,
        })
    }

    /// Read element `i` as a number described by `spec`, which may be
    /// narrower than the slot or of the other signedness. The element is
    /// reinterpreted through its low `spec.bits` bits: a value read with a
    /// narrower `^n` size is stored sign-extended to the full element, so it
    /// comes back unchanged, while a wider value is truncated to those bits.
    pub(crate) fn get_as(&self, i: usize, spec: &NumSpec) -> Option<Num> {
        match self.get_num(i)? {
            Num::Int(raw) if spec.kind != NumKind::Float => {
                let mask = (1u128 << spec.bits) - 1;
                let bits = (raw as u128) & mask;
                let value = if spec.kind == NumKind::Signed && (bits >> (spec.bits - 1)) & 1 == 1 {
                    (bits | !mask) as i128
                } else {
                    bits as i128
                };
                Some(Num::Int(value))
            },
            n => Some(n),
        }
    }

    /// Clamp an integer to the range of this slot's element type. The second
    /// value names the problem when clamping was needed: `NegativeNotAllowed`
    /// for a negative value in an unsigned slot, `Overflow` otherwise.
    /// Floats and text pass through.
    pub fn fit_num(&self, value: Num) -> (Num, Option<Diag>) {
        let (min, max) = match self {
            Slot::I8(_) => (i8::MIN as i128, i8::MAX as i128),
            Slot::I16(_) => (i16::MIN as i128, i16::MAX as i128),
            Slot::I32(_) => (i32::MIN as i128, i32::MAX as i128),
            Slot::I64(_) => (i64::MIN as i128, i64::MAX as i128),
            Slot::U8(_) => (0, u8::MAX as i128),
            Slot::U16(_) => (0, u16::MAX as i128),
            Slot::U32(_) => (0, u32::MAX as i128),
            Slot::U64(_) => (0, u64::MAX as i128),
            Slot::F32(_) | Slot::F64(_) | Slot::Text(_) => return (value, None),
        };
        match value {
            Num::Int(v) if v < min && min == 0 => (Num::Int(0), Some(Diag::NegativeNotAllowed)),
            Num::Int(v) if v < min => (Num::Int(min), Some(Diag::Overflow)),
            Num::Int(v) if v > max => (Num::Int(max), Some(Diag::Overflow)),
            n => (n, None),
        }
    }

    /// Store a number into element `i`. Integer values are stored by their
    /// low bits, so callers pass values already brought into range with
    /// [`Slot::fit_num`]. Returns `false` if `i` is out of range or the slot
    /// holds text.
    pub fn set_num(&mut self, i: usize, value: Num) -> bool {
        let int = || match value {
            Num::Int(v) => v,
            Num::Float(f) => f.round() as i128,
        };
        let float = || match value {
            Num::Int(v) => v as f64,
            Num::Float(f) => f,
        };
        match self {
            Slot::I8(v) => v.get_mut(i).map(|e| *e = int() as i8).is_some(),
            Slot::I16(v) => v.get_mut(i).map(|e| *e = int() as i16).is_some(),
            Slot::I32(v) => v.get_mut(i).map(|e| *e = int() as i32).is_some(),
            Slot::I64(v) => v.get_mut(i).map(|e| *e = int() as i64).is_some(),
            Slot::U8(v) => v.get_mut(i).map(|e| *e = int() as u8).is_some(),
            Slot::U16(v) => v.get_mut(i).map(|e| *e = int() as u16).is_some(),
            Slot::U32(v) => v.get_mut(i).map(|e| *e = int() as u32).is_some(),
            Slot::U64(v) => v.get_mut(i).map(|e| *e = int() as u64).is_some(),
            Slot::F32(v) => v.get_mut(i).map(|e| *e = float() as f32).is_some(),
            Slot::F64(v) => v.get_mut(i).map(|e| *e = float()).is_some(),
            Slot::Text(_) => false,
        }
    }

    pub fn get_text(&self, i: usize) -> Option<&str> {
        match self {
            Slot::Text(v) => v.get(i).map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn set_text(&mut self, i: usize, text: String) -> bool {
        match self {
            Slot::Text(v) => v.get_mut(i).map(|e| *e = text).is_some(),
            _ => false,
        }
    }
}
