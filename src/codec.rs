//! Convert bounded-width text fields to and from binary numbers.
//!
//! A [`NumSpec`] describes the binary side: storage width (8 to 64 bits),
//! whether it is a signed or unsigned fixed-point integer or a float, the
//! number base of the text, the binary scale (implicit fractional bits) and
//! the decimal scaling. [`decode`] turns text into a [`Num`] plus any
//! [`Diagnostic`]s; [`encode`] goes the other way under an [`OutSpec`].
//!
//! ```
//! use cardfmt::codec::{decode, encode, Num, NumSpec, OutSpec, Decimals};
//!
//! // 16-bit signed with 8 fractional bits
//! let spec = NumSpec::signed(16).bscale(8);
//! let d = decode("1.5", &spec, None);
//! assert_eq!(d.value, Some(Num::Int(384)));
//!
//! let out = OutSpec::for_num(&spec).width(6).decimals(Decimals::Fixed(2));
//! assert_eq!(encode(Num::Int(384), &out), "  1.50");
//! ```
//!
//! Decimal input is converted exactly: the digits are accumulated into an
//! integer of whatever width they need and the only rounding is the final
//! division by the power of ten and power of two implied by the scales.
//! Values that do not fit are clamped to the nearest representable value and
//! reported; nothing ever wraps.
use std::cmp::Ordering;
use std::fmt::Display;

use ryu_floating_decimal::d2d;

use crate::marker::{Diag, Diagnostic};
use crate::range::Adjustments;

/// Which base (10, 8, or 16) a numeric field is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntBase {
    Decimal,
    Octal,
    Hexadecimal
}

impl Display for IntBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntBase::Decimal => "decimal",
            IntBase::Octal => "octal",
            IntBase::Hexadecimal => "hexadecimal",
        };

        write!(f, "{s}")
    }
}

impl IntBase {
    pub fn radix(&self) -> u32 {
        match self {
            IntBase::Decimal => 10,
            IntBase::Octal => 8,
            IntBase::Hexadecimal => 16,
        }
    }
}

/// Largest decimal scale, in either direction, a format may ask for with
/// `kP` or `.d`.
pub const MAX_DECIMAL_SCALE: u32 = 64;

/// The kind of binary value being converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    Signed,
    Unsigned,
    Float,
}

/// Description of the binary side of a numeric conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumSpec {
    /// Storage width in bits: 8, 16, 32 or 64 (32 or 64 for floats).
    pub bits: u32,
    pub kind: NumKind,
    pub base: IntBase,
    /// Implicit fractional bits of a fixed-point value, 0 to 63.
    pub bscale: u32,
    /// Decimal digits assumed to follow the decimal point when the text has none.
    pub implied: u32,
    /// Apply `implied` even when the text has a decimal point.
    pub force_implied: bool,
    /// Power of ten the text value is multiplied by before storing.
    pub exp10: i32,
    /// Power of two the text value is multiplied by before storing (unit prefixes such as `Ki`).
    pub pow2: i32,
    /// Zero is not a legal result.
    pub nonzero: bool,
    /// Negative values are not legal results.
    pub nonneg: bool,
}

impl NumSpec {
    fn new(bits: u32, kind: NumKind) -> Self {
        Self {
            bits, kind, base: IntBase::Decimal, bscale: 0, implied: 0, force_implied: false,
            exp10: 0, pow2: 0, nonzero: false, nonneg: false
        }
    }

    pub fn signed(bits: u32) -> Self {
        Self::new(bits, NumKind::Signed)
    }

    pub fn unsigned(bits: u32) -> Self {
        Self::new(bits, NumKind::Unsigned)
    }

    pub fn float(bits: u32) -> Self {
        Self::new(bits, NumKind::Float)
    }

    pub fn base(mut self, base: IntBase) -> Self {
        self.base = base;
        self
    }

    pub fn bscale(mut self, bscale: u32) -> Self {
        self.bscale = bscale;
        self
    }

    pub fn implied(mut self, digits: u32, force: bool) -> Self {
        self.implied = digits;
        self.force_implied = force;
        self
    }

    pub fn exp10(mut self, exp10: i32) -> Self {
        self.exp10 = exp10;
        self
    }

    pub fn pow2(mut self, pow2: i32) -> Self {
        self.pow2 = pow2;
        self
    }

    pub fn nonzero(mut self, nonzero: bool) -> Self {
        self.nonzero = nonzero;
        self
    }

    pub fn nonneg(mut self, nonneg: bool) -> Self {
        self.nonneg = nonneg;
        self
    }

    /// Largest magnitudes for positive and negative raw values.
    fn limits(&self) -> (u128, u128) {
        match self.kind {
            NumKind::Signed => ((1u128 << (self.bits - 1)) - 1, 1u128 << (self.bits - 1)),
            _ => ((1u128 << self.bits) - 1, 0),
        }
    }

    /// Largest representable raw value.
    pub fn max_raw(&self) -> i128 {
        self.limits().0 as i128
    }

    /// Smallest representable raw value.
    pub fn min_raw(&self) -> i128 {
        -(self.limits().1 as i128)
    }

    /// Bits left for the integer part once the sign and binary scale are taken out.
    pub fn integer_bits(&self) -> i64 {
        let sign = if self.kind == NumKind::Signed { 1 } else { 0 };
        self.bits as i64 - sign - self.bscale as i64 - self.pow2 as i64
    }
}

/// A converted value: a raw fixed-point integer or a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    pub fn is_zero(&self) -> bool {
        match self {
            Num::Int(i) => *i == 0,
            Num::Float(f) => *f == 0.0,
        }
    }

    pub fn is_negative(&self) -> bool {
        match self {
            Num::Int(i) => *i < 0,
            Num::Float(f) => *f < 0.0,
        }
    }

    /// The raw integer, truncating a float.
    pub fn as_int(&self) -> i128 {
        match self {
            Num::Int(i) => *i,
            Num::Float(f) => *f as i128,
        }
    }
}

/// The result of [`decode`]. `value` is `None` when the text was not a number
/// at all, in which case the caller keeps whatever value it had.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Option<Num>,
    pub diags: Vec<Diagnostic>,
}

/// Convert `text` according to `spec`.
///
/// Blank text is zero. A decimal field may end in `+NAME` or `-NAME`, which
/// adds or subtracts a value registered in `adjustments` before the range of
/// the result is checked.
pub fn decode(text: &str, spec: &NumSpec, adjustments: Option<&Adjustments>) -> Decoded {
    let mut diags = vec![];
    let trimmed = text.trim();
    let value = if trimmed.is_empty() {
        let zero = if spec.kind == NumKind::Float { Num::Float(0.0) } else { Num::Int(0) };
        Some(apply_zero_rule(zero, false, spec, &mut diags))
    } else if spec.base == IntBase::Decimal {
        decode_decimal(trimmed, spec, adjustments, &mut diags)
    } else {
        decode_radix(trimmed, spec, &mut diags)
    };
    Decoded { value, diags }
}

fn decode_decimal(text: &str, spec: &NumSpec, adjustments: Option<&Adjustments>, diags: &mut Vec<Diagnostic>) -> Option<Num> {
    let parsed = match NumText::lex(text) {
        Ok(p) => p,
        Err(code) => {
            diags.push(Diagnostic::error(code).with_detail(text));
            return None;
        }
    };

    let mut dec = parsed.dec;
    if !parsed.had_point || spec.force_implied {
        dec.exp = dec.exp.saturating_sub(spec.implied as i32);
    }

    if let Some((negate, name)) = parsed.adjust {
        match adjustments.and_then(|a| a.get(&name)) {
            Some(adj) => {
                let mut adj = adj.clone();
                if negate {
                    adj.neg = !adj.neg;
                }
                dec = dec.add(adj);
            },
            None => diags.push(Diagnostic::error(Diag::UndefinedAdjustment).with_detail(name)),
        }
    }

    Some(scale_dec(dec, spec, diags))
}

/// Apply the decimal scale of `spec` to an exact decimal and convert it.
pub(crate) fn scale_dec(mut dec: Dec, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Num {
    dec.exp = dec.exp.saturating_add(spec.exp10);
    match spec.kind {
        NumKind::Float => dec_to_float(&dec, spec, diags),
        NumKind::Signed | NumKind::Unsigned => dec_to_int(&dec, spec, diags),
    }
}

fn overflow_diag(spec: &NumSpec) -> Diagnostic {
    let detail = if spec.bscale == 0 && spec.pow2 == 0 {
        format!("{} integer bits", spec.integer_bits())
    } else {
        format!("{} integer bits with binary scale {}", spec.integer_bits(), spec.bscale as i32 + spec.pow2)
    };
    Diagnostic::error(Diag::Overflow).with_detail(detail)
}

fn dec_to_int(dec: &Dec, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Num {
    let e2 = spec.bscale as i32 + spec.pow2;
    let (max_pos, max_neg) = spec.limits();
    let mag = scaled_magnitude(dec, e2);
    let neg = dec.neg && mag != Some(0);

    if neg && (spec.kind == NumKind::Unsigned || spec.nonneg) {
        diags.push(Diagnostic::error(Diag::NegativeNotAllowed));
        return apply_zero_rule(Num::Int(0), false, spec, diags);
    }

    let limit = if neg { max_neg } else { max_pos };
    let mag = match mag {
        Some(m) if m <= limit => m,
        _ => {
            diags.push(overflow_diag(spec));
            limit
        }
    };
    let raw = if neg { -(mag as i128) } else { mag as i128 };
    apply_zero_rule(Num::Int(raw), dec.neg, spec, diags)
}

/// `round(|dec| * 2^e2)`, or `None` if it certainly does not fit in 64 bits.
fn scaled_magnitude(dec: &Dec, e2: i32) -> Option<u128> {
    if dec.mant.is_zero() {
        return Some(0);
    }
    let mag10 = dec.mant.decimal_len() as i64 + dec.exp as i64;
    let shift10 = e2 as f64 * std::f64::consts::LOG10_2;
    if (mag10 - 1) as f64 + shift10.floor() >= 20.0 {
        return None;
    }
    if mag10 as f64 + shift10.ceil() <= -1.0 {
        return Some(0);
    }

    let mut n = dec.mant.clone();
    let mut div10 = 0;
    let mut div2 = 0;
    if dec.exp >= 0 {
        n.mul_pow10(dec.exp as u32);
    } else {
        div10 = dec.exp.unsigned_abs();
    }
    if e2 >= 0 {
        n.shl(e2 as u32);
    } else {
        div2 = e2.unsigned_abs();
    }
    round_div(&n, div10, div2).to_u128()
}

fn dec_to_float(dec: &Dec, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Num {
    let sign = if dec.neg { "-" } else { "" };
    let text = format!("{sign}{}e{}", dec.mant.to_decimal_string(), dec.exp);
    // Always a valid float literal: digits with an integer exponent.
    let mut v = if spec.bits == 32 {
        text.parse::<f32>().map(|v| v as f64).unwrap_or(f64::NAN)
    } else {
        text.parse::<f64>().unwrap_or(f64::NAN)
    };
    if spec.pow2 != 0 {
        v *= 2f64.powi(spec.pow2);
    }

    let limit = if spec.bits == 32 { f32::MAX as f64 } else { f64::MAX };
    if v.is_infinite() || v.abs() > limit {
        diags.push(overflow_diag(spec));
        v = if v < 0.0 { -limit } else { limit };
    } else if v == 0.0 && !dec.mant.is_zero() {
        diags.push(Diagnostic::warning(Diag::Underflow).with_detail(text));
    }

    if v < 0.0 && spec.nonneg {
        diags.push(Diagnostic::error(Diag::NegativeNotAllowed));
        return apply_zero_rule(Num::Float(0.0), false, spec, diags);
    }
    apply_zero_rule(Num::Float(v), dec.neg, spec, diags)
}

fn decode_radix(text: &str, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Option<Num> {
    let radix = spec.base.radix();
    let mask = (1u128 << spec.bits) - 1;
    let mut value: u128 = 0;
    let mut overflow = false;
    for c in text.chars() {
        let Some(d) = c.to_digit(radix) else {
            diags.push(Diagnostic::error(Diag::BadDigit).with_detail(format!("{text} is not {}", spec.base)));
            return None;
        };
        if !overflow {
            value = value * radix as u128 + d as u128;
            overflow = value > mask;
        }
    }
    if overflow {
        diags.push(Diagnostic::error(Diag::Overflow).with_detail(format!("more than {} bits of {} digits", spec.bits, spec.base)));
        value = mask;
    }

    let num = match spec.kind {
        NumKind::Float if spec.bits == 32 => Num::Float(f32::from_bits(value as u32) as f64),
        NumKind::Float => Num::Float(f64::from_bits(value as u64)),
        NumKind::Signed if (value >> (spec.bits - 1)) & 1 == 1 => Num::Int(value as i128 - (1i128 << spec.bits)),
        NumKind::Signed | NumKind::Unsigned => Num::Int(value as i128),
    };
    Some(apply_zero_rule(num, false, spec, diags))
}

/// Replace an exact zero with the smallest nonzero value of the right sign
/// when the field forbids zero.
fn apply_zero_rule(value: Num, neg: bool, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Num {
    if !spec.nonzero || !value.is_zero() {
        return value;
    }
    diags.push(Diagnostic::error(Diag::ZeroNotAllowed));
    match value {
        Num::Int(_) => Num::Int(if neg && spec.kind == NumKind::Signed { -1 } else { 1 }),
        Num::Float(_) => {
            let tiny = if spec.bits == 32 { f32::MIN_POSITIVE as f64 } else { f64::MIN_POSITIVE };
            Num::Float(if neg { -tiny } else { tiny })
        }
    }
}


// ------------- //
//   ENCODING    //
// ------------- //

/// How many digits to print after the decimal point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decimals {
    /// Integers print as integers, other values as [`Decimals::Auto`].
    None,
    Fixed(u32),
    /// As many as fit the width, or as many as needed to be exact.
    Auto,
}

/// Placement of the text within the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Justify {
    Right,
    /// Left-justified, followed by `gap` blanks.
    Left { gap: u32 },
}

/// Description of the text side of an encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSpec {
    /// Field width; `None` means as long as the value needs.
    pub width: Option<u32>,
    pub bits: u32,
    pub kind: NumKind,
    pub base: IntBase,
    pub bscale: u32,
    pub exp10: i32,
    pub pow2: i32,
    pub decimals: Decimals,
    pub justify: Justify,
    pub zero_pad: bool,
    /// Always use exponential form.
    pub exp_form: bool,
}

impl OutSpec {
    /// An output spec that inverts `spec`, with minimal width.
    pub fn for_num(spec: &NumSpec) -> Self {
        Self {
            width: None, bits: spec.bits, kind: spec.kind, base: spec.base, bscale: spec.bscale,
            exp10: spec.exp10, pow2: spec.pow2, decimals: Decimals::None, justify: Justify::Right,
            zero_pad: false, exp_form: false
        }
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn decimals(mut self, decimals: Decimals) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn justify(mut self, justify: Justify) -> Self {
        self.justify = justify;
        self
    }

    pub fn zero_pad(mut self, zero_pad: bool) -> Self {
        self.zero_pad = zero_pad;
        self
    }

    pub fn exp_form(mut self, exp_form: bool) -> Self {
        self.exp_form = exp_form;
        self
    }

    fn fits(&self, s: &str) -> bool {
        self.width.map(|w| s.len() <= w as usize).unwrap_or(true)
    }
}

/// Format `value` as text according to `spec`.
///
/// A value that cannot be shown in the field width is written as `*`s.
pub fn encode(value: Num, spec: &OutSpec) -> String {
    let body = match (spec.base, value) {
        (IntBase::Decimal, Num::Int(raw)) => encode_fixed_point(raw, spec),
        (IntBase::Decimal, Num::Float(v)) => encode_float(v, spec),
        (_, v) => encode_radix(v, spec),
    };
    justify(body, spec)
}

fn justify(body: Option<String>, spec: &OutSpec) -> String {
    let Some(s) = body else {
        let stars = "*".repeat(spec.width.unwrap_or(1) as usize);
        return match spec.justify {
            Justify::Right => stars,
            Justify::Left { gap } => stars + &" ".repeat(gap as usize),
        };
    };

    let width = spec.width.unwrap_or(0) as usize;
    let npad = width.saturating_sub(s.len());
    match spec.justify {
        Justify::Right if spec.zero_pad => {
            let (sign, digits) = if let Some(rest) = s.strip_prefix('-') { ("-", rest) } else { ("", s.as_str()) };
            format!("{sign}{}{digits}", "0".repeat(npad))
        },
        Justify::Right => format!("{}{s}", " ".repeat(npad)),
        Justify::Left { gap } => format!("{s}{}", " ".repeat(npad + gap as usize)),
    }
}

fn has_nonzero_digit(s: &str) -> bool {
    s.bytes().take_while(|b| *b != b'E').any(|b| (b'1'..=b'9').contains(&b))
}

fn encode_fixed_point(raw: i128, spec: &OutSpec) -> Option<String> {
    let neg = raw < 0;
    let mag = Big::from_u128(raw.unsigned_abs());
    let e2 = spec.bscale as i32 + spec.pow2;
    let exact_int = e2 <= 0 && spec.exp10 <= 0;

    match spec.decimals {
        Decimals::None if exact_int => {
            let s = if e2 == 0 && spec.exp10 == 0 {
                let mut b = itoa::Buffer::new();
                let digits = b.format(raw.unsigned_abs());
                if neg { format!("-{digits}") } else { digits.to_string() }
            } else {
                let mut n = mag;
                n.shl(e2.unsigned_abs());
                n.mul_pow10(spec.exp10.unsigned_abs());
                let sign = if neg { "-" } else { "" };
                format!("{sign}{}", n.to_decimal_string())
            };
            if spec.fits(&s) { Some(s) } else { None }
        },
        Decimals::Fixed(d) => {
            let s = fixed_text(&mag, neg, e2, spec.exp10, d);
            if spec.fits(&s) && (mag.is_zero() || has_nonzero_digit(&s)) {
                Some(s)
            } else {
                let v = fixed_to_f64(&mag, neg, e2, spec.exp10);
                exp_text(v, false, None, spec.width)
            }
        },
        Decimals::None | Decimals::Auto => {
            let exact_digits = (e2.max(0) + spec.exp10.max(0)).min(60) as u32;
            if let Some(w) = spec.width {
                for d in (0..=exact_digits.min(w)).rev() {
                    let s = trim_fraction(fixed_text(&mag, neg, e2, spec.exp10, d));
                    if s.len() <= w as usize && (mag.is_zero() || has_nonzero_digit(&s)) {
                        return Some(s);
                    }
                }
                let v = fixed_to_f64(&mag, neg, e2, spec.exp10);
                exp_text(v, false, None, spec.width)
            } else {
                Some(trim_fraction(fixed_text(&mag, neg, e2, spec.exp10, exact_digits)))
            }
        }
    }
}

/// `mag * 2^-e2 * 10^-exp10` rounded to `d` decimals, as text.
fn fixed_text(mag: &Big, neg: bool, e2: i32, exp10: i32, d: u32) -> String {
    let mut n = mag.clone();
    let p10 = d as i64 - exp10 as i64;
    let mut div10 = 0;
    let mut div2 = 0;
    if p10 >= 0 {
        n.mul_pow10(p10 as u32);
    } else {
        div10 = p10.unsigned_abs() as u32;
    }
    if e2 >= 0 {
        div2 = e2 as u32;
    } else {
        n.shl(e2.unsigned_abs());
    }
    let q = round_div(&n, div10, div2);
    let mut digits = q.to_decimal_string();
    let d = d as usize;
    if digits.len() <= d {
        digits = format!("{}{digits}", "0".repeat(d + 1 - digits.len()));
    }
    let sign = if neg && !q.is_zero() { "-" } else { "" };
    if d == 0 {
        format!("{sign}{digits}")
    } else {
        let (int_part, frac) = digits.split_at(digits.len() - d);
        format!("{sign}{int_part}.{frac}")
    }
}

/// Drop trailing zeros after a decimal point, and the point itself if nothing remains.
fn trim_fraction(s: String) -> String {
    if !s.contains('.') {
        return s;
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn fixed_to_f64(mag: &Big, neg: bool, e2: i32, exp10: i32) -> f64 {
    let m = mag.to_u128().map(|m| m as f64).unwrap_or(f64::MAX);
    let v = m * 2f64.powi(-e2) * 10f64.powi(-exp10);
    if neg { -v } else { v }
}

fn encode_float(v: f64, spec: &OutSpec) -> Option<String> {
    let v = v / 10f64.powi(spec.exp10) / 2f64.powi(spec.pow2);
    let single = spec.bits == 32;
    if !v.is_finite() {
        let s = if v.is_nan() { "NaN" } else if v > 0.0 { "Inf" } else { "-Inf" };
        return if spec.fits(s) { Some(s.to_string()) } else { None };
    }

    let precision = match spec.decimals {
        Decimals::Fixed(d) => Some(d),
        _ => None,
    };
    if spec.exp_form {
        return exp_text(v, single, precision, spec.width);
    }

    match spec.decimals {
        Decimals::Fixed(d) => {
            let s = format!("{:.*}", d as usize, v);
            if spec.fits(&s) && (v == 0.0 || has_nonzero_digit(&s)) {
                Some(s)
            } else {
                exp_text(v, single, None, spec.width)
            }
        },
        Decimals::None | Decimals::Auto => {
            let shortest = plain_text(v, single);
            if spec.fits(&shortest) {
                return Some(shortest);
            }
            let max_d = if single { 9 } else { 17 };
            for d in (0..=max_d).rev() {
                let s = format!("{:.*}", d, v);
                if spec.fits(&s) && (v == 0.0 || has_nonzero_digit(&s)) {
                    return Some(s);
                }
            }
            exp_text(v, single, None, spec.width)
        }
    }
}

fn encode_radix(value: Num, spec: &OutSpec) -> Option<String> {
    let mask = (1u128 << spec.bits) - 1;
    let raw = match value {
        Num::Int(r) => (r as u128) & mask,
        Num::Float(f) if spec.bits == 32 => (f as f32).to_bits() as u128,
        Num::Float(f) => f.to_bits() as u128,
    };
    let s = match spec.base {
        IntBase::Octal => format!("{raw:o}"),
        _ => format!("{raw:X}"),
    };
    if spec.fits(&s) { Some(s) } else { None }
}

/// Shortest digits that read back as `v` (positive, finite, nonzero),
/// with the power of ten of the last digit.
fn shortest_digits(v: f64, single: bool) -> (String, i32) {
    let (mut digits, mut exp) = if single {
        // `{:e}` gives the shortest round-trip form for the f32, e.g. "1.2345e-5"
        let s = format!("{:e}", v as f32);
        let (m, e) = s.split_once('e').unwrap_or((s.as_str(), "0"));
        let digits: String = m.chars().filter(|c| c.is_ascii_digit()).collect();
        let e: i32 = e.parse().unwrap_or(0);
        let n = digits.len() as i32;
        (digits, e - (n - 1))
    } else {
        let fd = d2d(v);
        let mut b = itoa::Buffer::new();
        (b.format(fd.mantissa).to_string(), fd.exponent)
    };
    while digits.len() > 1 && digits.ends_with('0') {
        digits.pop();
        exp += 1;
    }
    (digits, exp)
}

/// The shortest plain decimal rendering of `v`, falling back to exponential
/// form for very large or very small magnitudes.
fn plain_text(v: f64, single: bool) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    let sign = if v < 0.0 { "-" } else { "" };
    let (digits, exp) = shortest_digits(v.abs(), single);
    let n = digits.len() as i32;
    if exp >= 0 && n + exp <= 17 {
        format!("{sign}{digits}{}", "0".repeat(exp as usize))
    } else if exp < 0 && n + exp > 0 {
        let (int_part, frac) = digits.split_at((n + exp) as usize);
        format!("{sign}{int_part}.{frac}")
    } else if exp < 0 && -(n + exp) <= 6 {
        format!("{sign}0.{}{digits}", "0".repeat(-(n + exp) as usize))
    } else {
        exp_text(v, single, None, None).unwrap_or_default()
    }
}

/// Round a digit string to `keep` digits, half up. Returns the digits and
/// whether rounding carried into a new leading digit.
fn round_digits(digits: &str, keep: usize) -> (String, bool) {
    if keep >= digits.len() {
        return (format!("{digits}{}", "0".repeat(keep - digits.len())), false);
    }
    let mut kept: Vec<u8> = digits.as_bytes()[..keep].to_vec();
    if digits.as_bytes()[keep] < b'5' {
        return (String::from_utf8_lossy(&kept).into_owned(), false);
    }
    for i in (0..kept.len()).rev() {
        if kept[i] == b'9' {
            kept[i] = b'0';
        } else {
            kept[i] += 1;
            return (String::from_utf8_lossy(&kept).into_owned(), false);
        }
    }
    kept.insert(0, b'1');
    kept.pop();
    (String::from_utf8_lossy(&kept).into_owned(), true)
}

/// Exponential form `[-]d.dddE+XX`.
///
/// With no precision, all significant digits are kept unless the width
/// forces fewer. Returns `None` if even a single digit does not fit.
fn exp_text(v: f64, single: bool, precision: Option<u32>, width: Option<u32>) -> Option<String> {
    let neg = v < 0.0;
    let (digits, last_exp) = if v == 0.0 { ("0".to_string(), 0) } else { shortest_digits(v.abs(), single) };
    let sci_exp = last_exp + digits.len() as i32 - 1;

    let render = |p: u32| -> String {
        let (rounded, carried) = round_digits(&digits, p as usize + 1);
        let exponent = if carried { sci_exp + 1 } else { sci_exp };
        let mut s = String::new();
        if neg {
            s.push('-');
        }
        s.push_str(&rounded[..1]);
        if p > 0 {
            s.push('.');
            s.push_str(&rounded[1..]);
        }
        let mut b = itoa::Buffer::new();
        let e_digits = b.format(exponent.unsigned_abs());
        s.push('E');
        s.push(if exponent < 0 { '-' } else { '+' });
        if e_digits.len() < 2 {
            s.push('0');
        }
        s.push_str(e_digits);
        s
    };

    match precision {
        Some(p) => {
            let s = render(p);
            if width.map(|w| s.len() <= w as usize).unwrap_or(true) { Some(s) } else { None }
        },
        None => {
            let full = (digits.len() as u32).saturating_sub(1).max(1);
            (0..=full).rev()
                .map(render)
                .find(|s| width.map(|w| s.len() <= w as usize).unwrap_or(true))
        }
    }
}


// ------------------------------------ //
//   EXACT DECIMAL NUMBERS FOR PARSING  //
// ------------------------------------ //

/// A signed decimal number `(-1)^neg * mant * 10^exp` with an exact mantissa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dec {
    pub(crate) neg: bool,
    pub(crate) mant: Big,
    pub(crate) exp: i32,
}

impl Dec {
    fn mag10(&self) -> i64 {
        self.mant.decimal_len() as i64 + self.exp as i64
    }

    /// Exact sum. Operands whose exponents differ by more than 120 cannot
    /// affect each other within any supported width, so the larger one wins.
    pub(crate) fn add(self, other: Dec) -> Dec {
        if other.mant.is_zero() {
            return self;
        }
        if self.mant.is_zero() {
            return other;
        }
        if (self.exp as i64 - other.exp as i64).abs() > 120 {
            return if self.mag10() >= other.mag10() { self } else { other };
        }

        let exp = self.exp.min(other.exp);
        let mut a = self.mant;
        a.mul_pow10((self.exp - exp) as u32);
        let mut b = other.mant;
        b.mul_pow10((other.exp - exp) as u32);

        if self.neg == other.neg {
            a.add(&b);
            return Dec { neg: self.neg, mant: a, exp };
        }
        match a.cmp(&b) {
            Ordering::Less => {
                b.sub(&a);
                Dec { neg: other.neg, mant: b, exp }
            },
            _ => {
                a.sub(&b);
                Dec { neg: self.neg, mant: a, exp }
            }
        }
    }
}

/// The pieces of a decimal number field.
pub(crate) struct NumText {
    pub(crate) dec: Dec,
    pub(crate) had_point: bool,
    /// A trailing `+NAME` or `-NAME`: (subtract?, upper-cased name)
    pub(crate) adjust: Option<(bool, String)>,
}

impl NumText {
    /// Split `[+-]digits[.digits][(E|D)[+-]digits][(+|-)NAME]`.
    pub(crate) fn lex(text: &str) -> Result<Self, Diag> {
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        let mut neg = false;
        if let Some(c @ ('+' | '-')) = chars.first() {
            neg = *c == '-';
            i += 1;
        }

        let mut mant = Big::zero();
        let mut ndigits = 0;
        let mut frac_digits: i64 = 0;
        let mut had_point = false;
        while i < chars.len() {
            let c = chars[i];
            if let Some(d) = c.to_digit(10) {
                mant.mul_small(10);
                mant.add_small(d);
                ndigits += 1;
                if had_point {
                    frac_digits += 1;
                }
            } else if c == '.' && !had_point {
                had_point = true;
            } else {
                break;
            }
            i += 1;
        }
        if ndigits == 0 {
            return Err(Diag::BadNumber);
        }

        let mut exp: i64 = 0;
        if i < chars.len() && matches!(chars[i], 'E' | 'e' | 'D' | 'd') {
            i += 1;
            let mut exp_neg = false;
            if i < chars.len() && matches!(chars[i], '+' | '-') {
                exp_neg = chars[i] == '-';
                i += 1;
            }
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                exp = (exp * 10 + chars[i].to_digit(10).unwrap_or(0) as i64).min(1_000_000);
                i += 1;
            }
            if i == start {
                return Err(Diag::BadNumber);
            }
            if exp_neg {
                exp = -exp;
            }
        }

        let mut adjust = None;
        if i + 1 < chars.len() && matches!(chars[i], '+' | '-') && chars[i + 1].is_ascii_alphabetic() {
            let name: String = chars[i + 1..].iter().collect();
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Diag::BadNumber);
            }
            adjust = Some((chars[i] == '-', name.to_ascii_uppercase()));
            i = chars.len();
        }
        if i != chars.len() {
            return Err(Diag::BadNumber);
        }

        let exp = (exp - frac_digits).clamp(i32::MIN as i64 / 2, i32::MAX as i64 / 2) as i32;
        Ok(Self { dec: Dec { neg, mant, exp }, had_point, adjust })
    }
}

/// Unsigned integer of any size, little-endian base 2^32 limbs with no
/// trailing zero limbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Big {
    limbs: Vec<u32>,
}

const POW10_9: u32 = 1_000_000_000;
const POW5_13: u32 = 1_220_703_125;

impl Big {
    pub(crate) fn zero() -> Self {
        Self { limbs: vec![] }
    }

    pub(crate) fn from_u128(mut v: u128) -> Self {
        let mut limbs = vec![];
        while v > 0 {
            limbs.push(v as u32);
            v >>= 32;
        }
        Self { limbs }
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    fn normalize(&mut self) {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
    }

    pub(crate) fn mul_small(&mut self, m: u32) {
        let mut carry: u64 = 0;
        for limb in self.limbs.iter_mut() {
            let p = *limb as u64 * m as u64 + carry;
            *limb = p as u32;
            carry = p >> 32;
        }
        if carry > 0 {
            self.limbs.push(carry as u32);
        }
        self.normalize();
    }

    pub(crate) fn add_small(&mut self, a: u32) {
        let mut carry = a as u64;
        for limb in self.limbs.iter_mut() {
            if carry == 0 {
                break;
            }
            let s = *limb as u64 + carry;
            *limb = s as u32;
            carry = s >> 32;
        }
        if carry > 0 {
            self.limbs.push(carry as u32);
        }
    }

    pub(crate) fn add(&mut self, other: &Big) {
        if self.limbs.len() < other.limbs.len() {
            self.limbs.resize(other.limbs.len(), 0);
        }
        let mut carry = 0u64;
        for i in 0..self.limbs.len() {
            let s = self.limbs[i] as u64 + other.limbs.get(i).copied().unwrap_or(0) as u64 + carry;
            self.limbs[i] = s as u32;
            carry = s >> 32;
        }
        if carry > 0 {
            self.limbs.push(carry as u32);
        }
    }

    /// `self -= other`; `other` must not be larger than `self`.
    pub(crate) fn sub(&mut self, other: &Big) {
        let mut borrow = 0i64;
        for i in 0..self.limbs.len() {
            let mut d = self.limbs[i] as i64 - other.limbs.get(i).copied().unwrap_or(0) as i64 - borrow;
            borrow = 0;
            if d < 0 {
                d += 1 << 32;
                borrow = 1;
            }
            self.limbs[i] = d as u32;
        }
        self.normalize();
    }

    pub(crate) fn mul_pow10(&mut self, mut n: u32) {
        while n >= 9 {
            self.mul_small(POW10_9);
            n -= 9;
        }
        if n > 0 {
            self.mul_small(10u32.pow(n));
        }
    }

    pub(crate) fn shl(&mut self, bits: u32) {
        if self.is_zero() || bits == 0 {
            return;
        }
        let words = (bits / 32) as usize;
        let rem = bits % 32;
        if rem > 0 {
            let mut carry = 0u32;
            for limb in self.limbs.iter_mut() {
                let next = *limb >> (32 - rem);
                *limb = (*limb << rem) | carry;
                carry = next;
            }
            if carry > 0 {
                self.limbs.push(carry);
            }
        }
        let mut shifted = vec![0; words];
        shifted.append(&mut self.limbs);
        self.limbs = shifted;
    }

    pub(crate) fn shr(&mut self, bits: u32) {
        let words = (bits / 32) as usize;
        if words >= self.limbs.len() {
            self.limbs.clear();
            return;
        }
        self.limbs.drain(..words);
        let rem = bits % 32;
        if rem > 0 {
            for i in 0..self.limbs.len() {
                let hi = self.limbs.get(i + 1).copied().unwrap_or(0);
                self.limbs[i] = (self.limbs[i] >> rem) | (hi << (32 - rem));
            }
        }
        self.normalize();
    }

    /// Floor division by a small divisor, returning the remainder.
    pub(crate) fn div_small(&mut self, d: u32) -> u32 {
        let mut rem = 0u64;
        for limb in self.limbs.iter_mut().rev() {
            let cur = (rem << 32) | *limb as u64;
            *limb = (cur / d as u64) as u32;
            rem = cur % d as u64;
        }
        self.normalize();
        rem as u32
    }

    fn div_pow5(&mut self, mut n: u32) {
        while n >= 13 {
            self.div_small(POW5_13);
            n -= 13;
        }
        if n > 0 {
            self.div_small(5u32.pow(n));
        }
    }

    pub(crate) fn to_u128(&self) -> Option<u128> {
        if self.limbs.len() > 4 {
            return None;
        }
        Some(self.limbs.iter().rev().fold(0u128, |acc, l| (acc << 32) | *l as u128))
    }

    pub(crate) fn to_decimal_string(&self) -> String {
        if let Some(v) = self.to_u128() {
            let mut b = itoa::Buffer::new();
            return b.format(v).to_string();
        }
        let mut n = self.clone();
        let mut chunks = vec![];
        while !n.is_zero() {
            chunks.push(n.div_small(POW10_9));
        }
        let mut s = String::new();
        for (i, c) in chunks.iter().rev().enumerate() {
            if i == 0 {
                s.push_str(&c.to_string());
            } else {
                s.push_str(&format!("{c:09}"));
            }
        }
        s
    }

    pub(crate) fn decimal_len(&self) -> usize {
        if self.is_zero() { 1 } else { self.to_decimal_string().len() }
    }
}

impl PartialOrd for Big {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Big {
    fn cmp(&self, other: &Self) -> Ordering {
        self.limbs.len().cmp(&other.limbs.len())
            .then_with(|| self.limbs.iter().rev().cmp(other.limbs.iter().rev()))
    }
}

/// `round(n / (10^p10 * 2^p2))`, halves rounded away from zero.
///
/// Computed as `floor((2n + D) / 2D)`. With `D = 5^p10 * 2^(p10 + p2)` that is
/// a floor division by the power of five followed by a right shift, and the
/// nested floors are exact.
fn round_div(n: &Big, p10: u32, p2: u32) -> Big {
    if p10 == 0 && p2 == 0 {
        return n.clone();
    }
    let mut d = Big::from_u128(1);
    d.mul_pow10(p10);
    d.shl(p2);
    let mut x = n.clone();
    x.shl(1);
    x.add(&d);
    x.div_pow5(p10);
    x.shr(p10 + p2 + 1);
    x
}
