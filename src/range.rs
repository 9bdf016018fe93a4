//! Bounds checks on converted numbers, and the named adjustments that a card
//! can add to a number with a `+NAME` or `-NAME` suffix.
//!
//! A [`RangeSpec`] holds up to one lower and one upper test plus an optional
//! nonzero test. The bounds are kept as text and decoded with the same
//! [`NumSpec`] as the value being checked, so `> 0.5` on a fixed-point value
//! with 8 fractional bits means exactly 128 raw units. The tests run in the
//! order minimum, maximum, nonzero; the first one that fails clamps the value
//! and produces the only diagnostic of the call.
use std::collections::HashMap;
use std::fmt::Display;

use error_stack::{Report, ResultExt};

use crate::card_error::{CError, CResult};
use crate::codec::{self, Dec, Num, NumKind, NumSpec, NumText, OutSpec};
use crate::marker::{Diag, Diagnostic};

/// A comparison in a range test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Display for Cmp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
        };
        write!(f, "{s}")
    }
}

/// One side of a range test: the comparison and the bound as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub cmp: Cmp,
    pub text: String,
}

/// Caller-declared limits for one conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSpec {
    pub min: Option<Bound>,
    pub max: Option<Bound>,
    pub nonzero: bool,
    /// Failures are reported as warnings; the value is clamped all the same.
    pub warn_only: bool,
    /// Named adjustment added before the tests.
    pub adjust: Option<String>,
}

impl RangeSpec {
    /// Add a test. `>` and `>=` set the minimum, `<` and `<=` the maximum.
    pub fn test<S: Into<String>>(mut self, cmp: Cmp, bound: S) -> Self {
        let b = Bound { cmp, text: bound.into() };
        match cmp {
            Cmp::Gt | Cmp::Ge => self.min = Some(b),
            Cmp::Lt | Cmp::Le => self.max = Some(b),
        }
        self
    }

    pub fn nonzero(mut self) -> Self {
        self.nonzero = true;
        self
    }

    pub fn warn_only(mut self) -> Self {
        self.warn_only = true;
        self
    }

    pub fn adjust<S: Into<String>>(mut self, name: S) -> Self {
        self.adjust = Some(name.into().to_ascii_uppercase());
        self
    }

    /// `true` if this range test checks nothing.
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && !self.nonzero && self.adjust.is_none()
    }
}

/// Named adjustment values, held as exact decimals in the units the user types.
#[derive(Debug, Clone, Default)]
pub struct Adjustments {
    values: HashMap<String, Dec>,
}

impl Adjustments {
    /// Register (or replace) `name` with the decimal number in `value`.
    pub fn register(&mut self, name: &str, value: &str) -> Result<(), Diagnostic> {
        let parsed = NumText::lex(value.trim())
            .map_err(|code| Diagnostic::error(code).with_detail(value))?;
        if parsed.adjust.is_some() {
            return Err(Diagnostic::error(Diag::BadNumber).with_detail(value));
        }
        tracing::debug!(name, value, "named adjustment registered");
        self.values.insert(name.to_ascii_uppercase(), parsed.dec);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(&name.to_ascii_uppercase()).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_ascii_uppercase())
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Dec> {
        self.values.get(&name.to_ascii_uppercase())
    }
}

/// The outcome of a range check.
#[derive(Debug, Clone, PartialEq)]
pub struct Checked {
    pub value: Num,
    pub diags: Vec<Diagnostic>,
}

/// Check `value`, a number converted under `spec`, against `range`.
///
/// Fails only if a bound is not a number at all.
pub fn check_num(value: Num, spec: &NumSpec, range: &RangeSpec, adjustments: &Adjustments) -> CResult<Checked> {
    let mut diags = vec![];
    let plain = NumSpec { nonzero: false, nonneg: false, base: codec::IntBase::Decimal, ..spec.clone() };
    let mut value = value;

    if let Some(name) = &range.adjust {
        match adjustments.get(name) {
            Some(adj) => value = add_adjustment(value, adj, &plain, &mut diags),
            None => diags.push(Diagnostic::error(Diag::UndefinedAdjustment).with_detail(name.clone())),
        }
    }

    let mut failure = None;
    if let Some(b) = &range.min {
        let lo = bound_value(b, &plain, adjustments)?;
        if less(value, lo) {
            value = lo;
            failure = Some(Diag::BelowMinimum);
        }
    }
    if let (None, Some(b)) = (failure, &range.max) {
        let hi = bound_value(b, &plain, adjustments)?;
        if less(hi, value) {
            value = hi;
            failure = Some(Diag::AboveMaximum);
        }
    }
    if failure.is_none() && range.nonzero && value.is_zero() {
        value = smallest_nonzero(spec);
        failure = Some(Diag::ZeroNotAllowed);
    }

    if let Some(code) = failure {
        let detail = match code {
            Diag::BelowMinimum => range.min.as_ref().map(|b| format!("must be {} {}", b.cmp, b.text)),
            Diag::AboveMaximum => range.max.as_ref().map(|b| format!("must be {} {}", b.cmp, b.text)),
            _ => None,
        };
        let mut d = Diagnostic::error(code);
        if let Some(detail) = detail {
            d = d.with_detail(format!("{detail}, {} used", codec::encode(value, &OutSpec::for_num(&plain))));
        }
        if range.warn_only {
            d = d.as_warning();
        }
        tracing::trace!(code = ?code, warn_only = range.warn_only, "range test failed");
        diags.push(d);
    }

    Ok(Checked { value, diags })
}

fn add_adjustment(value: Num, adj: &Dec, spec: &NumSpec, diags: &mut Vec<Diagnostic>) -> Num {
    let a = codec::scale_dec(adj.clone(), spec, diags);
    match (value, a) {
        (Num::Int(v), Num::Int(a)) => {
            let sum = v + a;
            if sum > spec.max_raw() || sum < spec.min_raw() {
                diags.push(Diagnostic::error(Diag::Overflow));
                Num::Int(sum.clamp(spec.min_raw(), spec.max_raw()))
            } else {
                Num::Int(sum)
            }
        },
        (v, a) => Num::Float(as_f64(v) + as_f64(a)),
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// Decode a bound and move it one raw unit inward if the test is strict.
fn bound_value(bound: &Bound, spec: &NumSpec, adjustments: &Adjustments) -> CResult<Num> {
    let decoded = codec::decode(&bound.text, spec, Some(adjustments));
    let v = decoded.value.ok_or_else(|| {
        Report::new(CError::bad_directive(&bound.text, "range bound is not a number"))
    }).attach_printable_lazy(|| format!("range test {} {}", bound.cmp, bound.text))?;

    let single = spec.bits == 32;
    let v = match (bound.cmp, v) {
        (Cmp::Gt, Num::Int(i)) => Num::Int((i + 1).min(spec.max_raw())),
        (Cmp::Lt, Num::Int(i)) => Num::Int((i - 1).max(spec.min_raw())),
        (Cmp::Gt, Num::Float(f)) => Num::Float(next_float(f, true, single)),
        (Cmp::Lt, Num::Float(f)) => Num::Float(next_float(f, false, single)),
        (_, v) => v,
    };
    Ok(v)
}

fn less(a: Num, b: Num) -> bool {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => a < b,
        (a, b) => as_f64(a) < as_f64(b),
    }
}

fn smallest_nonzero(spec: &NumSpec) -> Num {
    match spec.kind {
        NumKind::Float if spec.bits == 32 => Num::Float(f32::MIN_POSITIVE as f64),
        NumKind::Float => Num::Float(f64::MIN_POSITIVE),
        _ => Num::Int(1),
    }
}

/// The neighbouring float of `f` in the storage precision. From zero the
/// step is to the smallest normal value, matching the zero-forbidden rule.
fn next_float(f: f64, up: bool, single: bool) -> f64 {
    if f == 0.0 {
        let tiny = if single { f32::MIN_POSITIVE as f64 } else { f64::MIN_POSITIVE };
        return if up { tiny } else { -tiny };
    }
    if !f.is_finite() {
        return f;
    }
    let away = (f > 0.0) == up;
    if single {
        let bits = (f as f32).to_bits();
        let bits = if away { bits + 1 } else { bits - 1 };
        f32::from_bits(bits) as f64
    } else {
        let bits = f.to_bits();
        let bits = if away { bits + 1 } else { bits - 1 };
        f64::from_bits(bits)
    }
}

fn int_spec(bits: u32, signed: bool, bscale: u32) -> NumSpec {
    let spec = if signed { NumSpec::signed(bits) } else { NumSpec::unsigned(bits) };
    spec.bscale(bscale)
}

/// Range check for a 32-bit signed fixed-point value.
pub fn check_i32(value: i32, bscale: u32, range: &RangeSpec, adjustments: &Adjustments) -> CResult<(i32, Vec<Diagnostic>)> {
    let c = check_num(Num::Int(value as i128), &int_spec(32, true, bscale), range, adjustments)?;
    Ok((c.value.as_int() as i32, c.diags))
}

/// Range check for a 64-bit signed fixed-point value.
pub fn check_i64(value: i64, bscale: u32, range: &RangeSpec, adjustments: &Adjustments) -> CResult<(i64, Vec<Diagnostic>)> {
    let c = check_num(Num::Int(value as i128), &int_spec(64, true, bscale), range, adjustments)?;
    Ok((c.value.as_int() as i64, c.diags))
}

/// Range check for a 64-bit unsigned fixed-point value.
pub fn check_u64(value: u64, bscale: u32, range: &RangeSpec, adjustments: &Adjustments) -> CResult<(u64, Vec<Diagnostic>)> {
    let c = check_num(Num::Int(value as i128), &int_spec(64, false, bscale), range, adjustments)?;
    Ok((c.value.as_int() as u64, c.diags))
}

pub fn check_f32(value: f32, range: &RangeSpec, adjustments: &Adjustments) -> CResult<(f32, Vec<Diagnostic>)> {
    let c = check_num(Num::Float(value as f64), &NumSpec::float(32), range, adjustments)?;
    Ok((as_f64(c.value) as f32, c.diags))
}

pub fn check_f64(value: f64, range: &RangeSpec, adjustments: &Adjustments) -> CResult<(f64, Vec<Diagnostic>)> {
    let c = check_num(Num::Float(value), &NumSpec::float(64), range, adjustments)?;
    Ok((as_f64(c.value), c.diags))
}
