//! Unit suffixes on numeric fields.
//!
//! A conversion may carry a units template such as `{mV}`. The data field can
//! then be written `2.5V`, `2500mV` or plain `2500`; the suffix is split off,
//! its metric prefix compared with the template's, and the difference folded
//! into the codec's decimal (or, for `Ki`..`Ei`, binary) scale.
use crate::marker::{Diag, Diagnostic};

const BINARY_PREFIXES: [(&str, i32); 6] = [
    ("Ki", 10), ("Mi", 20), ("Gi", 30), ("Ti", 40), ("Pi", 50), ("Ei", 60),
];

const DECIMAL_PREFIXES: [(&str, i32); 20] = [
    ("da", 1), ("y", -24), ("z", -21), ("a", -18), ("f", -15), ("p", -12), ("n", -9),
    ("u", -6), ("m", -3), ("c", -2), ("d", -1), ("h", 2), ("k", 3), ("M", 6),
    ("G", 9), ("T", 12), ("P", 15), ("E", 18), ("Z", 21), ("Y", 24),
];

/// Known base units, longest first so that `min` is not read as milli-`in`.
const BASE_UNITS: [&str; 30] = [
    "byte", "mol", "bit", "ohm", "rad", "deg", "min", "bps",
    "Hz", "Pa", "Wb", "eV", "cd", "sr",
    "m", "g", "s", "A", "K", "N", "J", "W", "C", "V", "F", "S", "T", "H", "B", "l",
];

/// The result of matching a field's suffix against a units template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitScan<'a> {
    /// The field with the unit suffix removed.
    pub numeric: &'a str,
    /// Power of ten to fold into the conversion.
    pub exp10: i32,
    /// Power of two to fold into the conversion.
    pub pow2: i32,
}

fn prefix_scale(prefix: &str) -> Option<(i32, i32)> {
    if prefix.is_empty() {
        return Some((0, 0));
    }
    if let Some((_, e2)) = BINARY_PREFIXES.iter().find(|(p, _)| *p == prefix) {
        return Some((0, *e2));
    }
    DECIMAL_PREFIXES.iter().find(|(p, _)| *p == prefix).map(|(_, e10)| (*e10, 0))
}

/// Split one unit (no `/`) into its prefix scale and base unit.
fn split_unit(unit: &str) -> (i32, i32, &str) {
    for base in BASE_UNITS {
        if let Some(prefix) = unit.strip_suffix(base) {
            if let Some((e10, e2)) = prefix_scale(prefix) {
                return (e10, e2, base);
            }
        }
    }
    (0, 0, unit)
}

/// Scale and base units of a possibly compound unit such as `km/h`.
fn parse_units(text: &str) -> (i32, i32, Vec<&str>) {
    let mut exp10 = 0;
    let mut pow2 = 0;
    let mut bases = vec![];
    for (i, part) in text.split('/').enumerate() {
        let (e10, e2, base) = split_unit(part);
        if i == 0 {
            exp10 += e10;
            pow2 += e2;
        } else {
            exp10 -= e10;
            pow2 -= e2;
        }
        bases.push(base);
    }
    (exp10, pow2, bases)
}

/// Length of the leading part of `field` that reads as a number:
/// sign, digits and point, then an exponent only if digits follow it.
fn numeric_len(field: &str) -> usize {
    let b = field.as_bytes();
    let mut i = 0;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    while i < b.len() && (b[i].is_ascii_digit() || b[i] == b'.') {
        i += 1;
    }
    if i < b.len() && matches!(b[i], b'E' | b'e' | b'D' | b'd') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

/// Split the unit suffix off `field` and compare it with `template`.
///
/// A field without a suffix is taken to be in template units, unless
/// `required` is set. A suffix whose base units differ from the template's
/// is rejected.
pub fn scan_units<'a>(field: &'a str, template: &str, required: bool) -> Result<UnitScan<'a>, Diagnostic> {
    let field = field.trim();
    let split = numeric_len(field);
    let (numeric, suffix) = field.split_at(split);
    let suffix = suffix.trim();

    if suffix.is_empty() {
        if required {
            return Err(Diagnostic::error(Diag::MissingUnits).with_detail(template));
        }
        return Ok(UnitScan { numeric, exp10: 0, pow2: 0 });
    }

    let (t10, t2, t_bases) = parse_units(template);
    let (s10, s2, s_bases) = parse_units(suffix);
    if t_bases != s_bases {
        return Err(Diagnostic::error(Diag::WrongUnits).with_detail(format!("{suffix} given, {template} expected")));
    }
    tracing::trace!(suffix, template, exp10 = s10 - t10, pow2 = s2 - t2, "units matched");
    Ok(UnitScan { numeric, exp10: s10 - t10, pow2: s2 - t2 })
}
