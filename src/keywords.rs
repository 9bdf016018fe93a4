//! Keyword scanning: match the fields of a card against a table of keys and
//! run the action attached to each key that matches.
//!
//! Keys may be abbreviated down to their minimum length as long as only one
//! key starts with the abbreviation. An exact match always wins, so `ALPHA`
//! selects `ALPHA` even when `ALPHAX` is also in the table.
//!
//! ```
//! use cardfmt::collab::{LinesSource, MemorySink, MemoryTextCache};
//! use cardfmt::context::{ScanContext, ScanSettings};
//! use cardfmt::keywords::{scan_keywords, KeyAction, KeyEntry, KeyStop};
//! use cardfmt::scanner::{self, ScanOptions, Skip};
//! use cardfmt::slots::Slot;
//!
//! let mut ctx = ScanContext::new(
//!     ScanSettings::default().env_fallback(false),
//!     Box::new(LinesSource::new(["LIM=25 VERB"])),
//!     Box::new(MemorySink::new()),
//!     Box::new(MemoryTextCache::default()),
//! );
//! ctx.next_card();
//! scanner::init_scan(&mut ctx, Skip::Columns(0), ScanOptions::default());
//!
//! let table = [
//!     KeyEntry::new("LIMIT", KeyAction::Convert { format: "I".into(), slot: 0 }).min_len(3),
//!     KeyEntry::new("VERBOSE", KeyAction::Set(1)),
//! ];
//! let mut limit = 0_i32;
//! let mut flags = 0_u64;
//! let scan = scan_keywords(&mut ctx, &table, &mut [Slot::from(&mut limit)], &mut flags).unwrap();
//! assert_eq!((limit, flags, scan.found, scan.stop), (25, 1, 0b11, KeyStop::EndOfCard));
//! ```
use error_stack::{Report, ResultExt};
use itertools::Itertools;

use crate::card_error::{CError, CResult};
use crate::context::ScanContext;
use crate::interp::{self, Outcome};
use crate::marker::{Diag, Diagnostic};
use crate::scanner::{self, Delim, Field};
use crate::slots::Slot;

/// The most entries a table may have: one bit each in [`KeyScan::found`].
pub const MAX_KEYS: usize = 64;

/// What happens when a key matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Convert the value after the key into item `slot` with a one-item format.
    Convert { format: String, slot: usize },
    /// Set these bits in the flag word.
    Set(u64),
    /// Clear these bits in the flag word.
    Clear(u64),
    /// Set the bits, or with `=value` set or clear them by an on/off word.
    OnOff(u64),
    /// Call the callback registered on the context under this name.
    Call(String),
    /// Stop scanning and hand control back to the caller.
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Upper case.
    pub key: String,
    /// Shortest accepted abbreviation.
    pub min_len: usize,
    /// Raise `MissingKeyword` if the card ends without this key.
    pub required: bool,
    pub action: KeyAction,
}

impl KeyEntry {
    pub fn new(key: &str, action: KeyAction) -> Self {
        Self { key: key.to_ascii_uppercase(), min_len: 1, required: false, action }
    }

    pub fn min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len.max(1);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Why a keyword scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStop {
    EndOfCard,
    /// A [`KeyAction::Return`] entry matched. Holds its table index.
    Returned(usize),
    /// A number turned up where a key was expected. It is pushed back so the
    /// caller can read it with a format.
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyScan {
    /// Bit `i` is set if entry `i` matched at least once.
    pub found: u64,
    pub stop: KeyStop,
}

/// What [`convert_after`] expects of the delimiter before the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualsRule {
    Required,
    Forbidden,
    Either,
}

/// Scan fields from the current position to the end of the card, matching
/// each against `table` and running its action.
///
/// `slots` are the items that [`KeyAction::Convert`] entries refer to by
/// index; `flags` is the word that `Set`, `Clear` and `OnOff` act on.
/// Unknown or ambiguous keys are diagnosed and skipped along with a value
/// given after `=`.
pub fn scan_keywords(ctx: &mut ScanContext, table: &[KeyEntry], slots: &mut [Slot], flags: &mut u64) -> CResult<KeyScan> {
    if table.len() > MAX_KEYS {
        return Err(Report::new(CError::TooManyKeys(table.len())));
    }

    let mut found = 0u64;
    let stop = loop {
        let Some(field) = scanner::scan(ctx, false) else { break KeyStop::EndOfCard };
        if field.text.is_empty() && !field.quoted {
            continue;
        }
        if !field.quoted && looks_numeric(&field.text) {
            scanner::push_back(ctx)?;
            break KeyStop::Number;
        }

        let hit = match match_key(table, &field) {
            Ok(hit) => hit,
            Err(code) => {
                ctx.record(Diagnostic::error(code).with_detail(field.text.clone()).at(field.column));
                if field.delim == Delim::Equals {
                    scanner::scan(ctx, false);
                }
                continue;
            }
        };
        found |= 1u64 << hit;
        let entry = &table[hit];
        tracing::trace!(key = %entry.key, field = %field.text, "keyword matched");

        match &entry.action {
            KeyAction::Convert { format, slot } => {
                let len = slots.len();
                let item = slots.get_mut(*slot)
                    .ok_or_else(|| Report::new(CError::NoSuchSlot(*slot)))
                    .attach_printable_lazy(|| format!("keyword {} with {len} items", entry.key))?;
                interp::convert_one(ctx, format, item)
                    .attach_printable_lazy(|| format!("value of keyword {}", entry.key))?;
            },
            KeyAction::Set(mask) => *flags |= mask,
            KeyAction::Clear(mask) => *flags &= !mask,
            KeyAction::OnOff(mask) => {
                if field.delim != Delim::Equals {
                    *flags |= mask;
                } else if let Some(value) = scanner::scan(ctx, true) {
                    match on_off(&value.text) {
                        Some(true) => *flags |= mask,
                        Some(false) => *flags &= !mask,
                        None => ctx.record(Diagnostic::error(Diag::BadValue).with_detail(value.text).at(value.column)),
                    }
                }
            },
            KeyAction::Call(name) => {
                let callback = ctx.callback(name)
                    .ok_or_else(|| Report::new(CError::UnknownCallback(name.clone())))?;
                (*callback)(ctx, &field).attach_printable_lazy(|| format!("callback {name} for keyword {}", entry.key))?;
            },
            KeyAction::Return => break KeyStop::Returned(hit),
        }
    };

    if stop == KeyStop::EndOfCard {
        let column = ctx.card().chars().count();
        let missing = table.iter()
            .enumerate()
            .filter(|(i, e)| e.required && found & (1u64 << i) == 0)
            .map(|(_, e)| e.key.clone())
            .collect_vec();
        for key in missing {
            ctx.record(Diagnostic::error(Diag::MissingKeyword).with_detail(key).at(column));
        }
    }
    Ok(KeyScan { found, stop })
}

/// Convert one value with `format` after checking the delimiter that ended
/// the previous field. A wrong delimiter is diagnosed but the value is still
/// converted.
pub fn convert_after(ctx: &mut ScanContext, format: &str, slot: &mut Slot, rule: EqualsRule) -> CResult<Outcome> {
    let after_equals = scanner::last_delim(ctx) == Delim::Equals;
    let problem = match rule {
        EqualsRule::Required if !after_equals => Some("'=' expected"),
        EqualsRule::Forbidden if after_equals => Some("'=' not allowed"),
        _ => None,
    };
    if let Some(detail) = problem {
        let column = ctx.scan.pos;
        ctx.record(Diagnostic::error(Diag::Punctuation).with_detail(detail).at(column));
    }
    interp::convert_one(ctx, format, slot)
}

/// Find the entry `field` names. An exact match wins outright, otherwise
/// the field must be a prefix of exactly one key and at least as long as
/// that key's minimum.
fn match_key(table: &[KeyEntry], field: &Field) -> Result<usize, Diag> {
    if field.quoted || field.text.is_empty() {
        return Err(Diag::UnknownKeyword);
    }
    let word = field.text.to_ascii_uppercase();
    if let Some(i) = table.iter().position(|e| e.key == word) {
        return Ok(i);
    }
    let candidates = table.iter()
        .positions(|e| word.len() >= e.min_len && e.key.starts_with(&word))
        .collect_vec();
    match candidates.as_slice() {
        [i] => Ok(*i),
        [] => Err(Diag::UnknownKeyword),
        _ => Err(Diag::AmbiguousKeyword),
    }
}

fn looks_numeric(text: &str) -> bool {
    let t = text.strip_prefix(['+', '-']).unwrap_or(text);
    let t = t.strip_prefix('.').unwrap_or(t);
    t.starts_with(|c: char| c.is_ascii_digit())
}

fn on_off(word: &str) -> Option<bool> {
    match word.to_ascii_uppercase().as_str() {
        "ON" | "YES" | "TRUE" | "1" => Some(true),
        "OFF" | "NO" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::collab::{LinesSource, MemorySink, MemoryTextCache};
    use crate::context::ScanSettings;
    use crate::scanner::{ScanOptions, Skip};

    fn context(line: &str) -> ScanContext {
        let mut ctx = ScanContext::new(
            ScanSettings::default().env_fallback(false),
            Box::new(LinesSource::new([line])),
            Box::new(MemorySink::new()),
            Box::new(MemoryTextCache::default())
        );
        ctx.next_card();
        scanner::init_scan(&mut ctx, Skip::Columns(0), ScanOptions::default());
        ctx
    }

    fn run(line: &str, table: &[KeyEntry]) -> (ScanContext, KeyScan, u64) {
        let mut ctx = context(line);
        let mut flags = 0;
        let scan = scan_keywords(&mut ctx, table, &mut [], &mut flags).unwrap();
        (ctx, scan, flags)
    }

    #[test]
    fn test_exact_match_wins() {
        let table = [KeyEntry::new("alpha", KeyAction::Set(1)), KeyEntry::new("ALPHAX", KeyAction::Set(2))];
        let (ctx, scan, flags) = run("ALPHA alphax", &table);
        assert_eq!((scan.found, flags), (0b11, 0b11));
        assert!(!ctx.marker().has_pending());
    }

    #[test]
    fn test_abbreviations() {
        let table = [KeyEntry::new("ALPHA", KeyAction::Set(1)).min_len(2), KeyEntry::new("BETA", KeyAction::Set(2))];
        let (ctx, _, flags) = run("AL B", &table);
        assert_eq!(flags, 3);
        assert!(!ctx.marker().has_pending());

        let (ctx, _, flags) = run("A", &table);
        assert_eq!(flags, 0, "One letter is shorter than ALPHA's minimum");
        assert!(ctx.marker().is_pending(Diag::UnknownKeyword));

        let table = [
            KeyEntry::new("ALPHA", KeyAction::Set(1)).min_len(2),
            KeyEntry::new("ALPHAX", KeyAction::Set(2)).min_len(2),
        ];
        let (ctx, _, flags) = run("AL", &table);
        assert_eq!(flags, 0);
        assert!(ctx.marker().is_pending(Diag::AmbiguousKeyword));
    }

    #[test]
    fn test_conversions_and_switches() {
        let table = [
            KeyEntry::new("LIMIT", KeyAction::Convert { format: "I".into(), slot: 0 }),
            KeyEntry::new("GAIN", KeyAction::Convert { format: "F".into(), slot: 1 }),
            KeyEntry::new("DEBUG", KeyAction::OnOff(4)),
            KeyEntry::new("QUIET", KeyAction::Clear(8)),
        ];
        let mut ctx = context("LIMIT=25 GAIN=1.5 DEBUG=OFF QUIET");
        let (mut limit, mut gain, mut flags) = (0_i32, 0.0_f32, 12_u64);
        let scan = scan_keywords(&mut ctx, &table, &mut [Slot::from(&mut limit), Slot::from(&mut gain)], &mut flags).unwrap();
        assert_eq!((limit, gain, flags, scan.found), (25, 1.5, 0, 0b1111));
        assert!(!ctx.failed());

        let mut ctx = context("DEBUG DEBUG=maybe");
        let mut flags = 0;
        scan_keywords(&mut ctx, &table, &mut [], &mut flags).unwrap();
        assert_eq!(flags, 4, "A bare on/off key sets its bits");
        assert!(ctx.marker().is_pending(Diag::BadValue));

        let mut ctx = context("GAIN=2");
        let mut limit = 0_i32;
        let err = scan_keywords(&mut ctx, &table, &mut [Slot::from(&mut limit)], &mut flags).unwrap_err();
        assert!(matches!(err.current_context(), CError::NoSuchSlot(1)));
    }

    #[test]
    fn test_numbers_and_unknown_keys() {
        let table = [KeyEntry::new("ALPHA", KeyAction::Set(1))];
        let (mut ctx, scan, flags) = run("ALPHA -12 X", &table);
        assert_eq!((scan.stop, flags), (KeyStop::Number, 1));
        assert!(!ctx.marker().has_pending(), "A number is never an unknown keyword");
        assert_eq!(scanner::scan(&mut ctx, true).unwrap().text, "-12");

        let (ctx, scan, flags) = run("ZETA=5 'ALPHA' ALPHA", &table);
        assert_eq!((scan.stop, flags), (KeyStop::EndOfCard, 1));
        let unknown = ctx.marker().pending().iter().filter(|d| d.code == Diag::UnknownKeyword).count();
        assert_eq!(unknown, 2, "ZETA and the quoted ALPHA are unknown, the 5 after ZETA= is skipped");
    }

    #[test]
    fn test_required_and_return() {
        let table = [
            KeyEntry::new("ALPHA", KeyAction::Set(1)),
            KeyEntry::new("BETA", KeyAction::Set(2)).required(),
            KeyEntry::new("END", KeyAction::Return),
        ];
        let (ctx, _, _) = run("ALPHA", &table);
        assert!(ctx.marker().is_pending(Diag::MissingKeyword));

        let (mut ctx, scan, flags) = run("ALPHA END BETA", &table);
        assert_eq!((scan.stop, flags), (KeyStop::Returned(2), 1));
        assert!(!ctx.marker().is_pending(Diag::MissingKeyword), "Required keys are only checked at end of card");
        assert_eq!(scanner::scan(&mut ctx, true).unwrap().text, "BETA");
    }

    #[test]
    fn test_callbacks() {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let table = [KeyEntry::new("TICK", KeyAction::Call("tick".into()))];
        let mut ctx = context("TICK TI");
        ctx.register_callback("Tick", move |_, field| {
            assert!(field.text.eq_ignore_ascii_case("tick") || field.text.eq_ignore_ascii_case("ti"));
            seen.set(seen.get() + 1);
            Ok(())
        });
        let mut flags = 0;
        scan_keywords(&mut ctx, &table, &mut [], &mut flags).unwrap();
        assert_eq!(calls.get(), 2);

        let table = [KeyEntry::new("TOCK", KeyAction::Call("tock".into()))];
        let mut ctx = context("TOCK");
        let err = scan_keywords(&mut ctx, &table, &mut [], &mut flags).unwrap_err();
        assert!(matches!(err.current_context(), CError::UnknownCallback(name) if name == "tock"));
    }

    #[test]
    fn test_table_limit() {
        let table = (0..65).map(|i| KeyEntry::new(&format!("K{i}"), KeyAction::Set(0))).collect_vec();
        let mut ctx = context("K1");
        let mut flags = 0;
        let err = scan_keywords(&mut ctx, &table, &mut [], &mut flags).unwrap_err();
        assert!(matches!(err.current_context(), CError::TooManyKeys(65)));
    }

    #[test]
    fn test_convert_after() {
        let mut ctx = context("LIMIT 5");
        scanner::scan(&mut ctx, true);
        let mut limit = 0_i32;
        convert_after(&mut ctx, "I", &mut Slot::from(&mut limit), EqualsRule::Required).unwrap();
        assert_eq!(limit, 5, "The value is converted even after a punctuation error");
        assert!(ctx.marker().is_pending(Diag::Punctuation));

        let mut ctx = context("LIMIT=6");
        scanner::scan(&mut ctx, true);
        convert_after(&mut ctx, "I", &mut Slot::from(&mut limit), EqualsRule::Required).unwrap();
        assert_eq!(limit, 6);
        assert!(!ctx.marker().has_pending());

        let mut ctx = context("LIMIT=7");
        scanner::scan(&mut ctx, true);
        convert_after(&mut ctx, "I", &mut Slot::from(&mut limit), EqualsRule::Forbidden).unwrap();
        assert!(ctx.marker().is_pending(Diag::Punctuation));
    }
}
