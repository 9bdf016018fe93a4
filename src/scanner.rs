//! Split a control card into fields.
//!
//! The scanner is a small state machine over the characters of the current
//! card. Each call to [`scan`] returns one [`Field`]: its text and the
//! [`Delim`] that ended it. Blanks and tabs are equivalent. A run of blanks
//! ends a field only tentatively: if the next non-blank character is itself a
//! delimiter (`,`, `=`, `)` and the optional ones), that delimiter ends the
//! field instead, so `A , B` and `A,B` scan the same way.
//!
//! At each position the checks are made in a fixed priority: escape first,
//! then quotes, then structural delimiters, then ordinary data.
//!
//! * `'...'` and `"..."` quote a field; a doubled quote inside stands for one
//!   quote character.
//! * `\` makes the next character ordinary data. At the end of a card it asks
//!   for a continuation card and scanning resumes at its first non-blank (or,
//!   inside quotes, after exactly one blank).
//! * `&NAME` is replaced by the value of the variable symbol `NAME`; `&&` is
//!   a literal `&`.
//! * A field ending in a comma at the very end of a card fetches the
//!   continuation card straight away.
//! * `(` at the start of a field opens a group and `)` closes it; `(` after
//!   data ends the field (`NAME(1,2)`).
use error_stack::Report;

use crate::card_error::{CError, CResult};
use crate::context::ScanContext;
use crate::marker::{Diag, Diagnostic};

/// One card's text, indexed by character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Card {
    text: String,
    chars: Vec<char>,
}

impl Card {
    pub fn new(text: &str) -> Self {
        Self { text: text.to_string(), chars: text.chars().collect() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub(crate) fn get(&self, i: usize) -> Option<char> {
        self.chars.get(i).copied()
    }

    /// Characters `start..end`, clipped to the card.
    pub(crate) fn slice(&self, start: usize, end: usize) -> String {
        let end = end.min(self.chars.len());
        if start >= end {
            return String::new();
        }
        self.chars[start..end].iter().collect()
    }

    fn first_non_blank(&self, from: usize) -> usize {
        (from..self.chars.len())
            .find(|i| !matches!(self.chars[*i], ' ' | '\t'))
            .unwrap_or(self.chars.len())
    }
}

/// What ended a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Delim {
    Blank,
    Comma,
    Equals,
    LParen,
    RParen,
    Asterisk,
    Slash,
    Colon,
    Semicolon,
    Plus,
    Minus,
    PlusEquals,
    MinusEquals,
    #[default]
    End,
}

/// Per-scan switches for the optional delimiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub asterisk: bool,
    pub slash: bool,
    pub colon: bool,
    pub semicolon: bool,
    /// `+` and `-` after data end a field.
    pub signs: bool,
    /// Leave `&NAME` alone.
    pub no_symbols: bool,
}

impl ScanOptions {
    pub fn asterisk(mut self, on: bool) -> Self {
        self.asterisk = on;
        self
    }

    pub fn slash(mut self, on: bool) -> Self {
        self.slash = on;
        self
    }

    pub fn colon(mut self, on: bool) -> Self {
        self.colon = on;
        self
    }

    pub fn semicolon(mut self, on: bool) -> Self {
        self.semicolon = on;
        self
    }

    pub fn signs(mut self, on: bool) -> Self {
        self.signs = on;
        self
    }

    pub fn no_symbols(mut self, on: bool) -> Self {
        self.no_symbols = on;
        self
    }
}

/// Where scanning starts on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Columns(usize),
    Words(usize),
}

/// A token extracted from a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub text: String,
    pub delim: Delim,
    /// The field lies inside parentheses.
    pub in_parens: bool,
    /// The parenthesis that encloses this field was opened right before it.
    pub opened_group: bool,
    pub quoted: bool,
    /// Column (0-based) where the field starts.
    pub column: usize,
    pub(crate) depth: i32,
}

/// Per-card scan state, kept in the context.
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    pub(crate) pos: usize,
    pub(crate) depth: i32,
    pub(crate) max_len: usize,
    pub(crate) opts: ScanOptions,
    pub(crate) last: Option<Field>,
    pub(crate) pushed: Option<Field>,
    pub(crate) last_delim: Delim,
}

impl ScanState {
    pub(crate) fn new(max_len: usize) -> Self {
        Self { max_len, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    InitialInField,
    Data,
    SingleQuote,
    DoubleQuote,
    TentativeEnd,
    Terminated,
}

enum Step {
    End(Delim, usize),
    Blank,
    Data,
}

/// Classify `c` as a structural delimiter, a blank, or data.
fn classify(c: char, next: Option<char>, prev: Option<char>, started: bool, opts: &ScanOptions) -> Step {
    match c {
        ' ' | '\t' => Step::Blank,
        ',' => Step::End(Delim::Comma, 1),
        '=' => Step::End(Delim::Equals, 1),
        '(' => Step::End(Delim::LParen, 1),
        ')' => Step::End(Delim::RParen, 1),
        '*' if opts.asterisk => Step::End(Delim::Asterisk, 1),
        '/' if opts.slash => Step::End(Delim::Slash, 1),
        ':' if opts.colon => Step::End(Delim::Colon, 1),
        ';' if opts.semicolon => Step::End(Delim::Semicolon, 1),
        '+' if started && next == Some('=') => Step::End(Delim::PlusEquals, 2),
        '-' if started && next == Some('=') => Step::End(Delim::MinusEquals, 2),
        '+' | '-' if started && opts.signs && !matches!(prev, Some('E' | 'e' | 'D' | 'd')) => {
            Step::End(if c == '+' { Delim::Plus } else { Delim::Minus }, 1)
        },
        _ => Step::Data,
    }
}

/// Accumulates field text up to the maximum length.
struct Builder {
    text: String,
    len: usize,
    max: usize,
    truncated: bool,
}

impl Builder {
    fn push(&mut self, c: char) {
        if self.len < self.max {
            self.text.push(c);
            self.len += 1;
        } else {
            self.truncated = true;
        }
    }

    fn push_str(&mut self, s: &str) {
        s.chars().for_each(|c| self.push(c));
    }
}

/// Start scanning the current card: skip a prefix and set the option flags.
pub fn init_scan(ctx: &mut ScanContext, skip: Skip, opts: ScanOptions) {
    let max_len = ctx.scan.max_len;
    ctx.scan = ScanState::new(max_len);
    ctx.scan.opts = opts;
    ctx.scan.pos = match skip {
        Skip::Columns(n) => n.min(ctx.card.len()),
        Skip::Words(n) => {
            let mut pos = 0;
            for _ in 0..n {
                pos = ctx.card.first_non_blank(pos);
                while matches!(ctx.card.get(pos), Some(c) if c != ' ' && c != '\t') {
                    pos += 1;
                }
            }
            pos
        }
    };
    tracing::trace!(?skip, pos = ctx.scan.pos, "scan initialized");
}

/// Change the maximum field length, returning the previous one.
pub fn set_max_len(ctx: &mut ScanContext, max_len: usize) -> usize {
    std::mem::replace(&mut ctx.scan.max_len, max_len)
}

/// The delimiter that ended the most recent field.
pub fn last_delim(ctx: &ScanContext) -> Delim {
    ctx.scan.last_delim
}

/// `true` if no fields remain on the current card.
pub fn at_end(ctx: &ScanContext) -> bool {
    ctx.scan.pushed.is_none() && ctx.card.first_non_blank(ctx.scan.pos) >= ctx.card.len()
}

/// Scan one field. Returns `None` at the end of the card, after recording
/// `MissingField` if `required`.
pub fn scan(ctx: &mut ScanContext, required: bool) -> Option<Field> {
    if let Some(f) = ctx.scan.pushed.take() {
        tracing::trace!(text = %f.text, "re-delivering pushed-back field");
        ctx.scan.depth = f.depth;
        ctx.scan.last_delim = f.delim;
        ctx.scan.last = Some(f.clone());
        return Some(f);
    }

    let field = scan_field(ctx);
    if ctx.scan.depth > 0 && field.as_ref().map(|f| f.delim == Delim::End).unwrap_or(true) {
        let col = ctx.card.len();
        ctx.record(Diagnostic::error(Diag::UnbalancedParen).at(col));
        ctx.scan.depth = 0;
    }
    match &field {
        Some(f) => {
            tracing::trace!(text = %f.text, delim = ?f.delim, "field scanned");
            ctx.scan.last_delim = f.delim;
            ctx.scan.last = field.clone();
        },
        None => {
            if required {
                let col = ctx.card.len();
                ctx.record(Diagnostic::error(Diag::MissingField).at(col));
            }
            ctx.scan.last_delim = Delim::End;
            ctx.scan.last = None;
        }
    }
    field
}

/// Scan one field and flag a punctuation error if it ended with one of `bad`.
pub fn scan_check(ctx: &mut ScanContext, required: bool, bad: &[Delim]) -> Option<Field> {
    let field = scan(ctx, required)?;
    if bad.contains(&field.delim) {
        ctx.record(Diagnostic::error(Diag::Punctuation).at(field.column).with_detail(field.text.clone()));
    }
    Some(field)
}

/// Push back the most recent field so the next [`scan`] returns it again.
///
/// Only one field can be pending; pushing back a second is an error.
pub fn push_back(ctx: &mut ScanContext) -> CResult<()> {
    if ctx.scan.pushed.is_some() {
        return Err(Report::new(CError::PushBackPending));
    }
    if let Some(f) = ctx.scan.last.take() {
        tracing::trace!(text = %f.text, "field pushed back");
        ctx.scan.pushed = Some(f);
    }
    Ok(())
}

/// Abandon the rest of the current card and any continuation cards after it.
pub fn skip_continuations(ctx: &mut ScanContext) -> usize {
    ctx.scan.pos = ctx.card.len();
    ctx.scan.pushed = None;
    ctx.scan.depth = 0;
    ctx.skip_continuation_lines()
}

/// Check that nothing but blanks remain on the card. Extra fields get a
/// warning and `false` is returned.
pub fn assert_end(ctx: &mut ScanContext) -> bool {
    if at_end(ctx) {
        return true;
    }
    let col = ctx.scan.pushed.as_ref()
        .map(|f| f.column)
        .unwrap_or_else(|| ctx.card.first_non_blank(ctx.scan.pos));
    ctx.record(Diagnostic::warning(Diag::ExtraFields).at(col));
    false
}

/// Read `width` columns in fixed-column mode. Columns past the end of the
/// card read as blanks.
pub(crate) fn take_columns(ctx: &mut ScanContext, width: usize) -> String {
    let start = ctx.scan.pos;
    let text = ctx.card.slice(start, start + width);
    ctx.scan.pos = start + width;
    text
}

/// Fetch a continuation card and position the cursor on it.
fn continue_card(ctx: &mut ScanContext, in_quote: bool) -> bool {
    if !ctx.fetch_continuation() {
        return false;
    }
    ctx.scan.pos = if in_quote {
        if matches!(ctx.card.get(0), Some(' ' | '\t')) { 1 } else { 0 }
    } else {
        ctx.card.first_non_blank(0)
    };
    true
}

/// Replace `&NAME` starting at the cursor.
fn substitute(ctx: &mut ScanContext, b: &mut Builder) {
    let amp = ctx.scan.pos;
    if ctx.card.get(amp + 1) == Some('&') {
        b.push('&');
        ctx.scan.pos += 2;
        return;
    }
    let start = amp + 1;
    let mut end = start;
    while matches!(ctx.card.get(end), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
        end += 1;
    }
    if end == start {
        b.push('&');
        ctx.scan.pos += 1;
        return;
    }

    let name = ctx.card.slice(start, end);
    ctx.scan.pos = end;
    match ctx.resolve_symbol(&name) {
        Some(value) => b.push_str(&value),
        None => ctx.record(Diagnostic::error(Diag::UndefinedSymbol).with_detail(name).at(amp)),
    }
}

/// Close a group at `)`, or flag a stray one. Returns whether it closed a group.
fn close_paren(ctx: &mut ScanContext) -> bool {
    if ctx.scan.depth > 0 {
        ctx.scan.depth -= 1;
        true
    } else {
        let col = ctx.scan.pos;
        ctx.record(Diagnostic::error(Diag::UnbalancedParen).at(col));
        false
    }
}

fn scan_field(ctx: &mut ScanContext) -> Option<Field> {
    let subst = ctx.settings.substitute_symbols && !ctx.scan.opts.no_symbols;
    let opts = ctx.scan.opts;
    let mut b = Builder { text: String::new(), len: 0, max: ctx.scan.max_len, truncated: false };
    let mut state = State::InitialInField;
    let mut started = false;
    let mut quoted = false;
    let mut opened_group = false;
    let mut in_parens = false;
    let mut column = ctx.scan.pos;
    let mut delim = Delim::End;

    while state != State::Terminated {
        let pos = ctx.scan.pos;
        let c = ctx.card.get(pos);
        let next = ctx.card.get(pos + 1);
        let prev = if pos > 0 { ctx.card.get(pos - 1) } else { None };

        match state {
            State::InitialInField => match c {
                None => return None,
                Some(' ' | '\t') => ctx.scan.pos += 1,
                Some('(') => {
                    ctx.scan.depth += 1;
                    opened_group = true;
                    ctx.scan.pos += 1;
                },
                Some('\\') if next.is_none() => {
                    if !continue_card(ctx, false) {
                        ctx.record(Diagnostic::error(Diag::ContinuationExpected).at(pos));
                        return None;
                    }
                },
                Some(_) => {
                    column = pos;
                    in_parens = ctx.scan.depth > 0;
                    state = State::Data;
                }
            },

            State::Data => match c {
                None => state = State::Terminated,
                Some('\\') => {
                    if let Some(escaped) = next {
                        b.push(escaped);
                        ctx.scan.pos += 2;
                        started = true;
                    } else if !continue_card(ctx, false) {
                        ctx.record(Diagnostic::error(Diag::ContinuationExpected).at(pos));
                        ctx.scan.pos += 1;
                        state = State::Terminated;
                    }
                },
                Some(q @ ('\'' | '"')) if !started => {
                    quoted = true;
                    started = true;
                    state = if q == '\'' { State::SingleQuote } else { State::DoubleQuote };
                    ctx.scan.pos += 1;
                },
                Some(ch) => match classify(ch, next, prev, started, &opts) {
                    Step::End(Delim::RParen, n) => {
                        ctx.scan.pos += n;
                        if close_paren(ctx) {
                            delim = Delim::RParen;
                            state = State::Terminated;
                        } else {
                            state = State::TentativeEnd;
                        }
                    },
                    Step::End(d, n) => {
                        ctx.scan.pos += n;
                        if d == Delim::LParen {
                            ctx.scan.depth += 1;
                        }
                        delim = d;
                        state = State::Terminated;
                    },
                    Step::Blank => {
                        ctx.scan.pos += 1;
                        state = State::TentativeEnd;
                    },
                    Step::Data => {
                        if ch == '&' && subst {
                            substitute(ctx, &mut b);
                        } else {
                            b.push(ch);
                            ctx.scan.pos += 1;
                        }
                        started = true;
                    }
                }
            },

            State::SingleQuote | State::DoubleQuote => {
                let q = if state == State::SingleQuote { '\'' } else { '"' };
                match c {
                    None => {
                        ctx.record(Diagnostic::error(Diag::UnbalancedQuote).at(column));
                        state = State::Terminated;
                    },
                    Some('\\') if next.is_none() => {
                        if !continue_card(ctx, true) {
                            ctx.record(Diagnostic::error(Diag::ContinuationExpected).at(pos));
                            ctx.record(Diagnostic::error(Diag::UnbalancedQuote).at(column));
                            ctx.scan.pos += 1;
                            state = State::Terminated;
                        }
                    },
                    Some(ch) if ch == q => {
                        if next == Some(q) {
                            b.push(q);
                            ctx.scan.pos += 2;
                        } else {
                            ctx.scan.pos += 1;
                            state = State::Data;
                        }
                    },
                    Some(ch) => {
                        b.push(ch);
                        ctx.scan.pos += 1;
                    }
                }
            },

            State::TentativeEnd => match c {
                None => state = State::Terminated,
                Some(' ' | '\t') => ctx.scan.pos += 1,
                Some('\\') if next.is_none() => {
                    if !continue_card(ctx, false) {
                        ctx.record(Diagnostic::error(Diag::ContinuationExpected).at(pos));
                        ctx.scan.pos += 1;
                        state = State::Terminated;
                    }
                },
                Some(ch) => match classify(ch, next, prev, true, &opts) {
                    Step::End(Delim::RParen, n) => {
                        ctx.scan.pos += n;
                        if close_paren(ctx) {
                            delim = Delim::RParen;
                            state = State::Terminated;
                        }
                    },
                    Step::End(d @ (Delim::Comma | Delim::Equals | Delim::Asterisk | Delim::Slash | Delim::Colon
                                  | Delim::Semicolon | Delim::PlusEquals | Delim::MinusEquals), n) => {
                        ctx.scan.pos += n;
                        delim = d;
                        state = State::Terminated;
                    },
                    Step::Blank => ctx.scan.pos += 1,
                    _ => {
                        delim = Delim::Blank;
                        state = State::Terminated;
                    }
                }
            },

            State::Terminated => {}
        }
    }

    if b.truncated {
        ctx.record(Diagnostic::error(Diag::FieldTooLong).at(column).with_detail(b.text.clone()));
    }

    if delim == Delim::Comma && at_end(ctx) {
        tracing::debug!("field ends in a comma at end of card, fetching continuation");
        if !continue_card(ctx, false) {
            let col = ctx.card.len();
            ctx.record(Diagnostic::error(Diag::ContinuationExpected).at(col));
        }
    }

    Some(Field {
        text: b.text,
        delim,
        in_parens,
        opened_group,
        quoted,
        column,
        depth: ctx.scan.depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{LinesSource, MemorySink, MemoryTextCache};
    use crate::context::ScanSettings;

    fn context(lines: &[&str]) -> ScanContext {
        let mut ctx = ScanContext::new(
            ScanSettings::default().env_fallback(false),
            Box::new(LinesSource::new(lines.iter().copied())),
            Box::new(MemorySink::new()),
            Box::new(MemoryTextCache::default())
        );
        ctx.next_card();
        ctx
    }

    fn fields(ctx: &mut ScanContext) -> Vec<(String, Delim)> {
        std::iter::from_fn(|| scan(ctx, false)).map(|f| (f.text, f.delim)).collect()
    }

    fn owned(v: &[(&str, Delim)]) -> Vec<(String, Delim)> {
        v.iter().map(|(t, d)| (t.to_string(), *d)).collect()
    }

    #[test]
    fn test_quoting() {
        let mut ctx = context(&["'a,b''c',X"]);
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!(f.text, "a,b'c", "Doubled quote should collapse and the comma should not split the field");
        assert_eq!(f.delim, Delim::Comma);
        assert!(f.quoted);
        assert_eq!(fields(&mut ctx), owned(&[("X", Delim::End)]));

        let mut ctx = context(&["\"it's\" 'x"]);
        assert_eq!(scan(&mut ctx, true).unwrap().text, "it's");
        assert_eq!(scan(&mut ctx, true).unwrap().text, "x");
        assert!(ctx.marker().is_pending(Diag::UnbalancedQuote));
    }

    #[test]
    fn test_blanks_and_delimiters() {
        let mut ctx = context(&["A , B = C  D,,E"]);
        assert_eq!(fields(&mut ctx), owned(&[
            ("A", Delim::Comma), ("B", Delim::Equals), ("C", Delim::Blank),
            ("D", Delim::Comma), ("", Delim::Comma), ("E", Delim::End),
        ]));
        assert!(!ctx.marker().has_pending());
    }

    #[test]
    fn test_optional_delimiters() {
        let mut ctx = context(&["A*B/C:D;E"]);
        assert_eq!(fields(&mut ctx), owned(&[("A*B/C:D;E", Delim::End)]));

        let mut ctx = context(&["A*B/C:D;E"]);
        let opts = ScanOptions::default().asterisk(true).slash(true).colon(true).semicolon(true);
        init_scan(&mut ctx, Skip::Columns(0), opts);
        assert_eq!(fields(&mut ctx), owned(&[
            ("A", Delim::Asterisk), ("B", Delim::Slash), ("C", Delim::Colon), ("D", Delim::Semicolon), ("E", Delim::End),
        ]));

        let mut ctx = context(&["X+=5 Y -= 1E-3"]);
        init_scan(&mut ctx, Skip::Columns(0), ScanOptions::default().signs(true));
        assert_eq!(fields(&mut ctx), owned(&[
            ("X", Delim::PlusEquals), ("5", Delim::Blank), ("Y", Delim::MinusEquals), ("1E-3", Delim::End),
        ]));
    }

    #[test]
    fn test_parentheses() {
        let mut ctx = context(&["KEY(1,2) (3) X"]);
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim, f.in_parens), ("KEY", Delim::LParen, false));
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim, f.in_parens, f.opened_group), ("1", Delim::Comma, true, false));
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim, f.in_parens), ("2", Delim::RParen, true));
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim, f.in_parens, f.opened_group), ("3", Delim::RParen, true, true));
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.in_parens), ("X", false));
        assert!(!ctx.marker().has_pending());

        let mut ctx = context(&["A ) B"]);
        assert_eq!(fields(&mut ctx), owned(&[("A", Delim::Blank), ("B", Delim::End)]));
        assert!(ctx.marker().is_pending(Diag::UnbalancedParen), "A stray ')' should be flagged and read as a blank");
    }

    #[test]
    fn test_trailing_comma_continuation() {
        let mut ctx = context(&["A,B,", "C"]);
        assert_eq!(scan(&mut ctx, true).unwrap().text, "A");
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim), ("B", Delim::Comma), "The field before the comma is still returned");
        assert!(ctx.marker().is_pending(Diag::ContinuationExpected));
        assert!(scan(&mut ctx, false).is_none());
        assert!(ctx.next_card());
        assert_eq!(ctx.card(), "C", "The line that was not a continuation is the next card");

        let mut ctx = context(&["A,", "  B"]);
        assert_eq!(fields(&mut ctx), owned(&[("A", Delim::Comma), ("B", Delim::End)]));
        assert!(!ctx.marker().has_pending());
    }

    #[test]
    fn test_backslash() {
        let mut ctx = context(&["AB\\,C D"]);
        assert_eq!(fields(&mut ctx), owned(&[("AB,C", Delim::Blank), ("D", Delim::End)]));

        let mut ctx = context(&["'HELLO \\", "  WORLD'"]);
        assert_eq!(scan(&mut ctx, true).unwrap().text, "HELLO  WORLD", "Inside quotes only one blank of the continuation is dropped");

        let mut ctx = context(&["LONG\\", "    NAME"]);
        assert_eq!(scan(&mut ctx, true).unwrap().text, "LONGNAME");
    }

    #[test]
    fn test_open_quote_without_continuation() {
        let mut ctx = context(&["'OPEN \\", "NEXT"]);
        let f = scan(&mut ctx, true).unwrap();
        assert!(f.text.starts_with("OPEN"), "The quoted text read so far is kept, got {:?}", f.text);
        assert!(ctx.marker().is_pending(Diag::ContinuationExpected));
        assert!(ctx.marker().is_pending(Diag::UnbalancedQuote));
        assert!(scan(&mut ctx, false).is_none());
        assert!(ctx.next_card());
        assert_eq!(ctx.card(), "NEXT");
    }

    #[test]
    fn test_scan_check() {
        let mut ctx = context(&["A,B=1"]);
        let f = scan_check(&mut ctx, true, &[Delim::Equals]).unwrap();
        assert_eq!((f.text.as_str(), f.delim), ("A", Delim::Comma));
        assert!(!ctx.marker().has_pending());

        let f = scan_check(&mut ctx, true, &[Delim::Equals]).unwrap();
        assert_eq!((f.text.as_str(), f.delim), ("B", Delim::Equals), "The field is still returned");
        assert!(ctx.marker().is_pending(Diag::Punctuation));
        assert_eq!(ctx.marker().mark(), Some(2));

        let f = scan_check(&mut ctx, true, &[Delim::Equals]).unwrap();
        assert_eq!(f.text, "1");
        assert!(scan_check(&mut ctx, false, &[Delim::Equals]).is_none());
    }

    #[test]
    fn test_symbol_substitution() {
        let mut ctx = context(&["&NAME,&UNKNOWN,A&&B,&X&Y"]);
        ctx.define_symbols([("NAME", "42"), ("X", "1,2"), ("Y", "3")]);
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!((f.text.as_str(), f.delim), ("42", Delim::Comma));
        let f = scan(&mut ctx, true).unwrap();
        assert_eq!(f.text, "");
        assert!(ctx.marker().is_pending(Diag::UndefinedSymbol));
        assert_eq!(scan(&mut ctx, true).unwrap().text, "A&B");
        assert_eq!(scan(&mut ctx, true).unwrap().text, "1,23", "Substituted text is not split at its delimiters");

        let mut ctx = context(&["&NAME"]);
        ctx.define_symbols([("NAME", "42")]);
        init_scan(&mut ctx, Skip::Columns(0), ScanOptions::default().no_symbols(true));
        assert_eq!(scan(&mut ctx, true).unwrap().text, "&NAME");
    }

    #[test]
    fn test_field_too_long() {
        let mut ctx = context(&["ABCDEFG H"]);
        assert_eq!(set_max_len(&mut ctx, 4), 32);
        assert_eq!(scan(&mut ctx, true).unwrap().text, "ABCD");
        assert!(ctx.marker().is_pending(Diag::FieldTooLong));
        assert_eq!(scan(&mut ctx, true).unwrap().text, "H");
    }

    #[test]
    fn test_push_back() -> CResult<()> {
        let mut ctx = context(&["A=1"]);
        let f = scan(&mut ctx, true).unwrap();
        push_back(&mut ctx)?;
        let again = scan(&mut ctx, true).unwrap();
        assert_eq!(f, again);
        assert_eq!(last_delim(&ctx), Delim::Equals);

        push_back(&mut ctx)?;
        let err = push_back(&mut ctx).unwrap_err();
        assert!(matches!(err.current_context(), CError::PushBackPending));
        Ok(())
    }

    #[test]
    fn test_skips_and_end() {
        let mut ctx = context(&["RATE  12.5 3"]);
        init_scan(&mut ctx, Skip::Words(1), ScanOptions::default());
        assert_eq!(scan(&mut ctx, true).unwrap().text, "12.5");
        assert!(!assert_end(&mut ctx));
        assert!(ctx.marker().is_pending(Diag::ExtraFields));

        let mut ctx = context(&["RATE  12.5"]);
        init_scan(&mut ctx, Skip::Columns(4), ScanOptions::default());
        assert_eq!(scan(&mut ctx, true).unwrap().text, "12.5");
        assert!(assert_end(&mut ctx));
        assert!(scan(&mut ctx, true).is_none());
        assert!(ctx.marker().is_pending(Diag::MissingField));
    }

    #[test]
    fn test_skip_continuations() {
        let mut ctx = context(&["A B", " C", " D", "E"]);
        scan(&mut ctx, true);
        assert_eq!(skip_continuations(&mut ctx), 2);
        assert!(scan(&mut ctx, false).is_none());
        ctx.next_card();
        assert_eq!(ctx.card(), "E");
    }
}
