//! Deferred diagnostics for the card being scanned.
//!
//! Nothing is printed at the moment a field turns out to be bad. Instead the
//! [`ErrorMarker`] remembers which [`Diag`] codes are pending, and the column
//! under which to put a `^`, until [`ErrorMarker::flush`] is called, normally
//! because the context is about to write a line or load the next card. A flush
//! writes one report per card:
//!
//! ```text
//! LIMIT 5, ABC
//!          ^
//! *** ERROR: Invalid number (ABC)
//! ```
use std::fmt::Display;

use itertools::Itertools;

use crate::collab::{LineControl, LineSink, Priority};

/// Severity of a diagnostic. Only errors raise the failure flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    Warning,
    Error,
}

/// A diagnostic code. The declaration order is the order in which pending
/// codes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Diag {
    FormatMismatch,
    MissingField,
    ContinuationExpected,
    UnexpectedContinuation,
    UnbalancedQuote,
    UnbalancedParen,
    ParenExpected,
    ParenUnexpected,
    Punctuation,
    FieldTooLong,
    ExtraFields,
    UnknownKeyword,
    AmbiguousKeyword,
    MissingKeyword,
    BadNumber,
    BadDigit,
    Overflow,
    Underflow,
    ZeroNotAllowed,
    NegativeNotAllowed,
    BelowMinimum,
    AboveMaximum,
    BadCode,
    BadCacheId,
    UndefinedSymbol,
    SymbolTooLong,
    MissingUnits,
    WrongUnits,
    UndefinedAdjustment,
    BadValue,
}

impl Diag {
    /// The fixed message printed for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Diag::FormatMismatch => "Field does not match the expected form",
            Diag::MissingField => "Required field is missing",
            Diag::ContinuationExpected => "Continuation card expected",
            Diag::UnexpectedContinuation => "Unexpected continuation card",
            Diag::UnbalancedQuote => "Unbalanced quotes",
            Diag::UnbalancedParen => "Unbalanced parentheses",
            Diag::ParenExpected => "Field must be in parentheses",
            Diag::ParenUnexpected => "Field must not be in parentheses",
            Diag::Punctuation => "Punctuation error",
            Diag::FieldTooLong => "Field too long, truncated",
            Diag::ExtraFields => "Extra fields on card ignored",
            Diag::UnknownKeyword => "Unrecognized keyword",
            Diag::AmbiguousKeyword => "Ambiguous keyword abbreviation",
            Diag::MissingKeyword => "Required keyword not given",
            Diag::BadNumber => "Invalid number",
            Diag::BadDigit => "Invalid digit for the number base",
            Diag::Overflow => "Value too large, limit used",
            Diag::Underflow => "Value too small, zero used",
            Diag::ZeroNotAllowed => "Zero not allowed, smallest value used",
            Diag::NegativeNotAllowed => "Negative value not allowed, zero used",
            Diag::BelowMinimum => "Value below minimum, minimum used",
            Diag::AboveMaximum => "Value above maximum, maximum used",
            Diag::BadCode => "Invalid code letter",
            Diag::BadCacheId => "Invalid text handle",
            Diag::UndefinedSymbol => "Undefined variable symbol",
            Diag::SymbolTooLong => "Variable symbol name or value too long",
            Diag::MissingUnits => "Units are required",
            Diag::WrongUnits => "Units do not match",
            Diag::UndefinedAdjustment => "Undefined adjustment name",
            Diag::BadValue => "Invalid value",
        }
    }
}

impl Display for Diag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// One pending problem with the current card.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    pub code: Diag,
    pub severity: Severity,
    pub detail: Option<String>,
    /// Card column (0-based) of the offending field, if known.
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn error(code: Diag) -> Self {
        Self { code, severity: Severity::Error, detail: None, column: None }
    }

    pub fn warning(code: Diag) -> Self {
        Self { code, severity: Severity::Warning, detail: None, column: None }
    }

    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    /// Downgrade to a warning (used by warning-only range tests).
    pub fn as_warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        if let Some(detail) = &self.detail {
            write!(f, "*** {tag}: {} ({detail})", self.code)
        } else {
            write!(f, "*** {tag}: {}", self.code)
        }
    }
}

/// Accumulates diagnostics for the current card until the next flush.
#[derive(Debug, Default)]
pub struct ErrorMarker {
    pending: Vec<Diagnostic>,
    mark: Option<usize>,
    card_echoed: bool,
    failed: bool,
    reported: usize,
}

impl ErrorMarker {
    /// Queue a diagnostic. The first one that knows its column sets the mark.
    pub fn record(&mut self, diag: Diagnostic) {
        tracing::trace!(code = ?diag.code, severity = ?diag.severity, column = ?diag.column, "diagnostic queued");
        if diag.severity == Severity::Error {
            self.failed = true;
        }
        if self.mark.is_none() {
            self.mark = diag.column;
        }
        self.pending.push(diag);
    }

    /// `true` if any diagnostics are waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Bitmask of the pending codes, bit `n` for the `n`th [`Diag`] variant.
    pub fn pending_mask(&self) -> u64 {
        self.pending.iter().fold(0, |acc, d| acc | (1 << d.code as u64))
    }

    /// `true` if a diagnostic with this code is pending.
    pub fn is_pending(&self, code: Diag) -> bool {
        self.pending.iter().any(|d| d.code == code)
    }

    /// The pending diagnostics, in the order they were recorded.
    pub fn pending(&self) -> &[Diagnostic] {
        &self.pending
    }

    /// The column that will be marked, if any.
    pub fn mark(&self) -> Option<usize> {
        self.mark
    }

    /// Whether any error (not warning) has been recorded since the last reset.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Number of diagnostics written by earlier flushes.
    pub fn reported(&self) -> usize {
        self.reported
    }

    /// Note that the current card has already been shown to the user.
    pub fn set_card_echoed(&mut self, echoed: bool) {
        self.card_echoed = echoed;
    }

    pub(crate) fn new_card(&mut self) {
        self.mark = None;
        self.card_echoed = false;
    }

    pub(crate) fn reset_failure(&mut self) {
        self.failed = false;
    }

    /// Write the report for the pending diagnostics to `sink` and clear them.
    ///
    /// The card is printed first unless it has already been echoed, then the
    /// marker line, then one message per distinct code in priority order.
    pub fn flush(&mut self, sink: &mut dyn LineSink, card: &str) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let worst = pending.iter().map(|d| d.severity).max().unwrap_or(Severity::Warning);
        let priority = if worst == Severity::Error { Priority::Error } else { Priority::Warning };

        if !self.card_echoed {
            sink.emit(card, LineControl::line(priority));
            self.card_echoed = true;
        }
        if let Some(col) = self.mark {
            let marker = format!("{}^", " ".repeat(col));
            sink.emit(&marker, LineControl::line(priority));
        }

        // One line per code: the first diagnostic recorded for a code supplies
        // the detail, the worst severity among them decides the tag.
        let by_code = pending.iter()
            .sorted_by_key(|d| d.code)
            .group_by(|d| d.code);
        for (_, group) in &by_code {
            let group: Vec<&Diagnostic> = group.collect();
            let mut shown = group[0].clone();
            shown.severity = group.iter().map(|d| d.severity).max().unwrap_or(shown.severity);
            let prio = if shown.severity == Severity::Error { Priority::Error } else { Priority::Warning };
            sink.emit(&shown.to_string(), LineControl::line(prio));
            self.reported += 1;
        }
        tracing::debug!(count = pending.len(), mark = ?self.mark, "diagnostics flushed");
        self.mark = None;
    }
}
