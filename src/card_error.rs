//! Fatal errors in format programs and in how callers drive the scanner
//!
//! Problems with the *data* on a card never show up here: those are
//! [`Diagnostic`](crate::marker::Diagnostic)s queued on the error marker so that
//! scanning can carry on. A [`CError`] means the calling program itself is
//! wrong (a malformed format string, a slot of the wrong type, a buffer that is
//! too small) and the whole call is abandoned.
use std::fmt::Display;

use crate::format_specs::PError;

/// Type alias for a `Result` carrying an [`error_stack::Report`] of [`CError`].
pub type CResult<T> = error_stack::Result<T, CError>;

/// An unrecoverable error in a format program or in the use of the scanner
#[derive(Debug, Clone)]
pub enum CError {
    /// The format string does not follow the directive grammar.
    Format(PError),

    /// A directive is syntactically valid but cannot be used as written,
    /// e.g. decimals on a hexadecimal conversion.
    BadDirective { directive: String, reason: &'static str },

    /// A conversion was paired with a slot of an incompatible type.
    SlotMismatch { directive: String, slot: &'static str },

    /// Output would extend past the end of the record buffer.
    BufferOverflow { column: usize, capacity: usize },

    /// A repeat count pulled from the item list was negative or not an integer.
    BadCount(i128),

    /// `?` was used before any `R?` saved a repeat count.
    NoSavedCount,

    /// A bracket group was nested inside another bracket group.
    NestedBracket,

    /// A bracket group indexed outside the bounds of an array slot.
    IndexOutOfRange { index: i64, len: usize },

    /// A complete pass over the format consumed none of the remaining items.
    NoDataDirective,

    /// A second field was pushed back before the first was re-read.
    PushBackPending,

    /// A keyword table had more entries than fit in the found-key bitmask.
    TooManyKeys(usize),

    /// A keyword action named a callback that was never registered.
    UnknownCallback(String),

    /// A keyword action referred to a slot index past the end of the item list.
    NoSuchSlot(usize),
}

impl Display for CError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CError::Format(e) => write!(f, "Invalid format string: {e}"),
            CError::BadDirective { directive, reason } => {
                write!(f, "Directive '{directive}' cannot be used: {reason}")
            },
            CError::SlotMismatch { directive, slot } => {
                write!(f, "Directive '{directive}' cannot convert a {slot} item")
            },
            CError::BufferOverflow { column, capacity } => {
                write!(f, "Output column {column} is past the end of the {capacity}-column record")
            },
            CError::BadCount(n) => write!(f, "Repeat count {n} taken from the item list is not a valid count"),
            CError::NoSavedCount => write!(f, "'?' used with no repeat count saved by 'R?'"),
            CError::NestedBracket => write!(f, "Bracket groups cannot be nested"),
            CError::IndexOutOfRange { index, len } => {
                write!(f, "Bracket index {index} is outside an array of {len} elements")
            },
            CError::NoDataDirective => write!(f, "Format has no conversions left but items remain"),
            CError::PushBackPending => write!(f, "A pushed-back field is already pending"),
            CError::TooManyKeys(n) => write!(f, "Keyword table has {n} entries, at most 64 are allowed"),
            CError::UnknownCallback(name) => write!(f, "No callback registered under the name '{name}'"),
            CError::NoSuchSlot(i) => write!(f, "Keyword action refers to item {i}, which does not exist"),
        }
    }
}

impl std::error::Error for CError {}

impl From<PError> for CError {
    fn from(value: PError) -> Self {
        Self::Format(value)
    }
}

impl CError {
    pub(crate) fn bad_directive(directive: &str, reason: &'static str) -> Self {
        Self::BadDirective { directive: directive.to_string(), reason }
    }
}
