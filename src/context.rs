//! The scanning context: every piece of mutable state that card scanning
//! needs, owned in one place and passed by reference to each entry point.
//!
//! To use, build a [`ScanSettings`], hand it to [`ScanContext::new`] with the
//! three collaborators, and fetch cards with [`ScanContext::next_card`]:
//!
//! ```
//! use cardfmt::context::{ScanContext, ScanSettings};
//! use cardfmt::collab::{LinesSource, MemorySink, MemoryTextCache};
//!
//! let settings = ScanSettings::default().max_field_len(40).echo_cards(true);
//! let sink = MemorySink::new();
//! let mut ctx = ScanContext::new(
//!     settings,
//!     Box::new(LinesSource::new(["TITLE FIRST RUN"])),
//!     Box::new(sink.clone()),
//!     Box::new(MemoryTextCache::default()),
//! );
//! assert!(ctx.next_card());
//! assert_eq!(ctx.card(), "TITLE FIRST RUN");
//! assert_eq!(sink.texts(), vec!["TITLE FIRST RUN".to_string()]);
//! assert!(!ctx.next_card());
//! ```
//!
//! State is reset at well-defined points: loading a card clears the scan
//! cursor and any pushed-back field (after flushing the diagnostics of the
//! previous card), switching or releasing an input unit changes which symbol
//! table `&NAME` resolves against, and [`ScanContext::reset_session`] clears
//! the named adjustments, the failure flag and the per-run counter.
use std::collections::HashMap;
use std::rc::Rc;

use crate::card_error::CResult;
use crate::collab::{CardSource, LineControl, LineSink, Priority, TextCache};
use crate::marker::{Diag, Diagnostic, ErrorMarker};
use crate::range::Adjustments;
use crate::scanner::{Card, Field, ScanState};
use crate::symbols::SymbolTables;

/// A keyword callback: receives the context and the field that matched.
pub type Callback = Rc<dyn Fn(&mut ScanContext, &Field) -> CResult<()>>;

/// Settings for a scanning context
///
/// To use, instantiate the default version with `ScanSettings::default()` and
/// modify the desired settings with the public methods:
///
/// ```
/// # use cardfmt::context::ScanSettings;
/// let settings = ScanSettings::default().units_required(true).record_len(80);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanSettings {
    pub(crate) max_field_len: usize,
    pub(crate) record_len: usize,
    pub(crate) compat_scale: u8,
    pub(crate) units_required: bool,
    pub(crate) substitute_symbols: bool,
    pub(crate) env_fallback: bool,
    pub(crate) threshold: Priority,
    pub(crate) echo_cards: bool,
}

impl ScanSettings {
    /// Set the longest field the scanner returns before truncating.
    ///
    /// Default is 32 characters.
    pub fn max_field_len(mut self, max_field_len: usize) -> Self {
        self.max_field_len = max_field_len;
        self
    }

    /// Set the capacity of an output record; writing past it is an error.
    ///
    /// Default is 132 columns.
    pub fn record_len(mut self, record_len: usize) -> Self {
        self.record_len = record_len;
        self
    }

    /// Select which binary scale a `Bn[a b c]` directive uses: 0 for `n`,
    /// 1 to 3 for the alternates. Values above 3 are treated as 3.
    pub fn compat_scale(mut self, compat_scale: u8) -> Self {
        self.compat_scale = compat_scale.min(3);
        self
    }

    /// Set whether fields converted under a units template must carry a unit suffix.
    ///
    /// Default is `false`.
    pub fn units_required(mut self, units_required: bool) -> Self {
        self.units_required = units_required;
        self
    }

    /// Set whether `&NAME` is replaced by the value of the symbol.
    ///
    /// Default is `true`.
    pub fn substitute_symbols(mut self, substitute_symbols: bool) -> Self {
        self.substitute_symbols = substitute_symbols;
        self
    }

    /// Set whether symbols not otherwise defined are looked up in the environment.
    ///
    /// Default is `true`.
    pub fn env_fallback(mut self, env_fallback: bool) -> Self {
        self.env_fallback = env_fallback;
        self
    }

    /// Lines emitted below this priority are dropped.
    ///
    /// Default is [`Priority::Normal`].
    pub fn threshold(mut self, threshold: Priority) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set whether each card is written to the sink as it is read.
    ///
    /// Default is `false`; cards are then only shown when they have diagnostics.
    pub fn echo_cards(mut self, echo_cards: bool) -> Self {
        self.echo_cards = echo_cards;
        self
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_field_len: 32,
            record_len: 132,
            compat_scale: 0,
            units_required: false,
            substitute_symbols: true,
            env_fallback: true,
            threshold: Priority::Normal,
            echo_cards: false,
        }
    }
}

/// Passes on only the lines at or above a priority threshold.
struct Filtered<'a> {
    sink: &'a mut dyn LineSink,
    threshold: Priority,
}

impl LineSink for Filtered<'_> {
    fn emit(&mut self, text: &str, control: LineControl) {
        if control.priority >= self.threshold {
            self.sink.emit(text, control);
        }
    }
}

/// All state for one scanning session.
pub struct ScanContext {
    pub(crate) settings: ScanSettings,
    source: Box<dyn CardSource>,
    sink: Box<dyn LineSink>,
    cache: Box<dyn TextCache>,
    pub(crate) card: Card,
    pub(crate) scan: ScanState,
    held: Option<String>,
    symbols: SymbolTables,
    unit: u32,
    adjustments: Adjustments,
    marker: ErrorMarker,
    callbacks: HashMap<String, Callback>,
    pub(crate) saved_count: Option<i128>,
    end_of_input: bool,
}

impl ScanContext {
    pub fn new(settings: ScanSettings, source: Box<dyn CardSource>, sink: Box<dyn LineSink>, cache: Box<dyn TextCache>) -> Self {
        let scan = ScanState::new(settings.max_field_len);
        Self {
            settings, source, sink, cache,
            card: Card::default(),
            scan,
            held: None,
            symbols: SymbolTables::default(),
            unit: 0,
            adjustments: Adjustments::default(),
            marker: ErrorMarker::default(),
            callbacks: HashMap::new(),
            saved_count: None,
            end_of_input: false,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut ScanSettings {
        &mut self.settings
    }

    /// Fetch the next card from the source (or the line held back by a
    /// failed continuation fetch) and make it current. Returns `false` at
    /// end of input, leaving an empty card.
    pub fn next_card(&mut self) -> bool {
        let line = self.held.take().or_else(|| self.source.next_line());
        match line {
            Some(text) => {
                let continuation = self.source.is_continuation(&text);
                self.load_card(&text);
                if continuation {
                    self.record(Diagnostic::warning(Diag::UnexpectedContinuation).at(0));
                }
                true
            },
            None => {
                tracing::debug!("end of card input");
                self.load_card("");
                self.end_of_input = true;
                false
            }
        }
    }

    /// Make `text` the current card, as if it had just been read.
    pub fn load_card(&mut self, text: &str) {
        self.flush_marks();
        tracing::debug!(card = %text, "card loaded");
        if !self.card.is_empty() {
            self.symbols.set_last_command(self.card.text());
        }
        self.card = Card::new(text);
        self.scan = ScanState::new(self.settings.max_field_len);
        self.marker.new_card();
        if self.settings.echo_cards && !text.is_empty() {
            self.emit(text, LineControl::line(Priority::Normal));
            self.marker.set_card_echoed(true);
        }
    }

    /// Read the next line if it continues the current card and make it
    /// current, keeping the scan state. A line that is not a continuation is
    /// held for the next [`ScanContext::next_card`].
    pub(crate) fn fetch_continuation(&mut self) -> bool {
        let line = self.held.take().or_else(|| self.source.next_line());
        match line {
            Some(text) if self.source.is_continuation(&text) => {
                self.flush_marks();
                tracing::debug!(card = %text, "continuation card loaded");
                self.card = Card::new(&text);
                self.scan.pos = 0;
                self.marker.new_card();
                if self.settings.echo_cards {
                    self.emit(&text, LineControl::line(Priority::Normal));
                    self.marker.set_card_echoed(true);
                }
                true
            },
            Some(text) => {
                tracing::debug!(card = %text, "expected a continuation, holding line back");
                self.held = Some(text);
                false
            },
            None => {
                self.end_of_input = true;
                false
            }
        }
    }

    /// Discard any continuation cards that follow the current card.
    pub(crate) fn skip_continuation_lines(&mut self) -> usize {
        let mut skipped = 0;
        loop {
            let Some(text) = self.held.take().or_else(|| self.source.next_line()) else {
                self.end_of_input = true;
                break;
            };
            if self.source.is_continuation(&text) {
                skipped += 1;
            } else {
                self.held = Some(text);
                break;
            }
        }
        skipped
    }

    /// The text of the current card.
    pub fn card(&self) -> &str {
        self.card.text()
    }

    /// `true` once the source has run dry.
    pub fn end_of_input(&self) -> bool {
        self.end_of_input && self.held.is_none()
    }

    /// Queue a diagnostic against the current card.
    pub fn record(&mut self, diag: Diagnostic) {
        self.marker.record(diag);
    }

    pub fn marker(&self) -> &ErrorMarker {
        &self.marker
    }

    /// Note that the host has already shown the current card.
    pub fn set_card_echoed(&mut self) {
        self.marker.set_card_echoed(true);
    }

    /// Write out the pending diagnostics for the current card.
    pub fn flush_marks(&mut self) {
        let mut filtered = Filtered { sink: self.sink.as_mut(), threshold: self.settings.threshold };
        self.marker.flush(&mut filtered, self.card.text());
    }

    /// Send a line to the sink, after any pending diagnostics, if its
    /// priority reaches the threshold.
    pub fn emit(&mut self, text: &str, control: LineControl) {
        self.flush_marks();
        if control.priority >= self.settings.threshold {
            self.sink.emit(text, control);
        }
    }

    /// Flush diagnostics and the sink itself.
    pub fn flush(&mut self) {
        self.flush_marks();
        self.sink.flush();
    }

    /// Whether any error (not warning) has been recorded this session.
    pub fn failed(&self) -> bool {
        self.marker.failed()
    }

    /// Start a new session: clears the failure flag, the named adjustments,
    /// the saved repeat count and the per-run counter.
    pub fn reset_session(&mut self) {
        self.flush_marks();
        self.marker.reset_failure();
        self.adjustments.clear();
        self.saved_count = None;
        self.symbols.reset_counter();
        tracing::debug!("scan session reset");
    }

    /// The input unit whose symbol table `&NAME` resolves against.
    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn set_unit(&mut self, unit: u32) {
        self.unit = unit;
    }

    /// Drop the symbol table of `unit`, as when it is closed or re-executed.
    pub fn release_unit(&mut self, unit: u32) {
        self.symbols.release(unit);
    }

    /// Define symbols for the current unit; problems are recorded as diagnostics.
    pub fn define_symbols<I, N, V>(&mut self, defs: I)
    where I: IntoIterator<Item = (N, V)>,
          N: AsRef<str>,
          V: AsRef<str>
    {
        let unit = self.unit;
        self.define_symbols_for(unit, defs);
    }

    /// Define symbols for a named unit.
    pub fn define_symbols_for<I, N, V>(&mut self, unit: u32, defs: I)
    where I: IntoIterator<Item = (N, V)>,
          N: AsRef<str>,
          V: AsRef<str>
    {
        for d in self.symbols.define_batch(unit, defs) {
            self.record(d);
        }
    }

    pub fn symbols(&self) -> &SymbolTables {
        &self.symbols
    }

    /// Resolve `&NAME` against the current unit, the built-ins and (if
    /// enabled) the environment.
    pub fn resolve_symbol(&mut self, name: &str) -> Option<String> {
        let value = self.symbols.resolve(self.unit, name, self.settings.env_fallback);
        tracing::trace!(name, found = value.is_some(), "symbol lookup");
        value
    }

    /// Register a named adjustment. A bad value is recorded as a diagnostic
    /// and `false` returned.
    pub fn register_adjustment(&mut self, name: &str, value: &str) -> bool {
        match self.adjustments.register(name, value) {
            Ok(()) => true,
            Err(d) => {
                self.record(d);
                false
            }
        }
    }

    pub fn adjustments(&self) -> &Adjustments {
        &self.adjustments
    }

    pub fn adjustments_mut(&mut self) -> &mut Adjustments {
        &mut self.adjustments
    }

    /// Register a keyword callback under `name`, replacing any earlier one.
    pub fn register_callback<F>(&mut self, name: &str, f: F)
    where F: Fn(&mut ScanContext, &Field) -> CResult<()> + 'static
    {
        self.callbacks.insert(name.to_ascii_uppercase(), Rc::new(f));
    }

    pub(crate) fn callback(&self, name: &str) -> Option<Callback> {
        self.callbacks.get(&name.to_ascii_uppercase()).cloned()
    }

    /// Intern `text` in the text cache.
    pub fn intern(&mut self, text: &str) -> u32 {
        self.cache.intern(text)
    }

    /// Look up a text-cache handle.
    pub fn lookup(&self, id: u32) -> Option<String> {
        self.cache.lookup(id).map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{LinesSource, MemorySink, MemoryTextCache};

    fn context(lines: &[&str], settings: ScanSettings) -> (ScanContext, MemorySink) {
        let sink = MemorySink::new();
        let ctx = ScanContext::new(
            settings,
            Box::new(LinesSource::new(lines.iter().copied())),
            Box::new(sink.clone()),
            Box::new(MemoryTextCache::default())
        );
        (ctx, sink)
    }

    #[test]
    fn test_diagnostics_flush_on_next_card() {
        let (mut ctx, sink) = context(&["FIRST CARD", "SECOND"], ScanSettings::default());
        ctx.next_card();
        ctx.record(Diagnostic::error(Diag::BadNumber).at(6).with_detail("CARD"));
        assert!(sink.texts().is_empty(), "Diagnostics must wait for a flush");
        ctx.next_card();
        assert_eq!(sink.texts(), vec![
            "FIRST CARD".to_string(),
            "      ^".to_string(),
            "*** ERROR: Invalid number (CARD)".to_string(),
        ]);
        assert!(ctx.failed());
        ctx.reset_session();
        assert!(!ctx.failed());
    }

    #[test]
    fn test_threshold() {
        let (mut ctx, sink) = context(&[], ScanSettings::default().threshold(Priority::Warning));
        ctx.emit("dropped", LineControl::line(Priority::Normal));
        ctx.emit("kept", LineControl::line(Priority::Error));
        assert_eq!(sink.texts(), vec!["kept".to_string()]);
    }

    #[test]
    fn test_continuation_hold_back() {
        let (mut ctx, _) = context(&["A,", " B", "C"], ScanSettings::default());
        ctx.next_card();
        assert!(ctx.fetch_continuation());
        assert_eq!(ctx.card(), " B");
        assert!(!ctx.fetch_continuation(), "A card without leading blank is not a continuation");
        assert!(ctx.next_card());
        assert_eq!(ctx.card(), "C", "The line read while looking for a continuation must not be lost");
        assert!(!ctx.next_card());
        assert!(ctx.end_of_input());
    }

    #[test]
    fn test_unexpected_continuation() {
        let (mut ctx, _) = context(&[" STRAY", "NEXT"], ScanSettings::default());
        assert!(ctx.next_card());
        assert!(ctx.marker().is_pending(Diag::UnexpectedContinuation));
        assert!(!ctx.failed(), "A stray continuation is only a warning");
        assert!(ctx.next_card());
        assert!(!ctx.marker().is_pending(Diag::UnexpectedContinuation));
    }

    #[test]
    fn test_last_command() {
        let (mut ctx, _) = context(&["RUN 5", "SHOW &CMD"], ScanSettings::default().env_fallback(false));
        ctx.next_card();
        ctx.next_card();
        assert_eq!(ctx.resolve_symbol("CMD").as_deref(), Some("RUN 5"), "&CMD names the card before this one");
        assert!(!ctx.next_card());
        assert_eq!(ctx.resolve_symbol("CMD").as_deref(), Some("SHOW &CMD"));
    }

    #[test]
    fn test_units_and_symbols() {
        let (mut ctx, _) = context(&[], ScanSettings::default());
        ctx.set_unit(3);
        ctx.define_symbols([("SIZE", "10")]);
        assert_eq!(ctx.resolve_symbol("size").as_deref(), Some("10"));
        ctx.set_unit(4);
        assert_eq!(ctx.symbols().lookup(4, "SIZE"), None);
        ctx.release_unit(3);
        assert_eq!(ctx.symbols().lookup(3, "SIZE"), None);

        ctx.define_symbols([("WAY_TOO_LONG_A_NAME", "1")]);
        assert!(ctx.marker().is_pending(Diag::SymbolTooLong));
    }
}
