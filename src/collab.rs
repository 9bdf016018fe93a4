//! The outside world as seen by the scanner: where cards come from, where
//! output lines go, and where interned text lives.
//!
//! Each collaborator is a small trait so that a host program can plug in its
//! own card reader, printer with pagination, or text cache. The in-memory
//! implementations here are enough for tests and simple tools.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::rc::Rc;

/// Supplies cards (lines of control text) one at a time.
pub trait CardSource {
    /// The next line, or `None` at end of input. Line terminators are removed.
    fn next_line(&mut self) -> Option<String>;

    /// Whether `text` continues the previous card. By default a continuation
    /// card starts with a blank or a tab.
    fn is_continuation(&self, text: &str) -> bool {
        text.starts_with(' ') || text.starts_with('\t')
    }
}

/// How a line advances the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    NewLine,
    NewPage,
    ContinueLine,
    Subtitle,
}

/// Output priority. Lines below the context's threshold are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Priority {
    Debug,
    Normal,
    Warning,
    Error,
}

/// Line-control information passed with every emitted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineControl {
    pub advance: Advance,
    pub priority: Priority,
}

impl LineControl {
    /// A plain new line at the given priority.
    pub fn line(priority: Priority) -> Self {
        Self { advance: Advance::NewLine, priority }
    }

    /// A line that starts a new page.
    pub fn page(priority: Priority) -> Self {
        Self { advance: Advance::NewPage, priority }
    }
}

/// Receives output lines.
pub trait LineSink {
    fn emit(&mut self, text: &str, control: LineControl);

    fn flush(&mut self) {}
}

/// Maps text to small integer handles and back.
pub trait TextCache {
    fn intern(&mut self, text: &str) -> u32;

    fn lookup(&self, id: u32) -> Option<&str>;
}


/// A card source over lines held in memory.
#[derive(Debug, Default, Clone)]
pub struct LinesSource {
    lines: VecDeque<String>,
}

impl LinesSource {
    pub fn new<I, S>(lines: I) -> Self
    where I: IntoIterator<Item = S>,
          S: Into<String>
    {
        Self { lines: lines.into_iter().map(|l| l.into()).collect() }
    }

    /// Split `text` into cards at line breaks.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines())
    }

    /// Add a card to the end of the deck.
    pub fn push<S: Into<String>>(&mut self, line: S) {
        self.lines.push_back(line.into());
    }
}

impl CardSource for LinesSource {
    fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

/// A card source reading lines from any buffered reader.
///
/// Read errors end the input; they are logged rather than returned because
/// the scanner has no way to recover mid-card.
pub struct ReaderSource<R: BufRead> {
    reader: R,
    line_num: usize,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_num: 0 }
    }

    /// Number of lines read so far.
    pub fn line_num(&self) -> usize {
        self.line_num
    }
}

impl<R: BufRead> CardSource for ReaderSource<R> {
    fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                self.line_num += 1;
                let trimmed = line.trim_end_matches(|c| c == '\n' || c == '\r');
                Some(trimmed.to_string())
            },
            Err(e) => {
                tracing::warn!(line_num = self.line_num + 1, error = %e, "error reading card, treating as end of input");
                None
            }
        }
    }
}

/// A line sink that keeps every line in memory.
///
/// Clones share the same buffer, so a test can keep one handle and give the
/// other to a [`ScanContext`](crate::context::ScanContext).
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Rc<RefCell<Vec<(String, LineControl)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines emitted so far with their line control.
    pub fn lines(&self) -> Vec<(String, LineControl)> {
        self.lines.borrow().clone()
    }

    /// Just the text of the lines emitted so far.
    pub fn texts(&self) -> Vec<String> {
        self.lines.borrow().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl LineSink for MemorySink {
    fn emit(&mut self, text: &str, control: LineControl) {
        self.lines.borrow_mut().push((text.to_string(), control));
    }
}

/// A line sink writing plain text, with a form feed before each new page.
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> LineSink for WriterSink<W> {
    fn emit(&mut self, text: &str, control: LineControl) {
        let res = match control.advance {
            Advance::NewPage => write!(self.writer, "\x0c{text}\n"),
            Advance::ContinueLine => write!(self.writer, "{text}"),
            Advance::NewLine | Advance::Subtitle => writeln!(self.writer, "{text}"),
        };
        if let Err(e) = res {
            tracing::warn!(error = %e, "could not write output line");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "could not flush output");
        }
    }
}

/// An interning table held in memory. Handles start at 1; 0 is never issued.
#[derive(Debug, Default, Clone)]
pub struct MemoryTextCache {
    texts: Vec<String>,
    ids: HashMap<String, u32>,
}

impl TextCache for MemoryTextCache {
    fn intern(&mut self, text: &str) -> u32 {
        if let Some(id) = self.ids.get(text) {
            return *id;
        }
        self.texts.push(text.to_string());
        let id = self.texts.len() as u32;
        self.ids.insert(text.to_string(), id);
        id
    }

    fn lookup(&self, id: u32) -> Option<&str> {
        let idx = (id as usize).checked_sub(1)?;
        self.texts.get(idx).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use stringreader::StringReader;

    #[test]
    fn test_reader_source() {
        let deck = StringReader::new("TITLE RUN 1\r\n  CONTINUED\nEND");
        let mut src = ReaderSource::new(BufReader::new(deck));
        assert_eq!(src.next_line().as_deref(), Some("TITLE RUN 1"));
        let cont = src.next_line().unwrap();
        assert!(src.is_continuation(&cont), "Line starting with blanks should be a continuation");
        assert_eq!(src.next_line().as_deref(), Some("END"));
        assert_eq!(src.next_line(), None);
        assert_eq!(src.line_num(), 3);
    }

    #[test]
    fn test_text_cache() {
        let mut cache = MemoryTextCache::default();
        let a = cache.intern("alpha");
        let b = cache.intern("beta");
        assert_ne!(a, b);
        assert_eq!(cache.intern("alpha"), a, "Interning the same text twice should return the same handle");
        assert_eq!(cache.lookup(b), Some("beta"));
        assert_eq!(cache.lookup(0), None);
        assert_eq!(cache.lookup(99), None);
    }

    #[test]
    fn test_writer_sink() {
        let mut sink = WriterSink::new(vec![]);
        sink.emit("HEADER", LineControl::page(Priority::Normal));
        sink.emit("body", LineControl::line(Priority::Normal));
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "\x0cHEADER\nbody\n");
    }
}
