//! Run a format program over a list of typed items.
//!
//! [`read`] fills the items from cards, [`write`] formats them into output
//! records, and [`convert_one`] converts a single item from the current scan
//! position (the keyword layer uses it for the value after `KEY=`).
//!
//! Reading starts in fixed-column mode: every conversion takes its width in
//! columns. An `S` directive switches to free-form scanning, after which each
//! conversion consumes one field.
//!
//! ```
//! use cardfmt::collab::{LinesSource, MemorySink, MemoryTextCache};
//! use cardfmt::context::{ScanContext, ScanSettings};
//! use cardfmt::interp;
//! use cardfmt::slots::Slot;
//!
//! let mut ctx = ScanContext::new(
//!     ScanSettings::default().env_fallback(false),
//!     Box::new(LinesSource::new(["  12  -5"])),
//!     Box::new(MemorySink::new()),
//!     Box::new(MemoryTextCache::default()),
//! );
//! ctx.next_card();
//! let mut pair = [0_i16; 2];
//! interp::read(&mut ctx, "2I4", &mut [Slot::from(&mut pair)]).unwrap();
//! assert_eq!(pair, [12, -5]);
//! ```
use error_stack::{Report, ResultExt};

use crate::card_error::{CError, CResult};
use crate::codec::{self, Decimals, IntBase, Justify, Num, NumKind, NumSpec, OutSpec};
use crate::collab::{LineControl, Priority};
use crate::context::ScanContext;
use crate::format_specs::{ConvKind, Conversion, Directive, FormatProgram, ParenRule, Repeat, Verify};
use crate::marker::{Diag, Diagnostic};
use crate::range::{self, Adjustments};
use crate::scanner::{self, Delim, Field, ScanOptions, Skip};
use crate::slots::Slot;
use crate::units;

/// Why interpretation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Every item was converted.
    Done,
    /// A conversion or `;` found no items left.
    ListExhausted,
    /// `K` was active and a numeric conversion met a keyword. The keyword
    /// is pushed back for the next scan.
    Keyword,
    /// `=` was active and a field ended with `=`. The field is pushed back.
    Equals,
    /// A scan-mode conversion found no more fields on the card.
    EndOfCard,
    /// A record boundary on input found no more cards.
    EndOfInput,
}

/// What a call to [`read`], [`write`] or [`convert_one`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Items fully processed.
    pub items: usize,
    /// Array elements converted or skipped, over all items.
    pub values: usize,
    pub stop: Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

enum Flow {
    Next,
    Stop(Stop),
}

/// Read items from the current card, starting in fixed-column mode at the
/// current column.
pub fn read(ctx: &mut ScanContext, fmt: &str, slots: &mut [Slot]) -> CResult<Outcome> {
    run(ctx, fmt, slots, Mode::Read, false)
}

/// Format items into output records and send them to the context's sink.
pub fn write(ctx: &mut ScanContext, fmt: &str, slots: &mut [Slot]) -> CResult<Outcome> {
    run(ctx, fmt, slots, Mode::Write, false)
}

/// Convert one item from the current scan position, already in scan mode.
pub fn convert_one(ctx: &mut ScanContext, fmt: &str, slot: &mut Slot) -> CResult<Outcome> {
    run(ctx, fmt, std::slice::from_mut(slot), Mode::Read, true)
}

fn run(ctx: &mut ScanContext, fmt: &str, slots: &mut [Slot], mode: Mode, scan_mode: bool) -> CResult<Outcome> {
    let program = FormatProgram::parse(fmt)
        .map_err(|e| Report::new(CError::from(e)))
        .attach_printable_lazy(|| format!("format: {fmt}"))?;
    tracing::trace!(format = fmt, items = slots.len(), ?mode, "interpreting format");

    let capacity = ctx.settings.record_len;
    let mut interp = Interp::new(slots, mode, capacity, scan_mode);
    let stop = interp.run(ctx, &program).attach_printable_lazy(|| format!("format: {fmt}"))?;
    if mode == Mode::Write && interp.dirty {
        interp.emit_record(ctx);
    }
    tracing::debug!(items = interp.item, values = interp.values, ?stop, "format finished");
    Ok(Outcome { items: interp.item.min(interp.slots.len()), values: interp.values, stop })
}

/// Interpreter state for one call.
struct Interp<'s, 'a> {
    slots: &'s mut [Slot<'a>],
    mode: Mode,
    item: usize,
    values: usize,

    // output record
    line: Vec<char>,
    col: usize,
    capacity: usize,
    dirty: bool,
    new_page: bool,

    // input switches, held for the rest of the call
    scan_mode: bool,
    keyword_stop: bool,
    equals_stop: bool,
    not_required: bool,

    scale: i32,
    // apply to the next conversion only
    size: Option<u32>,
    verify: Option<Verify>,

    /// First element index inside a bracket pass.
    bias: Option<usize>,
}

impl<'s, 'a> Interp<'s, 'a> {
    fn new(slots: &'s mut [Slot<'a>], mode: Mode, capacity: usize, scan_mode: bool) -> Self {
        Self {
            slots, mode,
            item: 0,
            values: 0,
            line: Vec::with_capacity(capacity),
            col: 0,
            capacity,
            dirty: false,
            new_page: false,
            scan_mode,
            keyword_stop: false,
            equals_stop: false,
            not_required: false,
            scale: 0,
            size: None,
            verify: None,
            bias: None,
        }
    }

    /// Run the program, reverting to the last top-level group while items remain.
    fn run(&mut self, ctx: &mut ScanContext, program: &FormatProgram) -> CResult<Stop> {
        let directives = program.directives();
        let restart = program.restart_index();
        let mut start = 0;
        loop {
            let before = self.item;
            if let Flow::Stop(stop) = self.seq(ctx, &directives[start..])? {
                return Ok(stop);
            }
            if self.item >= self.slots.len() {
                return Ok(Stop::Done);
            }
            if self.item == before {
                return Err(Report::new(CError::NoDataDirective))
                    .attach_printable_lazy(|| format!("{} of {} items processed", self.item, self.slots.len()));
            }
            tracing::trace!(item = self.item, restart, "format reverting");
            if let Flow::Stop(stop) = self.record_boundary(ctx, 0)? {
                return Ok(stop);
            }
            start = restart;
        }
    }

    fn seq(&mut self, ctx: &mut ScanContext, directives: &[Directive]) -> CResult<Flow> {
        for d in directives {
            if let Flow::Stop(stop) = self.step(ctx, d)? {
                return Ok(Flow::Stop(stop));
            }
        }
        Ok(Flow::Next)
    }

    fn step(&mut self, ctx: &mut ScanContext, directive: &Directive) -> CResult<Flow> {
        match directive {
            Directive::Literal(text) => match self.mode {
                Mode::Write => self.put(text)?,
                Mode::Read if !self.scan_mode => ctx.scan.pos += text.chars().count(),
                Mode::Read => {},
            },
            Directive::Skip(n) => self.skip(ctx, *n as usize)?,
            Directive::Scale(k) => self.scale = *k,
            Directive::Size(n) => self.size = Some(*n),
            Directive::Convert(conv) => return self.convert(ctx, conv),
            Directive::Group { repeat, body } => return self.group(ctx, *repeat, body),
            Directive::Bracket { repeat, body, stride } => return self.bracket(ctx, *repeat, body, *stride),
            Directive::Record => return self.record_boundary(ctx, 0),
            Directive::Indent(n) => return self.record_boundary(ctx, *n as usize),
            Directive::Page => {
                if self.mode == Mode::Write {
                    if self.dirty {
                        self.emit_record(ctx);
                    }
                    self.new_page = true;
                }
            },
            Directive::Column(n) => {
                let col = (*n as usize).saturating_sub(1);
                match self.mode {
                    Mode::Write => self.move_to(col)?,
                    Mode::Read => ctx.scan.pos = col,
                }
            },
            Directive::StopIfDone => {
                if self.item >= self.slots.len() {
                    return Ok(Flow::Stop(Stop::ListExhausted));
                }
            },
            Directive::Scan { words, skip } => {
                if self.mode == Mode::Read {
                    let skip = *skip as usize;
                    let skip = if *words { Skip::Words(skip) } else { Skip::Columns(skip) };
                    scanner::init_scan(ctx, skip, ScanOptions::default());
                    self.scan_mode = true;
                }
            },
            Directive::Keyword => self.keyword_stop = true,
            Directive::Equals => self.equals_stop = true,
            Directive::NotRequired => self.not_required = true,
            Directive::Verify(v) => self.verify = Some(v.clone()),
        }
        Ok(Flow::Next)
    }

    fn group(&mut self, ctx: &mut ScanContext, repeat: Repeat, body: &[Directive]) -> CResult<Flow> {
        if repeat == Repeat::Remaining {
            return Err(Report::new(CError::bad_directive("#(", "'#' can only repeat a conversion")));
        }
        let Some(count) = self.count(ctx, repeat)? else {
            return Ok(Flow::Stop(Stop::ListExhausted));
        };
        for _ in 0..count {
            if let Flow::Stop(stop) = self.seq(ctx, body)? {
                return Ok(Flow::Stop(stop));
            }
        }
        Ok(Flow::Next)
    }

    /// Each pass of a bracket group starts over at the same items, indexing
    /// their elements `pass * stride` further on.
    fn bracket(&mut self, ctx: &mut ScanContext, repeat: Repeat, body: &[Directive], stride: u32) -> CResult<Flow> {
        if self.bias.is_some() {
            return Err(Report::new(CError::NestedBracket));
        }
        if repeat == Repeat::Remaining {
            return Err(Report::new(CError::bad_directive("#<", "'#' can only repeat a conversion")));
        }
        let Some(count) = self.count(ctx, repeat)? else {
            return Ok(Flow::Stop(Stop::ListExhausted));
        };
        let start = self.item;
        let mut end = start;
        for pass in 0..count as usize {
            self.item = start;
            self.bias = Some(pass * stride as usize);
            let flow = self.seq(ctx, body);
            self.bias = None;
            if let Flow::Stop(stop) = flow? {
                return Ok(Flow::Stop(stop));
            }
            end = self.item;
        }
        self.item = end;
        Ok(Flow::Next)
    }

    /// Resolve a repeat count. `None` means the count had to come from the
    /// item list and the list is used up.
    fn count(&mut self, ctx: &mut ScanContext, repeat: Repeat) -> CResult<Option<u32>> {
        let n = match repeat {
            Repeat::Count(n) => n as i128,
            Repeat::Saved => ctx.saved_count.ok_or_else(|| Report::new(CError::NoSavedCount))?,
            Repeat::Remaining => {
                let Some(slot) = self.slots.get(self.item) else { return Ok(None) };
                slot.len().saturating_sub(self.bias.unwrap_or(0)) as i128
            },
            Repeat::List | Repeat::ListSave | Repeat::ListSkip => {
                let Some(slot) = self.slots.get(self.item) else { return Ok(None) };
                let elem = self.bias.unwrap_or(0);
                let n = match slot.get_num(elem) {
                    Some(Num::Int(n)) => n,
                    Some(Num::Float(f)) if f.is_finite() && f.fract() == 0.0 => f as i128,
                    Some(Num::Float(f)) => {
                        return Err(Report::new(CError::BadCount(f as i128)))
                            .attach_printable_lazy(|| format!("count {f} is not a whole number"));
                    },
                    None if slot.is_text() => {
                        return Err(Report::new(CError::SlotMismatch { directive: "R".to_string(), slot: slot.type_name() }));
                    },
                    None => return Err(Report::new(CError::IndexOutOfRange { index: elem as i64, len: slot.len() })),
                };
                if n < 0 {
                    return Err(Report::new(CError::BadCount(n)));
                }
                self.item += 1;
                if repeat == Repeat::ListSave {
                    ctx.saved_count = Some(n);
                }
                n
            },
        };
        let n = u32::try_from(n).map_err(|_| Report::new(CError::BadCount(n)))?;
        if n == 0 && repeat == Repeat::ListSkip && self.item < self.slots.len() {
            self.item += 1;
        }
        Ok(Some(n))
    }

    /// Run one conversion directive over `count` elements of the current
    /// item. Outside a bracket the elements flow on into the next items.
    fn convert(&mut self, ctx: &mut ScanContext, conv: &Conversion) -> CResult<Flow> {
        let size = self.size.take();
        let verify = self.verify.take();
        if self.item >= self.slots.len() {
            return Ok(Flow::Stop(Stop::ListExhausted));
        }
        let Some(count) = self.count(ctx, conv.repeat)? else {
            return Ok(Flow::Stop(Stop::ListExhausted));
        };
        if count == 0 {
            // an empty array under `#` is still used up
            if conv.repeat == Repeat::Remaining {
                self.item += 1;
            }
            return Ok(Flow::Next);
        }

        let mut elem = self.bias.unwrap_or(0);
        let mut left = count;
        while left > 0 {
            let Some(slot) = self.slots.get(self.item) else {
                return Ok(Flow::Stop(Stop::ListExhausted));
            };
            let len = slot.len();
            if elem >= len {
                if self.bias.is_some() {
                    return Err(Report::new(CError::IndexOutOfRange { index: elem as i64, len }))
                        .attach_printable_lazy(|| format!("directive: {}", conv.text));
                }
                self.item += 1;
                elem = 0;
                continue;
            }
            let spec = self.slot_spec(ctx, conv, size)?;
            let flow = match self.mode {
                Mode::Write => self.write_element(ctx, conv, spec, elem)?,
                Mode::Read => self.read_element(ctx, conv, spec, verify.as_ref(), elem)?,
            };
            if let Flow::Stop(stop) = flow {
                return Ok(Flow::Stop(stop));
            }
            self.values += 1;
            elem += 1;
            left -= 1;
        }
        self.item += 1;
        Ok(Flow::Next)
    }

    /// Check the current item against the conversion and build the codec
    /// description for numeric kinds.
    fn slot_spec(&self, ctx: &ScanContext, conv: &Conversion, size: Option<u32>) -> CResult<Option<NumSpec>> {
        let slot = &self.slots[self.item];
        let mismatch = || Report::new(CError::SlotMismatch { directive: conv.text.clone(), slot: slot.type_name() });
        let bad = |reason| Report::new(CError::bad_directive(&conv.text, reason));
        match &conv.kind {
            ConvKind::Alpha => return if slot.is_text() { Ok(None) } else { Err(mismatch()) },
            ConvKind::Cache => return if slot.is_integer() { Ok(None) } else { Err(mismatch()) },
            ConvKind::Mask(codes) => {
                if !slot.is_integer() {
                    return Err(mismatch());
                }
                if codes.chars().count() as u32 > slot.elem_bits().unwrap_or(0) {
                    return Err(bad("more code letters than bits in the item"));
                }
                return Ok(None);
            },
            _ => {},
        }

        let mut spec = slot.num_spec().ok_or_else(mismatch)?;
        if let Some(bytes) = size {
            if ![1, 2, 4, 8].contains(&bytes) {
                return Err(bad("item size must be 1, 2, 4 or 8 bytes"));
            }
            let bits = bytes * 8;
            if bits > spec.bits || (spec.kind == NumKind::Float && bits != spec.bits) {
                return Err(bad("item size does not fit the item"));
            }
            spec.bits = bits;
        }

        let radix = matches!(conv.kind, ConvKind::Hex | ConvKind::Octal);
        spec.base = match conv.kind {
            ConvKind::Hex => IntBase::Hexadecimal,
            ConvKind::Octal => IntBase::Octal,
            _ => IntBase::Decimal,
        };
        if spec.kind != NumKind::Float {
            match conv.kind {
                ConvKind::Int => spec.kind = NumKind::Signed,
                ConvKind::Unsigned => spec.kind = NumKind::Unsigned,
                _ => {},
            }
        }
        if radix && conv.decimals != Decimals::None {
            return Err(bad("decimals on a hexadecimal or octal conversion"));
        }

        if let Some(base) = conv.bscale {
            if spec.kind == NumKind::Float {
                return Err(bad("binary scale on a floating-point item"));
            }
            if radix {
                return Err(bad("binary scale on a hexadecimal or octal conversion"));
            }
            if conv.alternates.len() > 3 {
                return Err(bad("more than three alternate binary scales"));
            }
            if base > 63 || conv.alternates.iter().any(|&a| a > 63) {
                return Err(bad("binary scale above 63"));
            }
            spec.bscale = match ctx.settings.compat_scale {
                0 => base,
                k => conv.alternates.get(k as usize - 1).copied().unwrap_or(base),
            };
        }
        if let Decimals::Fixed(d) = conv.decimals {
            spec = spec.implied(d, false);
        }
        if !radix {
            spec.exp10 = self.scale.checked_neg().ok_or_else(|| bad("scale factor out of range"))?;
        }
        Ok(Some(spec))
    }

    fn write_element(&mut self, ctx: &mut ScanContext, conv: &Conversion, spec: Option<NumSpec>, elem: usize) -> CResult<Flow> {
        let slot = &self.slots[self.item];
        let text = match (&conv.kind, spec) {
            (ConvKind::Alpha, _) => fit_text(slot.get_text(elem).unwrap_or_default(), conv),
            (ConvKind::Cache, _) => {
                let handle = raw_bits(slot, elem);
                match u32::try_from(handle).ok().and_then(|h| ctx.lookup(h)) {
                    Some(text) => fit_text(&text, conv),
                    None => {
                        ctx.record(Diagnostic::error(Diag::BadCacheId).with_detail(handle.to_string()).at(self.col));
                        "*".repeat(conv.width.unwrap_or(1) as usize)
                    },
                }
            },
            (ConvKind::Mask(codes), _) => {
                let bits = raw_bits(slot, elem);
                let set: String = codes.chars()
                    .enumerate()
                    .filter(|(i, _)| (bits >> i) & 1 == 1)
                    .map(|(_, c)| c)
                    .collect();
                fit_text(&set, conv)
            },
            (_, Some(spec)) => {
                let value = slot.get_as(elem, &spec).ok_or_else(|| {
                    Report::new(CError::SlotMismatch { directive: conv.text.clone(), slot: slot.type_name() })
                })?;
                encode_num(value, &spec, conv)
            },
            (_, None) => return Err(Report::new(CError::bad_directive(&conv.text, "not a numeric item"))),
        };
        self.put(&text)?;
        Ok(Flow::Next)
    }

    fn read_element(&mut self, ctx: &mut ScanContext, conv: &Conversion, spec: Option<NumSpec>, verify: Option<&Verify>, elem: usize) -> CResult<Flow> {
        let (text, column) = if self.scan_mode {
            let Some(field) = scanner::scan(ctx, !self.not_required) else {
                return Ok(Flow::Stop(Stop::EndOfCard));
            };
            if self.equals_stop && field.delim == Delim::Equals {
                scanner::push_back(ctx)?;
                return Ok(Flow::Stop(Stop::Equals));
            }
            if self.keyword_stop && stops_on_keyword(&conv.kind) && is_keyword(&field) {
                scanner::push_back(ctx)?;
                return Ok(Flow::Stop(Stop::Keyword));
            }
            if let Some(v) = verify {
                if !paren_ok(ctx, v.paren, &field) {
                    return Ok(Flow::Next);
                }
            }
            if field.text.is_empty() && !field.quoted {
                return Ok(Flow::Next);
            }
            let mut text = field.text;
            if let Some(w) = conv.width.map(|w| w as usize) {
                if text.chars().count() > w {
                    ctx.record(Diagnostic::warning(Diag::FieldTooLong).with_detail(text.clone()).at(field.column));
                    text = text.chars().take(w).collect();
                }
            }
            (text, field.column)
        } else {
            let width = conv.width.ok_or_else(|| {
                Report::new(CError::bad_directive(&conv.text, "a width is needed to read in column mode"))
            })?;
            let column = ctx.scan.pos;
            (scanner::take_columns(ctx, width as usize), column)
        };

        match (&conv.kind, spec) {
            (ConvKind::Alpha, _) => {
                let text = if self.scan_mode { text } else { text.trim_end().to_string() };
                self.slots[self.item].set_text(elem, text);
            },
            (ConvKind::Cache, _) => {
                let text = text.trim();
                if !text.is_empty() {
                    let id = ctx.intern(text);
                    let slot = &mut self.slots[self.item];
                    match slot.fit_num(Num::Int(id as i128)) {
                        (value, None) => {
                            slot.set_num(elem, value);
                        },
                        (_, Some(_)) => {
                            let detail = format!("cache id {id} does not fit {}", slot.type_name());
                            ctx.record(Diagnostic::error(Diag::Overflow).with_detail(detail).at(column));
                        },
                    }
                }
            },
            (ConvKind::Mask(codes), _) => {
                let mut bits = 0u128;
                for c in text.trim().chars() {
                    match codes.chars().position(|k| k.eq_ignore_ascii_case(&c)) {
                        Some(i) => bits |= 1u128 << i,
                        None => {
                            ctx.record(Diagnostic::error(Diag::BadCode).with_detail(c.to_string()).at(column));
                            return Ok(Flow::Next);
                        },
                    }
                }
                self.slots[self.item].set_num(elem, Num::Int(bits as i128));
            },
            (_, Some(spec)) => {
                if let Some(value) = self.read_num(ctx, conv, &spec, verify, &text, column)? {
                    let slot = &mut self.slots[self.item];
                    let (value, clamped) = slot.fit_num(value);
                    if let Some(diag) = clamped {
                        ctx.record(Diagnostic::error(diag).with_detail(text.trim().to_string()).at(column));
                    }
                    slot.set_num(elem, value);
                }
            },
            (_, None) => return Err(Report::new(CError::bad_directive(&conv.text, "not a numeric item"))),
        }
        Ok(Flow::Next)
    }

    /// Decode a numeric field, strip its units and apply the pending range
    /// tests. `None` leaves the element unchanged.
    fn read_num(&self, ctx: &mut ScanContext, conv: &Conversion, spec: &NumSpec, verify: Option<&Verify>, text: &str, column: usize) -> CResult<Option<Num>> {
        let (numeric, decode_spec) = match &conv.units {
            Some(template) => {
                let (body, adjust) = split_adjustment(text.trim(), ctx.adjustments());
                match units::scan_units(body, template, ctx.settings.units_required) {
                    Ok(u) => {
                        let s = NumSpec { exp10: spec.exp10 + u.exp10, pow2: spec.pow2 + u.pow2, ..spec.clone() };
                        (format!("{}{adjust}", u.numeric), s)
                    },
                    Err(d) => {
                        ctx.record(at_column(d, column));
                        return Ok(None);
                    },
                }
            },
            None => (text.to_string(), spec.clone()),
        };

        let decoded = codec::decode(&numeric, &decode_spec, Some(ctx.adjustments()));
        for d in decoded.diags {
            ctx.record(at_column(d, column));
        }
        let Some(mut value) = decoded.value else { return Ok(None) };

        if let Some(v) = verify {
            let bounds = NumSpec { implied: 0, force_implied: false, ..spec.clone() };
            let checked = range::check_num(value, &bounds, &v.range, ctx.adjustments())?;
            for d in checked.diags {
                ctx.record(at_column(d, column));
            }
            value = checked.value;
        }
        Ok(Some(value))
    }

    /// End the current record. On output the record is sent to the sink;
    /// on input the next card is fetched. Either way the next record
    /// starts at column `indent`.
    fn record_boundary(&mut self, ctx: &mut ScanContext, indent: usize) -> CResult<Flow> {
        match self.mode {
            Mode::Write => {
                self.emit_record(ctx);
                self.move_to(indent)?;
            },
            Mode::Read => {
                if !ctx.next_card() {
                    return Ok(Flow::Stop(Stop::EndOfInput));
                }
                if self.scan_mode {
                    scanner::init_scan(ctx, Skip::Columns(indent), ScanOptions::default());
                } else {
                    ctx.scan.pos = indent;
                }
            },
        }
        Ok(Flow::Next)
    }

    fn emit_record(&mut self, ctx: &mut ScanContext) {
        let text: String = self.line.iter().collect();
        let control = if self.new_page {
            LineControl::page(Priority::Normal)
        } else {
            LineControl::line(Priority::Normal)
        };
        tracing::debug!(record = %text.trim_end(), page = self.new_page, "output record flushed");
        ctx.emit(text.trim_end(), control);
        self.line.clear();
        self.col = 0;
        self.dirty = false;
        self.new_page = false;
    }

    fn skip(&mut self, ctx: &mut ScanContext, n: usize) -> CResult<()> {
        match self.mode {
            Mode::Write => self.move_to(self.col + n)?,
            Mode::Read if self.scan_mode => {
                for _ in 0..n {
                    if scanner::scan(ctx, false).is_none() {
                        break;
                    }
                }
            },
            Mode::Read => ctx.scan.pos += n,
        }
        Ok(())
    }

    fn move_to(&mut self, col: usize) -> CResult<()> {
        if col > self.capacity {
            return Err(Report::new(CError::BufferOverflow { column: col + 1, capacity: self.capacity }));
        }
        self.col = col;
        Ok(())
    }

    /// Write `text` into the record at the current column.
    fn put(&mut self, text: &str) -> CResult<()> {
        let n = text.chars().count();
        let end = self.col + n;
        if end > self.capacity {
            return Err(Report::new(CError::BufferOverflow { column: end, capacity: self.capacity }))
                .attach_printable_lazy(|| format!("writing {text:?}"));
        }
        if self.line.len() < end {
            self.line.resize(end, ' ');
        }
        for (i, c) in text.chars().enumerate() {
            self.line[self.col + i] = c;
        }
        self.col = end;
        self.dirty = true;
        Ok(())
    }
}

/// Split a trailing `+NAME` or `-NAME` off `text` when `NAME` is a registered
/// adjustment, so the units suffix in front of it can be matched on its own.
fn split_adjustment<'t>(text: &'t str, adjustments: &Adjustments) -> (&'t str, &'t str) {
    let found = text.char_indices()
        .filter(|&(i, c)| i > 0 && (c == '+' || c == '-'))
        .map(|(i, _)| i)
        .find(|&i| {
            let name = &text[i + 1..];
            name.starts_with(|c: char| c.is_ascii_alphabetic()) && adjustments.contains(name)
        });
    match found {
        Some(i) => text.split_at(i),
        None => (text, ""),
    }
}

/// Decimal numeric conversions give way to a keyword under `K`.
fn stops_on_keyword(kind: &ConvKind) -> bool {
    matches!(kind, ConvKind::Int | ConvKind::Unsigned | ConvKind::Fixed | ConvKind::Exp)
}

fn is_keyword(field: &Field) -> bool {
    !field.quoted && field.text.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

fn paren_ok(ctx: &mut ScanContext, rule: ParenRule, field: &Field) -> bool {
    let failure = match rule {
        ParenRule::Any => None,
        ParenRule::InParens if !field.in_parens => Some(Diag::ParenExpected),
        ParenRule::Outside if field.in_parens => Some(Diag::ParenUnexpected),
        ParenRule::Within if !field.in_parens => Some(Diag::ParenExpected),
        ParenRule::Within if field.opened_group => Some(Diag::ParenUnexpected),
        _ => None,
    };
    match failure {
        Some(code) => {
            ctx.record(Diagnostic::error(code).with_detail(field.text.clone()).at(field.column));
            false
        },
        None => true,
    }
}

fn at_column(d: Diagnostic, column: usize) -> Diagnostic {
    if d.column.is_some() { d } else { d.at(column) }
}

/// The element's bits as an unsigned number.
fn raw_bits(slot: &Slot, elem: usize) -> i128 {
    let bits = slot.elem_bits().unwrap_or(64);
    slot.get_as(elem, &NumSpec::unsigned(bits)).map(|n| n.as_int()).unwrap_or(0)
}

fn encode_num(value: Num, spec: &NumSpec, conv: &Conversion) -> String {
    let mut out = OutSpec::for_num(spec)
        .decimals(conv.decimals)
        .zero_pad(conv.zero_pad)
        .exp_form(conv.kind == ConvKind::Exp);
    if let Some(w) = conv.width {
        out = out.width(w);
    }
    match (&conv.units, conv.justify) {
        (None, Some(gap)) => codec::encode(value, &out.justify(Justify::Left { gap })),
        (None, None) => codec::encode(value, &out),
        (Some(units), gap) => {
            if gap.is_some() {
                out = out.justify(Justify::Left { gap: 0 });
            }
            let mut s = codec::encode(value, &out);
            if gap.is_some() {
                s.truncate(s.trim_end().len());
            }
            s.push_str(units);
            s.push_str(&" ".repeat(gap.unwrap_or(0) as usize));
            s
        },
    }
}

/// Fit text into the conversion's width: right-justified, or left-justified
/// and followed by the `J` gap. Longer text is cut at the width.
fn fit_text(text: &str, conv: &Conversion) -> String {
    let gap = conv.justify.map(|g| g as usize);
    match (conv.width.map(|w| w as usize), gap) {
        (Some(w), None) => {
            let n = text.chars().count();
            if n >= w {
                text.chars().take(w).collect()
            } else {
                format!("{}{text}", " ".repeat(w - n))
            }
        },
        (Some(w), Some(g)) => {
            let cut: String = text.chars().take(w).collect();
            let pad = w - cut.chars().count() + g;
            format!("{cut}{}", " ".repeat(pad))
        },
        (None, gap) => format!("{text}{}", " ".repeat(gap.unwrap_or(0))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{Advance, LinesSource, MemorySink, MemoryTextCache};
    use crate::context::ScanSettings;

    fn context(lines: &[&str], settings: ScanSettings) -> (ScanContext, MemorySink) {
        let sink = MemorySink::new();
        let mut ctx = ScanContext::new(
            settings.env_fallback(false),
            Box::new(LinesSource::new(lines.iter().copied())),
            Box::new(sink.clone()),
            Box::new(MemoryTextCache::default())
        );
        ctx.next_card();
        (ctx, sink)
    }

    fn reader(lines: &[&str]) -> ScanContext {
        context(lines, ScanSettings::default()).0
    }

    fn writer() -> (ScanContext, MemorySink) {
        context(&[], ScanSettings::default())
    }

    fn error_of(result: CResult<Outcome>) -> CError {
        match result {
            Ok(out) => panic!("expected an error, got {out:?}"),
            Err(e) => e.current_context().clone(),
        }
    }

    #[test]
    fn test_write_with_reversion() {
        let (mut ctx, sink) = writer();
        let (mut a, mut b, mut c, mut d) = (1_i32, 2_i32, 3_i32, 4_i32);
        let mut slots = [Slot::from(&mut a), Slot::from(&mut b), Slot::from(&mut c), Slot::from(&mut d)];
        let out = write(&mut ctx, "(I4,I4)", &mut slots).unwrap();
        assert_eq!(out, Outcome { items: 4, values: 4, stop: Stop::Done });
        assert_eq!(sink.texts(), vec!["   1   2", "   3   4"]);

        let (mut ctx, sink) = writer();
        let (mut a, mut b) = (1_i16, 2_i16);
        write(&mut ctx, "'N=' I3", &mut [Slot::from(&mut a), Slot::from(&mut b)]).unwrap();
        assert_eq!(sink.texts(), vec!["N=  1", "N=  2"], "Reversion without a group restarts from the top");
    }

    #[test]
    fn test_list_exhausted() {
        let (mut ctx, sink) = writer();
        let (mut a, mut b, mut c) = (1_i32, 2_i32, 3_i32);
        let out = write(&mut ctx, "(I4,I4)", &mut [Slot::from(&mut a), Slot::from(&mut b), Slot::from(&mut c)]).unwrap();
        assert_eq!(out.stop, Stop::ListExhausted);
        assert_eq!(sink.texts(), vec!["   1   2", "   3"]);

        let (mut ctx, sink) = writer();
        let mut x = 7_u8;
        let out = write(&mut ctx, "I2;'never'", &mut [Slot::from(&mut x)]).unwrap();
        assert_eq!(out.stop, Stop::ListExhausted);
        assert_eq!(sink.texts(), vec![" 7"]);
    }

    #[test]
    fn test_output_positioning() {
        let (mut ctx, sink) = writer();
        write(&mut ctx, "'AB'T6'C'2X'D'", &mut []).unwrap();
        assert_eq!(sink.texts(), vec!["AB   C  D"]);

        let (mut ctx, sink) = writer();
        write(&mut ctx, "'A'3|'B'/'C'", &mut []).unwrap();
        assert_eq!(sink.texts(), vec!["A", "   B", "C"]);

        let (mut ctx, sink) = writer();
        write(&mut ctx, "'A'%'B'", &mut []).unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1.advance, Advance::NewLine);
        assert_eq!((lines[1].0.as_str(), lines[1].1.advance), ("B", Advance::NewPage));
    }

    #[test]
    fn test_buffer_overflow() {
        let (mut ctx, _) = context(&[], ScanSettings::default().record_len(10));
        let mut x = 1_i32;
        let err = error_of(write(&mut ctx, "I20", &mut [Slot::from(&mut x)]));
        assert!(matches!(err, CError::BufferOverflow { capacity: 10, .. }), "got {err:?}");
    }

    #[test]
    fn test_numeric_output() {
        let (mut ctx, sink) = writer();
        let mut raw = 384_i16;
        let mut f = 1.5_f64;
        let mut h = 0x1FF_i32;
        let mut slots = [Slot::from(&mut raw), Slot::from(&mut f), Slot::from(&mut h)];
        write(&mut ctx, "F6.2B8, 2PF7.1, ^1Z3", &mut slots).unwrap();
        assert_eq!(sink.texts(), vec!["  1.50  150.0 FF"]);
    }

    #[test]
    fn test_text_output() {
        let (mut ctx, sink) = writer();
        let mut s = "AB".to_string();
        let mut t = "LONGER".to_string();
        let mut u = t.clone();
        write(&mut ctx, "A5, AJ2, '|', A3", &mut [Slot::from(&mut s), Slot::from(&mut t), Slot::from(&mut u)]).unwrap();
        assert_eq!(sink.texts(), vec!["   ABLONGER  |LON"]);

        let (mut ctx, sink) = writer();
        let mut mask = 0b101_u8;
        write(&mut ctx, "M'RWX'", &mut [Slot::from(&mut mask)]).unwrap();
        assert_eq!(sink.texts(), vec!["RX"]);
    }

    #[test]
    fn test_column_input() {
        let mut ctx = reader(&["  12  -5 3.25    "]);
        let (mut a, mut b, mut c, mut d) = (0_i32, 0_i32, 0.0_f64, 9_i32);
        let out = read(&mut ctx, "I4,I4,F5.2,I4", &mut [Slot::from(&mut a), Slot::from(&mut b), Slot::from(&mut c), Slot::from(&mut d)]).unwrap();
        assert_eq!(out.stop, Stop::Done);
        assert_eq!((a, b, c, d), (12, -5, 3.25, 0), "Blank columns read as zero");

        let mut ctx = reader(&["XX 42"]);
        let mut x = 0_i32;
        read(&mut ctx, "3X,I2", &mut [Slot::from(&mut x)]).unwrap();
        assert_eq!(x, 42);

        let mut ctx = reader(&["1"]);
        let err = error_of(read(&mut ctx, "I", &mut [Slot::from(&mut x)]));
        assert!(matches!(err, CError::BadDirective { .. }), "Column mode needs a width, got {err:?}");
    }

    #[test]
    fn test_input_records() {
        let mut ctx = reader(&["1", "2"]);
        let (mut a, mut b) = (0_u8, 0_u8);
        let out = read(&mut ctx, "I1/I1", &mut [Slot::from(&mut a), Slot::from(&mut b)]).unwrap();
        assert_eq!((a, b, out.stop), (1, 2, Stop::Done));

        let mut ctx = reader(&["1"]);
        let (mut a, mut b) = (0_u8, 0_u8);
        let out = read(&mut ctx, "I1/I1", &mut [Slot::from(&mut a), Slot::from(&mut b)]).unwrap();
        assert_eq!((a, b, out.stop), (1, 0, Stop::EndOfInput));
    }

    #[test]
    fn test_scan_input() {
        let mut ctx = reader(&["1,,3"]);
        let mut v = [9_i32; 3];
        read(&mut ctx, "S,3I", &mut [Slot::from(&mut v)]).unwrap();
        assert_eq!(v, [1, 9, 3], "An empty field leaves the element alone");

        let mut ctx = reader(&["1 2"]);
        let mut v = [0_i32; 3];
        let out = read(&mut ctx, "S,3I", &mut [Slot::from(&mut v)]).unwrap();
        assert_eq!(out, Outcome { items: 0, values: 2, stop: Stop::EndOfCard });
        assert!(ctx.marker().is_pending(Diag::MissingField));

        let mut ctx = reader(&["1 2"]);
        let out = read(&mut ctx, "S,N,3I", &mut [Slot::from(&mut v)]).unwrap();
        assert_eq!(out.stop, Stop::EndOfCard);
        assert!(!ctx.marker().is_pending(Diag::MissingField));

        let mut ctx = reader(&["RATE 12.5, 3"]);
        let (mut rate, mut count) = (0.0_f64, 0_i32);
        read(&mut ctx, "SW1 F I", &mut [Slot::from(&mut rate), Slot::from(&mut count)]).unwrap();
        assert_eq!((rate, count), (12.5, 3));
    }

    #[test]
    fn test_keyword_and_equals_stops() {
        let mut ctx = reader(&["5 7 LIMIT=3"]);
        let mut v = [0_i32; 4];
        let out = read(&mut ctx, "SK,#I", &mut [Slot::from(&mut v)]).unwrap();
        assert_eq!((out.stop, out.values), (Stop::Keyword, 2));
        assert_eq!(v, [5, 7, 0, 0]);
        assert_eq!(scanner::scan(&mut ctx, true).unwrap().text, "LIMIT", "The keyword is pushed back");

        let mut ctx = reader(&["1 2 NEXT=4"]);
        let mut v = [0_i32; 4];
        let out = read(&mut ctx, "S=,#I", &mut [Slot::from(&mut v)]).unwrap();
        assert_eq!(out.stop, Stop::Equals);
        assert_eq!(v, [1, 2, 0, 0]);

        let mut ctx = reader(&["LIMIT=25"]);
        scanner::init_scan(&mut ctx, Skip::Columns(0), ScanOptions::default());
        scanner::scan(&mut ctx, true);
        let mut limit = 0_i64;
        convert_one(&mut ctx, "I", &mut Slot::from(&mut limit)).unwrap();
        assert_eq!(limit, 25);
    }

    #[test]
    fn test_list_counts() {
        let (mut ctx, sink) = writer();
        let (mut n, mut v) = (2_i32, [10_i32, 20, 30]);
        write(&mut ctx, "RI4", &mut [Slot::from(&mut n), Slot::from(&mut v)]).unwrap();
        assert_eq!(sink.texts(), vec!["  10  20"]);

        let (mut ctx, sink) = writer();
        let (mut n, mut skipped, mut x) = (0_i32, [5_i32], 7_i32);
        write(&mut ctx, "R!I4,I4", &mut [Slot::from(&mut n), Slot::from(&mut skipped), Slot::from(&mut x)]).unwrap();
        assert_eq!(sink.texts(), vec!["   7"]);

        let (mut ctx, sink) = writer();
        let (mut n, mut a, mut b) = (2_i32, [1_i32, 2], [3_i32, 4]);
        write(&mut ctx, "R?I4,?I4", &mut [Slot::from(&mut n), Slot::from(&mut a), Slot::from(&mut b)]).unwrap();
        assert_eq!(sink.texts(), vec!["   1   2   3   4"]);

        let (mut ctx, _) = writer();
        let mut x = 1_i32;
        assert!(matches!(error_of(write(&mut ctx, "?I4", &mut [Slot::from(&mut x)])), CError::NoSavedCount));

        let (mut ctx, _) = writer();
        let (mut n, mut x) = (-1_i32, 1_i32);
        assert!(matches!(error_of(write(&mut ctx, "RI4", &mut [Slot::from(&mut n), Slot::from(&mut x)])), CError::BadCount(-1)));
    }

    #[test]
    fn test_brackets() {
        let (mut ctx, sink) = writer();
        let (mut a, mut b) = ([1_i32, 2], [1.5_f64, 2.5]);
        write(&mut ctx, "2<I3,F5.1 =1>", &mut [Slot::from(&mut a), Slot::from(&mut b)]).unwrap();
        assert_eq!(sink.texts(), vec!["  1  1.5  2  2.5"]);

        let (mut ctx, _) = writer();
        let mut a = [1_i32, 2];
        let err = error_of(write(&mut ctx, "3<I3=1>", &mut [Slot::from(&mut a)]));
        assert!(matches!(err, CError::IndexOutOfRange { index: 2, len: 2 }), "got {err:?}");

        let (mut ctx, _) = writer();
        let err = error_of(write(&mut ctx, "<<I3>>", &mut [Slot::from(&mut a)]));
        assert!(matches!(err, CError::NestedBracket));
    }

    #[test]
    fn test_fatal_directive_errors() {
        let (mut ctx, _) = writer();
        let mut x = 1_i32;
        let mut f = 1.0_f32;
        assert!(matches!(error_of(write(&mut ctx, "'X'", &mut [Slot::from(&mut x)])), CError::NoDataDirective));
        assert!(matches!(error_of(write(&mut ctx, "A4", &mut [Slot::from(&mut x)])), CError::SlotMismatch { .. }));
        for (fmt, what) in [("FB4", "float"), ("IB64", "scale"), ("Z4.2", "hex decimals"), ("^3I", "size")] {
            let slot = if what == "float" { Slot::from(&mut f) } else { Slot::from(&mut x) };
            let err = error_of(write(&mut ctx, fmt, &mut [slot]));
            assert!(matches!(err, CError::BadDirective { .. }), "{fmt} should be rejected ({what}), got {err:?}");
        }
        assert!(matches!(error_of(write(&mut ctx, "I4)", &mut [Slot::from(&mut x)])), CError::Format(_)));
    }

    #[test]
    fn test_verify_and_units() {
        let mut ctx = reader(&["-5"]);
        let mut x = 0_i32;
        read(&mut ctx, "S,W>0,I", &mut [Slot::from(&mut x)]).unwrap();
        assert_eq!(x, 1, "A strict bound moves one unit inward");
        assert!(ctx.marker().is_pending(Diag::BelowMinimum));
        assert!(!ctx.failed(), "W only warns");

        let mut ctx = reader(&["KEY 7"]);
        let mut x = 0_i32;
        read(&mut ctx, "S,X,V(,I", &mut [Slot::from(&mut x)]).unwrap();
        assert_eq!(x, 0);
        assert!(ctx.marker().is_pending(Diag::ParenExpected));

        let mut ctx = reader(&["2.5V 1.5"]);
        let (mut mv, mut fixed) = (0_i32, 0_i16);
        read(&mut ctx, "S,I{mV},IB8", &mut [Slot::from(&mut mv), Slot::from(&mut fixed)]).unwrap();
        assert_eq!((mv, fixed), (2500, 384));

        let (mut ctx, _) = context(&["1.5"], ScanSettings::default().compat_scale(1));
        let mut fixed = 0_i16;
        read(&mut ctx, "S,IB8[4]", &mut [Slot::from(&mut fixed)]).unwrap();
        assert_eq!(fixed, 24, "Compatibility level 1 picks the first alternate scale");
    }

    #[test]
    fn test_text_input() {
        let mut ctx = reader(&["'Hi there' RX HELLO RQ"]);
        let mut name = String::new();
        let mut mask = 0_u8;
        let mut handle = 0_u32;
        let mut bad = 3_u8;
        read(&mut ctx, "S,A,M'RWX',C,M'RWX'", &mut [
            Slot::from(&mut name), Slot::from(&mut mask), Slot::from(&mut handle), Slot::from(&mut bad),
        ]).unwrap();
        assert_eq!((name.as_str(), mask, bad), ("Hi there", 0b101, 3));
        assert!(ctx.marker().is_pending(Diag::BadCode));
        assert_eq!(ctx.lookup(handle).as_deref(), Some("HELLO"));

        let sink = MemorySink::new();
        let mut out = ScanContext::new(
            ScanSettings::default().env_fallback(false),
            Box::new(LinesSource::new(Vec::<String>::new())),
            Box::new(sink.clone()),
            Box::new(MemoryTextCache::default())
        );
        let mut id = out.intern("HELLO");
        write(&mut out, "C", &mut [Slot::from(&mut id)]).unwrap();
        assert_eq!(sink.texts(), vec!["HELLO"]);
    }

    #[test]
    fn test_values_fit_the_item() {
        let mut ctx = reader(&["-5 255 3000000000"]);
        let (mut u, mut i, mut wide) = (9_u32, 9_i8, 0_i64);
        read(&mut ctx, "S,I,U,U", &mut [Slot::from(&mut u), Slot::from(&mut i), Slot::from(&mut wide)]).unwrap();
        assert_eq!((u, i), (0, 127), "A value of the other signedness must clamp, not wrap");
        assert_eq!(wide, 3_000_000_000);
        assert!(ctx.marker().is_pending(Diag::NegativeNotAllowed));
        assert!(ctx.marker().is_pending(Diag::Overflow));
        assert!(ctx.failed());
    }

    #[test]
    fn test_scale_factor_limits() {
        let mut ctx = reader(&["1.5"]);
        let mut f = 0.0_f64;
        let err = error_of(read(&mut ctx, "-2147483648P,F", &mut [Slot::from(&mut f)]));
        assert!(matches!(err, CError::Format(_)), "got {err:?}");

        let mut ctx = reader(&["1.5"]);
        read(&mut ctx, "S,64P,F", &mut [Slot::from(&mut f)]).unwrap();
        assert!((f / 1.5e-64 - 1.0).abs() < 1e-12, "got {f}");
    }

    #[test]
    fn test_cache_id_fits_the_item() {
        let mut ctx = reader(&["NEW T0"]);
        for n in 0..255 {
            ctx.intern(&format!("T{n}"));
        }
        let (mut fresh, mut known) = (7_u8, 0_u8);
        read(&mut ctx, "S,C,C", &mut [Slot::from(&mut fresh), Slot::from(&mut known)]).unwrap();
        assert_eq!(fresh, 7, "Id 256 does not fit a byte and must leave the item alone");
        assert_eq!(known, 1);
        assert!(ctx.marker().is_pending(Diag::Overflow));

        let mut ctx = reader(&["NEW"]);
        for n in 0..127 {
            ctx.intern(&format!("T{n}"));
        }
        let mut signed = -1_i8;
        read(&mut ctx, "S,C", &mut [Slot::from(&mut signed)]).unwrap();
        assert_eq!(signed, -1);
        assert!(ctx.marker().is_pending(Diag::Overflow));
    }

    #[test]
    fn test_units_with_adjustment() {
        let mut ctx = reader(&["5mV+OFFS 2V-OFFS 1V+NONE"]);
        assert!(ctx.register_adjustment("OFFS", "1"));
        let (mut a, mut b, mut c) = (0_i32, 0_i32, 0_i32);
        read(&mut ctx, "S,I{mV},I{mV},I{mV}", &mut [Slot::from(&mut a), Slot::from(&mut b), Slot::from(&mut c)]).unwrap();
        assert_eq!((a, b), (6, 1000), "The adjustment is in the units written on the card");
        assert_eq!(c, 0);
        assert!(ctx.failed(), "An unregistered name after the units is still an error");
    }

    #[test]
    fn test_empty_array_item() {
        let (mut ctx, sink) = writer();
        let mut none: [i32; 0] = [];
        let mut x = 7_i32;
        let out = write(&mut ctx, "#I4, I4", &mut [Slot::from(&mut none), Slot::from(&mut x)]).unwrap();
        assert_eq!(out.stop, Stop::Done);
        assert_eq!(sink.texts(), vec!["   7"]);

        let (mut ctx, sink) = writer();
        let mut none: [i32; 0] = [];
        let out = write(&mut ctx, "#I4", &mut [Slot::from(&mut none)]).unwrap();
        assert_eq!((out.items, out.values, out.stop), (1, 0, Stop::Done));
        assert!(sink.texts().is_empty());
    }
}
