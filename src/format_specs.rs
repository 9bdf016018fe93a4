//! Represent format programs as Rust types.
//!
//! A format string such as `"SW1 3I8 F.2{mV} 'end'"` is parsed into a
//! [`FormatProgram`] with its `parse` method:
//!
//! ```
//! # use cardfmt::format_specs::{FormatProgram, Directive};
//! let fp = FormatProgram::parse("SW1 3I8 F.2{mV}").unwrap();
//! assert_eq!(fp.directives().len(), 3);
//! assert!(matches!(fp.directives()[0], Directive::Scan { words: true, skip: 1 }));
//! ```
//!
//! Parsing only checks the grammar. Whether a directive makes sense for the
//! item it is applied to (a binary scale on a float, decimals on a hex field)
//! is decided by the [interpreter](crate::interp) when it gets there, since
//! format strings are parsed afresh on every call and never kept.
use std::fmt::Display;

use pest::{Parser, iterators::Pair, RuleType};
use pest::error::LineColLocation;

use crate::codec::{Decimals, MAX_DECIMAL_SCALE};
use crate::range::{Cmp, RangeSpec};

type PResult<T> = std::result::Result<T, PError>;

/// Represents an error in parsing a format string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PError {
    /// 1-based column in the format string.
    pub column: usize,
    pub message: String,
}

impl PError {
    fn new<S: Into<String>>(column: usize, message: S) -> Self {
        Self { column, message: message.into() }
    }
}

impl <R: RuleType> From<pest::error::Error<R>> for PError {
    fn from(value: pest::error::Error<R>) -> Self {
        let column = match value.line_col {
            LineColLocation::Pos((_, c)) => c,
            LineColLocation::Span((_, c), _) => c,
        };
        Self { column, message: value.variant.message().into_owned() }
    }
}

impl Display for PError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column {}: {}", self.column, self.message)
    }
}

#[derive(Parser)]
#[grammar = "card.pest"]
pub(crate) struct CardParser;

/// Where the repeat count of a conversion or group comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// A literal count; 1 when none is written.
    Count(u32),
    /// `R`: taken from the next item.
    List,
    /// `R?`: taken from the next item and saved for `?`.
    ListSave,
    /// `R!`: taken from the next item; zero also skips the data item.
    ListSkip,
    /// `?`: the count saved by the last `R?`.
    Saved,
    /// `#`: every remaining element of the current array item.
    Remaining,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Count(1)
    }
}

/// Which kind of conversion a directive performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvKind {
    /// `I`: signed decimal
    Int,
    /// `U`: unsigned decimal
    Unsigned,
    /// `Z`: hexadecimal
    Hex,
    /// `O`: octal
    Octal,
    /// `F`: fixed-form decimal
    Fixed,
    /// `E`: exponential-form decimal
    Exp,
    /// `A`: text
    Alpha,
    /// `C`: text-cache handle
    Cache,
    /// `M'codes'`: bit `i` set for the `i`-th code letter
    Mask(String),
}

impl ConvKind {
    /// `true` for the kinds that go through the numeric codec.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ConvKind::Alpha | ConvKind::Cache | ConvKind::Mask(_))
    }
}

impl Display for ConvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvKind::Int => write!(f, "I"),
            ConvKind::Unsigned => write!(f, "U"),
            ConvKind::Hex => write!(f, "Z"),
            ConvKind::Octal => write!(f, "O"),
            ConvKind::Fixed => write!(f, "F"),
            ConvKind::Exp => write!(f, "E"),
            ConvKind::Alpha => write!(f, "A"),
            ConvKind::Cache => write!(f, "C"),
            ConvKind::Mask(codes) => write!(f, "M'{codes}'"),
        }
    }
}

/// One conversion directive with all of its modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub kind: ConvKind,
    pub repeat: Repeat,
    pub width: Option<u32>,
    /// The width was written with a leading zero.
    pub zero_pad: bool,
    pub decimals: Decimals,
    /// Binary scale from `Bn`.
    pub bscale: Option<u32>,
    /// Alternate binary scales from `Bn[a b c]`, picked by the compatibility setting.
    pub alternates: Vec<u32>,
    /// Left-justification gap from `J[g]`.
    pub justify: Option<u32>,
    pub units: Option<String>,
    /// The directive as written, for error messages.
    pub text: String,
}

/// Where a verified field must sit relative to parentheses on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParenRule {
    #[default]
    Any,
    /// `V(`: inside parentheses
    InParens,
    /// `V)`: outside parentheses
    Outside,
    /// `V()`: inside a group opened before an earlier field
    Within,
}

/// A `V` or `W` directive: range tests and placement rule for the next conversion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verify {
    pub paren: ParenRule,
    pub range: RangeSpec,
}

/// One directive of a format program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Literal(String),
    /// `nX`
    Skip(u32),
    /// `kP`
    Scale(i32),
    /// `^n`: item size in bytes for the next conversion
    Size(u32),
    Convert(Conversion),
    Group { repeat: Repeat, body: Vec<Directive> },
    Bracket { repeat: Repeat, body: Vec<Directive>, stride: u32 },
    /// `/`
    Record,
    /// `%`
    Page,
    /// `n|`
    Indent(u32),
    /// `Tn`, 1-based
    Column(u32),
    /// `;`
    StopIfDone,
    /// `S[W][n]`
    Scan { words: bool, skip: u32 },
    /// `K`
    Keyword,
    /// `=`
    Equals,
    /// `N`
    NotRequired,
    Verify(Verify),
}

impl Directive {
    /// `true` if the directive converts items itself or contains a conversion.
    pub fn has_conversion(&self) -> bool {
        match self {
            Directive::Convert(_) => true,
            Directive::Group { body, .. } | Directive::Bracket { body, .. } => body.iter().any(|d| d.has_conversion()),
            _ => false,
        }
    }
}

/// A parsed format string
///
/// ```
/// # use cardfmt::format_specs::FormatProgram;
/// let fp = FormatProgram::parse("(I4, 2X, F8.3B16)").unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProgram {
    pub(crate) directives: Vec<Directive>
}

impl FormatProgram {
    /// Parse a format string and return a `FormatProgram` instance.
    ///
    /// Letters are case-insensitive, and directives may be separated by
    /// commas, blanks or nothing at all. Returns an error if the format
    /// string has invalid syntax.
    pub fn parse(fmt_str: &str) -> PResult<Self> {
        let tree = CardParser::parse(Rule::format, fmt_str)?
            .next()
            .ok_or_else(|| PError::new(1, "empty parse tree"))?;

        let mut directives = vec![];
        for pair in tree.into_inner() {
            if let Rule::seq = pair.as_rule() {
                directives = parse_seq(pair)?;
            }
        }
        Ok(Self { directives })
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Consume the `FormatProgram` instance and return the inner `Vec<Directive>`.
    pub fn into_directives(self) -> Vec<Directive> {
        self.directives
    }

    /// Index of the directive that reversion restarts from: the last
    /// top-level group, or the start.
    pub fn restart_index(&self) -> usize {
        self.directives.iter()
            .rposition(|d| matches!(d, Directive::Group { .. } | Directive::Bracket { .. }))
            .unwrap_or(0)
    }
}

fn column_of(pair: &Pair<Rule>) -> usize {
    pair.as_span().start() + 1
}

fn parse_seq(pair: Pair<Rule>) -> PResult<Vec<Directive>> {
    pair.into_inner().map(parse_directive).collect()
}

fn parse_directive(pair: Pair<Rule>) -> PResult<Directive> {
    let column = column_of(&pair);
    let rule = pair.as_rule();
    let mut stack: Vec<_> = pair.clone().into_inner().rev().collect();

    let directive = match rule {
        Rule::literal => {
            let inner = stack.pop().ok_or_else(|| PError::new(column, "literal without text"))?;
            let text = match inner.as_rule() {
                Rule::dq_text => inner.as_str().replace("\"\"", "\""),
                _ => inner.as_str().replace("''", "'"),
            };
            Directive::Literal(text)
        },
        Rule::group => {
            let repeat = consume_repeat(&mut stack)?;
            let body = consume_seq(&mut stack)?;
            Directive::Group { repeat, body }
        },
        Rule::bracket => {
            let repeat = consume_repeat(&mut stack)?;
            let body = consume_seq(&mut stack)?;
            let stride = match stack.pop() {
                Some(s) if s.as_rule() == Rule::stride => {
                    let mut inner: Vec<_> = s.into_inner().rev().collect();
                    consume_uint(&mut inner)?.unwrap_or(1)
                },
                _ => 1,
            };
            Directive::Bracket { repeat, body, stride }
        },
        Rule::skip => Directive::Skip(consume_uint(&mut stack)?.unwrap_or(1)),
        Rule::indent => Directive::Indent(consume_uint(&mut stack)?.unwrap_or(0)),
        Rule::scale => {
            let k = consume_signed(&mut stack)?.ok_or_else(|| PError::new(column, "scale factor missing"))?;
            if k.unsigned_abs() > MAX_DECIMAL_SCALE {
                return Err(PError::new(column, format!("scale factor {k} is outside -{MAX_DECIMAL_SCALE} to {MAX_DECIMAL_SCALE}")));
            }
            Directive::Scale(k)
        },
        Rule::size => {
            let n = consume_uint(&mut stack)?.ok_or_else(|| PError::new(column, "item size missing"))?;
            Directive::Size(n)
        },
        Rule::column => {
            let n = consume_uint(&mut stack)?.ok_or_else(|| PError::new(column, "column missing"))?;
            Directive::Column(n)
        },
        Rule::scan => {
            let words = consume_flag(&mut stack, Rule::words);
            let skip = consume_uint(&mut stack)?.unwrap_or(0);
            Directive::Scan { words, skip }
        },
        Rule::conversion => Directive::Convert(parse_conversion(pair)?),
        Rule::verify => Directive::Verify(parse_verify(pair)?),
        Rule::record => Directive::Record,
        Rule::page => Directive::Page,
        Rule::stop => Directive::StopIfDone,
        Rule::keyword => Directive::Keyword,
        Rule::equals => Directive::Equals,
        Rule::notreq => Directive::NotRequired,
        other => return Err(PError::new(column, format!("unexpected {other:?} in directive list"))),
    };
    Ok(directive)
}

fn parse_conversion(pair: Pair<Rule>) -> PResult<Conversion> {
    let column = column_of(&pair);
    let text = pair.as_str().to_string();
    let mut stack: Vec<_> = pair.into_inner().rev().collect();

    let repeat = consume_repeat(&mut stack)?;
    let kind_pair = stack.pop()
        .and_then(|p| p.into_inner().next())
        .ok_or_else(|| PError::new(column, "conversion letter missing"))?;
    let kind = match kind_pair.as_rule() {
        Rule::int_conv => ConvKind::Int,
        Rule::uint_conv => ConvKind::Unsigned,
        Rule::hex_conv => ConvKind::Hex,
        Rule::oct_conv => ConvKind::Octal,
        Rule::fix_conv => ConvKind::Fixed,
        Rule::exp_conv => ConvKind::Exp,
        Rule::alpha_conv => ConvKind::Alpha,
        Rule::cache_conv => ConvKind::Cache,
        Rule::mask_conv => {
            let codes = kind_pair.into_inner().next().map(|c| c.as_str().to_string()).unwrap_or_default();
            ConvKind::Mask(codes)
        },
        other => return Err(PError::new(column, format!("unexpected {other:?} as conversion letter"))),
    };

    let (width, zero_pad) = consume_width(&mut stack)?;
    let decimals = consume_decimals(&mut stack)?;
    let (bscale, alternates) = consume_bscale(&mut stack)?;
    let justify = consume_justify(&mut stack)?;
    let units = consume_units(&mut stack);

    Ok(Conversion { kind, repeat, width, zero_pad, decimals, bscale, alternates, justify, units, text })
}

fn parse_verify(pair: Pair<Rule>) -> PResult<Verify> {
    let mut range = RangeSpec::default();
    let mut paren = ParenRule::Any;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::verify_err => {},
            Rule::verify_warn => range = range.warn_only(),
            Rule::paren_rule => {
                paren = match inner.into_inner().next().map(|p| p.as_rule()) {
                    Some(Rule::paren_within) => ParenRule::Within,
                    Some(Rule::paren_out) => ParenRule::Outside,
                    _ => ParenRule::InParens,
                };
            },
            Rule::test => range = parse_test(inner, range)?,
            _ => {},
        }
    }
    Ok(Verify { paren, range })
}

fn parse_test(pair: Pair<Rule>, range: RangeSpec) -> PResult<RangeSpec> {
    let column = column_of(&pair);
    let mut stack: Vec<_> = pair.into_inner().rev().collect();
    let first = stack.pop().ok_or_else(|| PError::new(column, "empty test"))?;
    let range = match first.as_rule() {
        Rule::nonzero => range.nonzero(),
        Rule::adjust => {
            let name = first.into_inner().next().map(|n| n.as_str().to_string()).unwrap_or_default();
            range.adjust(name)
        },
        Rule::cmp => {
            let cmp = match first.as_str() {
                ">=" => Cmp::Ge,
                "<=" => Cmp::Le,
                ">" => Cmp::Gt,
                _ => Cmp::Lt,
            };
            let bound = stack.pop().ok_or_else(|| PError::new(column, "comparison without a bound"))?;
            range.test(cmp, bound.as_str())
        },
        other => return Err(PError::new(column, format!("unexpected {other:?} in test"))),
    };
    Ok(range)
}

fn parse_u32(pair: &Pair<Rule>) -> PResult<u32> {
    pair.as_str().parse().map_err(|_| PError::new(column_of(pair), format!("{} is too large", pair.as_str())))
}

fn consume_flag(stack: &mut Vec<Pair<Rule>>, rule: Rule) -> bool {
    if stack.last().map(|p| p.as_rule() == rule).unwrap_or(false) {
        stack.pop();
        true
    } else {
        false
    }
}

fn consume_uint(stack: &mut Vec<Pair<Rule>>) -> PResult<Option<u32>> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::uint => {
            let v = parse_u32(p)?;
            stack.pop();
            Ok(Some(v))
        },
        _ => Ok(None),
    }
}

fn consume_signed(stack: &mut Vec<Pair<Rule>>) -> PResult<Option<i32>> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::int => {
            let v = p.as_str().parse()
                .map_err(|_| PError::new(column_of(p), format!("{} is too large", p.as_str())))?;
            stack.pop();
            Ok(Some(v))
        },
        _ => Ok(None),
    }
}

fn consume_repeat(stack: &mut Vec<Pair<Rule>>) -> PResult<Repeat> {
    let Some(p) = stack.last() else { return Ok(Repeat::default()) };
    if p.as_rule() != Rule::rep {
        return Ok(Repeat::default());
    }
    let column = column_of(p);
    let inner = stack.pop()
        .and_then(|p| p.into_inner().next())
        .ok_or_else(|| PError::new(column, "empty repeat count"))?;
    let repeat = match inner.as_rule() {
        Rule::count => Repeat::Count(parse_u32(&inner)?),
        Rule::list_save => Repeat::ListSave,
        Rule::list_skip => Repeat::ListSkip,
        Rule::list => Repeat::List,
        Rule::saved => Repeat::Saved,
        _ => Repeat::Remaining,
    };
    Ok(repeat)
}

fn consume_seq(stack: &mut Vec<Pair<Rule>>) -> PResult<Vec<Directive>> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::seq => {
            let seq = stack.pop().ok_or_else(|| PError::new(1, "sequence vanished"))?;
            parse_seq(seq)
        },
        _ => Ok(vec![]),
    }
}

fn consume_width(stack: &mut Vec<Pair<Rule>>) -> PResult<(Option<u32>, bool)> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::width => {
            let w = parse_u32(p)?;
            let zero_pad = p.as_str().len() > 1 && p.as_str().starts_with('0');
            stack.pop();
            Ok((Some(w), zero_pad))
        },
        _ => Ok((None, false)),
    }
}

fn consume_decimals(stack: &mut Vec<Pair<Rule>>) -> PResult<Decimals> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::decimals => {
            let inner = p.clone().into_inner().next();
            stack.pop();
            match inner {
                Some(d) if d.as_rule() == Rule::uint => {
                    let n = parse_u32(&d)?;
                    if n > MAX_DECIMAL_SCALE {
                        return Err(PError::new(column_of(&d), format!("{n} decimals is more than {MAX_DECIMAL_SCALE}")));
                    }
                    Ok(Decimals::Fixed(n))
                },
                _ => Ok(Decimals::Auto),
            }
        },
        _ => Ok(Decimals::None),
    }
}

fn consume_bscale(stack: &mut Vec<Pair<Rule>>) -> PResult<(Option<u32>, Vec<u32>)> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::bscale => {
            let mut inner: Vec<_> = p.clone().into_inner().rev().collect();
            stack.pop();
            let scale = consume_uint(&mut inner)?;
            let mut alternates = vec![];
            if let Some(alts) = inner.pop() {
                for a in alts.into_inner() {
                    alternates.push(parse_u32(&a)?);
                }
            }
            Ok((scale, alternates))
        },
        _ => Ok((None, vec![])),
    }
}

fn consume_justify(stack: &mut Vec<Pair<Rule>>) -> PResult<Option<u32>> {
    match stack.last() {
        Some(p) if p.as_rule() == Rule::justify => {
            let mut inner: Vec<_> = p.clone().into_inner().rev().collect();
            stack.pop();
            Ok(Some(consume_uint(&mut inner)?.unwrap_or(1)))
        },
        _ => Ok(None),
    }
}

fn consume_units(stack: &mut Vec<Pair<Rule>>) -> Option<String> {
    if let Rule::units = stack.last()?.as_rule() {
        let p = stack.pop()?;
        p.into_inner().next().map(|t| t.as_str().to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(fmt: &str) -> Conversion {
        match FormatProgram::parse(fmt).map(|p| p.into_directives()) {
            Ok(mut v) if v.len() == 1 => match v.remove(0) {
                Directive::Convert(c) => c,
                other => panic!("Parsing '{fmt}' gave {other:?}, not a conversion"),
            },
            other => panic!("Parsing '{fmt}' gave {other:?}"),
        }
    }

    #[test]
    fn test_surrounding_whitespace() -> PResult<()> {
        FormatProgram::parse(" I8 ")?;
        FormatProgram::parse("\tI8,\t")?;
        FormatProgram::parse("")?;
        Ok(())
    }

    #[test]
    fn test_separators() -> PResult<()> {
        let a = FormatProgram::parse("I4,F8.2 A")?;
        let b = FormatProgram::parse("I4F8.2A")?;
        assert_eq!(a, b, "Commas and blanks between directives should be optional");
        assert_eq!(a.directives().len(), 3);
        Ok(())
    }

    #[test]
    fn test_numeric_modifiers() {
        let c = conv("3F10.4B16J2{mV}");
        assert_eq!(c.kind, ConvKind::Fixed);
        assert_eq!(c.repeat, Repeat::Count(3));
        assert_eq!(c.width, Some(10));
        assert_eq!(c.decimals, Decimals::Fixed(4));
        assert_eq!(c.bscale, Some(16));
        assert_eq!(c.justify, Some(2));
        assert_eq!(c.units.as_deref(), Some("mV"));
        assert_eq!(c.text, "3F10.4B16J2{mV}");

        let c = conv("i08");
        assert_eq!((c.kind, c.width, c.zero_pad), (ConvKind::Int, Some(8), true), "Lower case and a zero-padded width");

        let c = conv("E.*");
        assert_eq!((c.width, c.decimals), (None, Decimals::Auto));

        let c = conv("UB8[6 4 2]J");
        assert_eq!((c.bscale, c.alternates.clone(), c.justify), (Some(8), vec![6, 4, 2], Some(1)));
    }

    #[test]
    fn test_repeat_forms() {
        assert_eq!(conv("RI").repeat, Repeat::List);
        assert_eq!(conv("R?I").repeat, Repeat::ListSave);
        assert_eq!(conv("R!I").repeat, Repeat::ListSkip);
        assert_eq!(conv("?I").repeat, Repeat::Saved);
        assert_eq!(conv("#Z").repeat, Repeat::Remaining);
        assert_eq!(conv("A").repeat, Repeat::Count(1));
    }

    #[test]
    fn test_text_kinds() {
        assert_eq!(conv("A12J").kind, ConvKind::Alpha);
        assert_eq!(conv("C8").kind, ConvKind::Cache);
        assert_eq!(conv("M'RWX'3").kind, ConvKind::Mask("RWX".to_string()));
    }

    #[test]
    fn test_literals() -> PResult<()> {
        let v = FormatProgram::parse("'it''s', \"say \"\"hi\"\"\"")?.into_directives();
        assert_eq!(v, vec![
            Directive::Literal("it's".to_string()),
            Directive::Literal("say \"hi\"".to_string()),
        ]);
        Ok(())
    }

    #[test]
    fn test_positioning() -> PResult<()> {
        let v = FormatProgram::parse("3X X -2P ^2 T10 4| | / % ;")?.into_directives();
        assert_eq!(v, vec![
            Directive::Skip(3), Directive::Skip(1), Directive::Scale(-2), Directive::Size(2),
            Directive::Column(10), Directive::Indent(4), Directive::Indent(0),
            Directive::Record, Directive::Page, Directive::StopIfDone,
        ]);
        Ok(())
    }

    #[test]
    fn test_input_directives() -> PResult<()> {
        let v = FormatProgram::parse("SW2 S S5 K = N")?.into_directives();
        assert_eq!(v, vec![
            Directive::Scan { words: true, skip: 2 },
            Directive::Scan { words: false, skip: 0 },
            Directive::Scan { words: false, skip: 5 },
            Directive::Keyword, Directive::Equals, Directive::NotRequired,
        ]);
        Ok(())
    }

    #[test]
    fn test_verify() -> PResult<()> {
        let v = FormatProgram::parse("W>0<=10.5~ I")?.into_directives();
        let expected = RangeSpec::default().warn_only().test(Cmp::Gt, "0").test(Cmp::Le, "10.5").nonzero();
        assert_eq!(v[0], Directive::Verify(Verify { paren: ParenRule::Any, range: expected }));

        let v = FormatProgram::parse("V(@OFFSET F")?.into_directives();
        let expected = RangeSpec::default().adjust("OFFSET");
        assert_eq!(v[0], Directive::Verify(Verify { paren: ParenRule::InParens, range: expected }));

        let v = FormatProgram::parse("V() I V) I")?.into_directives();
        assert!(matches!(&v[0], Directive::Verify(Verify { paren: ParenRule::Within, .. })));
        assert!(matches!(&v[2], Directive::Verify(Verify { paren: ParenRule::Outside, .. })));
        Ok(())
    }

    #[test]
    fn test_groups() -> PResult<()> {
        let v = FormatProgram::parse("A8, 2(I4, 1X), R<F, I =3>")?.into_directives();
        assert_eq!(v.len(), 3);
        match &v[1] {
            Directive::Group { repeat, body } => {
                assert_eq!(*repeat, Repeat::Count(2));
                assert_eq!(body.len(), 2);
            },
            other => panic!("Expected a group, got {other:?}"),
        }
        match &v[2] {
            Directive::Bracket { repeat, body, stride } => {
                assert_eq!((*repeat, body.len(), *stride), (Repeat::List, 2, 3));
            },
            other => panic!("Expected a bracket group, got {other:?}"),
        }
        assert!(v[2].has_conversion());

        let fp = FormatProgram::parse("'x' (I) 'y' (F) 'z'")?;
        assert_eq!(fp.restart_index(), 3);
        let fp = FormatProgram::parse("I, F")?;
        assert_eq!(fp.restart_index(), 0);
        Ok(())
    }

    #[test]
    fn test_equals_versus_stride() -> PResult<()> {
        let v = FormatProgram::parse("<I = 2>")?.into_directives();
        assert!(matches!(&v[0], Directive::Bracket { stride: 2, body, .. } if body.len() == 1));
        let v = FormatProgram::parse("<I => ")?.into_directives();
        assert!(matches!(&v[0], Directive::Bracket { stride: 1, body, .. } if body.len() == 2));
        Ok(())
    }

    #[test]
    fn test_errors() {
        for bad in ["I8.", "(I4", "I4)", "'open", "Q", "3", "F8.2B", "M'AB", "<I =", "{mV}"] {
            let e = FormatProgram::parse(bad);
            assert!(e.is_err(), "Parsing '{bad}' did not return an error");
        }

        let e = FormatProgram::parse("I4, Q").unwrap_err();
        assert_eq!(e.column, 5, "The error should point at the bad directive");

        let e = FormatProgram::parse("99999999999X").unwrap_err();
        assert!(e.message.contains("too large"));
    }

    #[test]
    fn test_scale_limits() -> PResult<()> {
        FormatProgram::parse("64P, -64P, F.64")?;
        for bad in ["-2147483648P, F", "65P", "-65P", "F10.65", "I.1000000"] {
            let e = FormatProgram::parse(bad);
            assert!(e.is_err(), "Parsing '{bad}' should fail on an out-of-range scale");
        }
        Ok(())
    }
}
