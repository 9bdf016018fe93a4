//! Scan free-form control cards and convert their fields to and from typed
//! binary values.
//!
//! A program driven by control cards usually does three things with each
//! card: split it into fields ([`scanner`]), match leading words against a
//! table of keywords ([`keywords`]), and convert the values that follow into
//! integers, fixed-point numbers, floats or text under the control of a small
//! FORMAT-like language ([`interp`], grammar in [`format_specs`]). All of the
//! mutable state lives in one [`context::ScanContext`]:
//!
//! ```
//! use cardfmt::context::{ScanContext, ScanSettings};
//! use cardfmt::collab::{LinesSource, MemorySink, MemoryTextCache};
//! use cardfmt::interp;
//! use cardfmt::slots::Slot;
//!
//! let sink = MemorySink::new();
//! let mut ctx = ScanContext::new(
//!     ScanSettings::default(),
//!     Box::new(LinesSource::from_text("RATE 12.5, 3")),
//!     Box::new(sink.clone()),
//!     Box::new(MemoryTextCache::default()),
//! );
//! ctx.next_card();
//!
//! let mut rate = 0.0_f64;
//! let mut count = 0_i32;
//! interp::read(&mut ctx, "SW1 F I", &mut [Slot::from(&mut rate), Slot::from(&mut count)]).unwrap();
//! assert_eq!((rate, count), (12.5, 3));
//! ```
extern crate pest;
#[macro_use]
extern crate pest_derive;
pub mod card_error;
pub mod codec;
pub mod collab;
pub mod context;
pub mod format_specs;
pub mod interp;
pub mod keywords;
pub mod marker;
pub mod range;
pub mod scanner;
pub mod slots;
pub mod symbols;
pub mod units;
