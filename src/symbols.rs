//! Variable symbols referenced on cards as `&NAME`.
//!
//! A name is looked up first in the table of the current input unit, then
//! among the built-in pseudo-symbols, then (if allowed) in the process
//! environment. Tables are small, so each unit keeps its definitions in a
//! plain vector and lookups scan it.
use std::collections::HashMap;

use chrono::Local;

use crate::marker::{Diag, Diagnostic};

/// Longest accepted symbol name.
pub const MAX_NAME_LEN: usize = 15;
/// Longest stored symbol value; longer values are truncated.
pub const MAX_VALUE_LEN: usize = 255;

/// The built-in pseudo-symbols, in lookup order.
pub const BUILTINS: [&str; 9] = ["USER", "HOST", "DATE", "TIME", "CPU", "OS", "CMD", "CWD", "COUNT"];

/// Per-unit symbol tables plus the state behind the built-ins.
#[derive(Debug, Default)]
pub struct SymbolTables {
    units: HashMap<u32, Vec<(String, String)>>,
    counter: u64,
    last_command: String,
}

impl SymbolTables {
    /// Define one symbol for `unit`, replacing any earlier value.
    pub fn define(&mut self, unit: u32, name: &str, value: &str) -> Result<(), Diagnostic> {
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Diagnostic::error(Diag::SymbolTooLong).with_detail(name));
        }

        let mut truncated = None;
        let value = if value.chars().count() > MAX_VALUE_LEN {
            truncated = Some(Diagnostic::error(Diag::SymbolTooLong).with_detail(format!("value of {name} truncated")));
            value.chars().take(MAX_VALUE_LEN).collect()
        } else {
            value.to_string()
        };

        tracing::trace!(unit, name = %name, value = %value, "symbol defined");
        let table = self.units.entry(unit).or_default();
        match table.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => table.push((name, value)),
        }

        match truncated {
            Some(d) => Err(d),
            None => Ok(()),
        }
    }

    /// Define a batch of symbols; a later definition of a name wins. Returns
    /// the diagnostics for rejected or truncated entries.
    pub fn define_batch<I, N, V>(&mut self, unit: u32, defs: I) -> Vec<Diagnostic>
    where I: IntoIterator<Item = (N, V)>,
          N: AsRef<str>,
          V: AsRef<str>
    {
        defs.into_iter()
            .filter_map(|(n, v)| self.define(unit, n.as_ref(), v.as_ref()).err())
            .collect()
    }

    /// Drop every definition made for `unit`.
    pub fn release(&mut self, unit: u32) {
        if self.units.remove(&unit).is_some() {
            tracing::debug!(unit, "symbol table released");
        }
    }

    /// The user-defined value of `name` in `unit`, without built-ins or environment.
    pub fn lookup(&self, unit: u32, name: &str) -> Option<&str> {
        let name = name.to_ascii_uppercase();
        self.units.get(&unit)?
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Resolve `name` through the full lookup order.
    pub fn resolve(&mut self, unit: u32, name: &str, env_fallback: bool) -> Option<String> {
        if let Some(v) = self.lookup(unit, name) {
            return Some(v.to_string());
        }
        let upper = name.to_ascii_uppercase();
        if let Some(v) = self.builtin(&upper) {
            return Some(v);
        }
        if env_fallback {
            return std::env::var(name).or_else(|_| std::env::var(&upper)).ok();
        }
        None
    }

    /// Record the text of the most recent command card, for `&CMD`.
    pub fn set_last_command(&mut self, text: &str) {
        self.last_command = text.to_string();
    }

    /// Current value of the per-run counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub(crate) fn reset_counter(&mut self) {
        self.counter = 0;
    }

    fn builtin(&mut self, name: &str) -> Option<String> {
        let value = match name {
            "USER" => std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_else(|_| "unknown".to_string()),
            "HOST" => host_name(),
            "DATE" => Local::now().format("%Y/%m/%d").to_string(),
            "TIME" => Local::now().format("%H:%M:%S").to_string(),
            "CPU" => std::env::consts::ARCH.to_string(),
            "OS" => std::env::consts::OS.to_string(),
            "CMD" => self.last_command.clone(),
            "CWD" => std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
            "COUNT" => {
                self.counter += 1;
                self.counter.to_string()
            },
            _ => return None,
        };
        Some(value)
    }
}

fn host_name() -> String {
    if let Ok(h) = std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")) {
        return h;
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_lookup() {
        let mut tables = SymbolTables::default();
        let diags = tables.define_batch(1, [("name", "42"), ("Other", "x"), ("NAME", "43")]);
        assert!(diags.is_empty());
        assert_eq!(tables.lookup(1, "NAME"), Some("43"), "The last definition in a batch should win");
        assert_eq!(tables.lookup(1, "other"), Some("x"));
        assert_eq!(tables.lookup(2, "NAME"), None, "Symbols belong to one unit");

        tables.release(1);
        assert_eq!(tables.lookup(1, "NAME"), None);
    }

    #[test]
    fn test_length_limits() {
        let mut tables = SymbolTables::default();
        let err = tables.define(0, "A_VERY_LONG_NAME_X", "1").unwrap_err();
        assert_eq!(err.code, Diag::SymbolTooLong);
        assert_eq!(tables.lookup(0, "A_VERY_LONG_NAME_X"), None);

        let long = "v".repeat(300);
        let err = tables.define(0, "LONG", &long).unwrap_err();
        assert_eq!(err.code, Diag::SymbolTooLong);
        assert_eq!(tables.lookup(0, "LONG").map(|v| v.len()), Some(MAX_VALUE_LEN));
    }

    #[test]
    fn test_builtins() {
        let mut tables = SymbolTables::default();
        let date = tables.resolve(0, "DATE", false).unwrap();
        assert_eq!(date.len(), 10);
        assert_eq!(&date[4..5], "/");
        let time = tables.resolve(0, "time", false).unwrap();
        assert_eq!(time.len(), 8);

        assert_eq!(tables.resolve(0, "COUNT", false).as_deref(), Some("1"));
        assert_eq!(tables.resolve(0, "COUNT", false).as_deref(), Some("2"));

        tables.set_last_command("RUN 5");
        assert_eq!(tables.resolve(0, "CMD", false).as_deref(), Some("RUN 5"));

        tables.define(0, "OS", "mine").unwrap();
        assert_eq!(tables.resolve(0, "OS", false).as_deref(), Some("mine"), "User symbols shadow built-ins");
    }

    #[test]
    fn test_environment_fallback() {
        std::env::set_var("CARDFMT_TEST_SYMBOL", "from env");
        let mut tables = SymbolTables::default();
        assert_eq!(tables.resolve(0, "CARDFMT_TEST_SYMBOL", true).as_deref(), Some("from env"));
        assert_eq!(tables.resolve(0, "CARDFMT_TEST_SYMBOL", false), None);
        assert_eq!(tables.resolve(0, "CARDFMT_NOT_SET_ANYWHERE", true), None);
    }
}
