//! Named groups of open lines with batched operations.
use crate::error::Error;
use crate::line::Line;
use std::collections::HashMap;

/// Maps logical names (e.g. `power-led`) to open [`Line`]s.
///
/// Batched operations process every entry and report the first error
/// encountered.
#[derive(Default)]
pub struct LineGroup {
    lines: HashMap<String, Line>,
}

impl LineGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, line: Line) {
        self.lines.insert(name.into(), line);
    }

    pub fn get(&self, name: &str) -> Option<&Line> {
        self.lines.get(name)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lines.keys().map(String::as_str)
    }

    /// Set one named line.
    pub fn set(&self, name: &str, value: u8) -> Result<(), Error> {
        self.lines
            .get(name)
            .ok_or_else(|| Error::LineNotFound(name.to_string()))?
            .set_value(value)
    }

    /// Set every listed line. All entries are attempted; the first error
    /// is returned.
    pub fn set_all(&self, values: &[(&str, u8)]) -> Result<(), Error> {
        let mut first_err = None;
        for (name, value) in values {
            if let Err(e) = self.set(name, *value) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read every line in the group. All entries are attempted; values read
    /// so far are kept alongside the first error.
    pub fn get_all(&self) -> (HashMap<String, u8>, Option<Error>) {
        let mut values = HashMap::new();
        let mut first_err = None;
        for (name, line) in &self.lines {
            match line.get_value() {
                Ok(v) => {
                    values.insert(name.clone(), v);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        (values, first_err)
    }

    /// Close every line in the group. All entries are attempted.
    pub fn close_all(&mut self) -> Result<(), Error> {
        let mut first_err = None;
        for line in self.lines.values() {
            if let Err(e) = line.close() {
                first_err.get_or_insert(e);
            }
        }
        self.lines.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
