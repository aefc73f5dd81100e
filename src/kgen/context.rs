//! A statement-oriented kernel source writer.
//!
//! A context is created either *counting* (null-output mode, used by the
//! two-phase generator contract to report the required buffer size
//! without producing text) or *buffered* with an optional byte budget.
//! Exceeding the budget fails with [`KgenError::Overflow`]; everything
//! already emitted stays valid.

use super::{KgenError, Result};

const INDENT: &str = "    ";

/// Source writer with brace-tracking indentation and last-declared
/// function bookkeeping.
#[derive(Debug)]
pub struct KgenContext {
    out: Option<String>,
    limit: usize,
    size: usize,
    fmt: bool,
    depth: usize,
    last_func: Option<String>,
}

impl KgenContext {
    /// A buffered context. `limit` bounds the total emitted bytes;
    /// `None` leaves it unbounded.
    pub fn new(limit: Option<usize>) -> KgenContext {
        KgenContext {
            out: Some(String::with_capacity(limit.unwrap_or(4096).min(1 << 20))),
            limit: limit.unwrap_or(usize::MAX),
            size: 0,
            fmt: true,
            depth: 0,
            last_func: None,
        }
    }

    /// A counting-only context: tracks the size every statement would
    /// occupy but stores nothing.
    pub fn new_counting() -> KgenContext {
        KgenContext {
            out: None,
            limit: usize::MAX,
            size: 0,
            fmt: true,
            depth: 0,
            last_func: None,
        }
    }

    fn put(&mut self, text: &str) -> Result<()> {
        if self.size + text.len() > self.limit {
            return Err(KgenError::Overflow);
        }
        self.size += text.len();
        if let Some(ref mut buf) = self.out {
            buf.push_str(text);
        }
        Ok(())
    }

    fn put_line(&mut self, line: &str) -> Result<()> {
        if self.fmt && !line.is_empty() {
            for _ in 0..self.depth {
                self.put(INDENT)?;
            }
        }
        self.put(line)?;
        self.put("\n")
    }

    /// Emits a statement. Multi-line statements are indented per line at
    /// the current nesting depth.
    pub fn add_stmt(&mut self, stmt: &str) -> Result<()> {
        for line in stmt.trim_end_matches('\n').split('\n') {
            self.put_line(line)?;
        }
        Ok(())
    }

    pub fn add_blank_line(&mut self) -> Result<()> {
        self.put("\n")
    }

    /// Emits a function declaration header and records the function name
    /// for [`KgenContext::last_func_name`].
    pub fn declare_function(&mut self, decl: &str) -> Result<()> {
        if let Some(name) = parse_func_name(decl) {
            self.last_func = Some(name);
        }
        self.add_stmt(decl)
    }

    /// Opens a braced block, optionally with a statement head
    /// (`for (...)`, `if (...)`, a function signature, ...).
    pub fn begin_branch(&mut self, head: Option<&str>) -> Result<()> {
        match head {
            Some(head) => self.put_line(&format!("{} {{", head))?,
            None => self.put_line("{")?,
        }
        self.depth += 1;
        Ok(())
    }

    pub fn end_branch(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(KgenError::InvalidArg);
        }
        self.depth -= 1;
        self.put_line("}")
    }

    /// Total bytes emitted (or counted) so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The generated source, or `None` in counting mode.
    pub fn source(&self) -> Option<&str> {
        self.out.as_deref()
    }

    pub fn into_source(self) -> Option<String> {
        self.out
    }

    /// Name of the most recently declared function.
    pub fn last_func_name(&self) -> Option<&str> {
        self.last_func.as_deref()
    }
}

/// Extracts the identifier preceding the first `(` of a declaration.
fn parse_func_name(decl: &str) -> Option<String> {
    let head = decl.split('(').next()?;
    let name = head
        .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
