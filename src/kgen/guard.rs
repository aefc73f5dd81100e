//! Duplicate-helper guard for kernel generation.
//!
//! Several call sites within one generated program may need the same
//! helper function (a tile fetch, a complex multiply wrapper). The guard
//! remembers every pattern it has generated for and hands back the
//! recorded function name instead of emitting a second copy.

use super::{KgenContext, KgenError, Result};

pub const FUNC_NAME_MAXLEN: usize = 64;

/// Callback emitting a helper for a pattern; the helper's name must be
/// declared through [`KgenContext::declare_function`].
pub type GenCallback = Box<dyn FnMut(&mut KgenContext, &[u8]) -> Result<()> + Send>;

struct FuncEntry {
    pattern: Vec<u8>,
    name: String,
}

/// Tracks helper functions already emitted into a program.
pub struct GenGuard {
    generate: GenCallback,
    pat_size: usize,
    funcs: Vec<FuncEntry>,
}

impl GenGuard {
    /// `pat_size` is the number of leading pattern bytes compared for
    /// equality.
    pub fn new(generate: GenCallback, pat_size: usize) -> GenGuard {
        GenGuard {
            generate,
            pat_size,
            funcs: Vec::new(),
        }
    }

    /// Discards all recorded emissions and replaces the generator.
    pub fn reinit(&mut self, generate: GenCallback, pat_size: usize) {
        self.funcs.clear();
        self.generate = generate;
        self.pat_size = pat_size;
    }

    /// Invokes the generator for `pattern`, or returns the name of the
    /// function already generated for a byte-equal pattern.
    pub fn find_generate(&mut self, ctx: &mut KgenContext, pattern: &[u8]) -> Result<String> {
        if pattern.len() < self.pat_size {
            return Err(KgenError::InvalidArg);
        }
        let key = &pattern[..self.pat_size];

        if let Some(entry) = self.funcs.iter().find(|e| e.pattern == key) {
            return Ok(entry.name.clone());
        }

        (self.generate)(ctx, pattern)?;

        let mut name = ctx.last_func_name().unwrap_or("").to_string();
        name.truncate(FUNC_NAME_MAXLEN - 1);

        self.funcs.push(FuncEntry {
            pattern: key.to_vec(),
            name: name.clone(),
        });

        Ok(name)
    }

    /// Number of distinct helpers emitted so far.
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl std::fmt::Debug for GenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GenGuard")
            .field("pat_size", &self.pat_size)
            .field("funcs", &self.funcs.len())
            .finish()
    }
}
