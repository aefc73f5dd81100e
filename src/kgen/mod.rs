//! Kernel source generation: a statement-oriented source writer, the
//! `%`-keyed template engine and the duplicate-helper guard.

mod context;
mod guard;
mod template;

pub use self::context::KgenContext;
pub use self::guard::{GenGuard, FUNC_NAME_MAXLEN};
pub use self::template::{ReductionType, TemplateEngine};

pub type Result<T> = std::result::Result<T, KgenError>;

/// Failures of the generation layer, mirroring the negative return codes
/// of a C kernel generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KgenError {
    #[error("out of memory while generating source")]
    OutOfMemory,
    #[error("generated source exceeds the output buffer")]
    Overflow,
    #[error("invalid generator argument")]
    InvalidArg,
}
