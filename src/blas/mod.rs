//! The BLAS-facing side of the library: function identities, argument
//! validation, problem-dimension helpers and the public entry points.

mod entry;
pub mod funcs;
pub mod matrix_dims;
pub mod validate;

pub use self::funcs::{BlasFunctionID, NR_BLAS_FUNCTIONS};
