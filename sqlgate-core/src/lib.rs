//! Policy validation core for the SQL safety gateway.
//!
//! Untrusted, model-generated SQL comes in; a provably bounded, read-only
//! statement (or a typed rejection) comes out. Validation is a pure function
//! of its inputs plus an immutable [`PolicyConfig`], so any number of tasks
//! may validate concurrently without synchronization.

pub mod dialect;
pub mod error;
mod normalize;
pub mod policy;
pub mod validate;

pub use dialect::{SqlDialect, UnknownDialect};
pub use error::{RejectKind, Rejection, ValidateError, WriteKind};
pub use policy::{PolicyConfig, DEFAULT_FORBIDDEN_FUNCTIONS, DEFAULT_MAX_LIMIT};
pub use validate::validate;
