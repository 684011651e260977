//! Row structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct matching
//! the database row, plus the input DTOs its repository accepts.

pub mod account;
pub mod credit_ledger;
pub mod generation_session;
pub mod project;
pub mod snapshot;
