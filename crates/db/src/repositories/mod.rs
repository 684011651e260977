//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod account_repo;
pub mod credit_ledger_repo;
pub mod generation_session_repo;
pub mod project_repo;
pub mod snapshot_repo;

pub use account_repo::AccountRepo;
pub use credit_ledger_repo::CreditLedgerRepo;
pub use generation_session_repo::GenerationSessionRepo;
pub use project_repo::ProjectRepo;
pub use snapshot_repo::SnapshotRepo;
