pub mod assembly;
pub mod brief;
pub mod error;
pub mod policy;
pub mod prompt;
pub mod resume;
pub mod sanitize;
pub mod session;
pub mod stream;
pub mod types;
