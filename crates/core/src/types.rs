/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generation sessions are addressed by UUID so stream URLs are not guessable.
pub type SessionId = uuid::Uuid;
