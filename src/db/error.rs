use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("database migration error: {0}")]
    Migration(String),
    #[error("timed out after {0}s waiting for the database write lock")]
    LockTimeout(u64),
}

impl From<diesel::result::Error> for DatabaseError {
    fn from(err: diesel::result::Error) -> Self {
        DatabaseError::Query(err.to_string())
    }
}
