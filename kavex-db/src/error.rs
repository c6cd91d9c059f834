use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("channel is already linked to a different connected server")]
    ChannelAlreadyLinked,

    #[error("this token is already linked to another channel")]
    TokenAlreadyLinked,

    #[error("token hash is not a 64-character hex digest")]
    InvalidTokenHash,

    #[error("stored row is corrupt: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
