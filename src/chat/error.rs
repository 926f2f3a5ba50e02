use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection is anonymous")]
    Anonymous,
    #[error("connection is not active yet")]
    Inactive,
    #[error("message dropped after {0} attempts")]
    RetriesExhausted(u32),
    #[error("actor communication error: {0}")]
    ActorComm(String),
    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
