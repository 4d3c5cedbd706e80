/// Errors surfaced to clients as protocol error lines, plus the fatal
/// initialization failures that end the process.
///
/// Every non-fatal variant renders through `Display` into the text that
/// follows the `-` marker on the wire.
#[derive(Debug, thiserror::Error)]
pub enum MurexError {
    #[error("Error {0}")]
    Generic(String),

    #[error("Error {0}")]
    Protocol(String),

    #[error("command {0} not supported")]
    UnknownCommand(String),

    /// ACL rejected the command, a key, or a channel.
    #[error("{0}")]
    Denied(String),

    #[error("Error wrong number of arguments for {0} command")]
    WrongArity(String),

    #[error("Error operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Error no such key")]
    NoSuchKey,

    /// Key lock acquisition aborted by cancellation or deadline.
    #[error("Error could not acquire lock for key {0}")]
    LockFailed(String),

    #[error("Error not cluster leader, cannot carry out command")]
    NotLeader,

    #[error("Error timed out while waiting for log application")]
    ProposalTimeout,

    /// An apply-path error relayed from the log, already rendered.
    #[error("{0}")]
    Remote(String),

    #[error("Error could not parse request")]
    ApplyEncode,

    #[error("Error script module is invalid: {0}")]
    BadModule(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MurexError {
    pub fn generic(msg: impl Into<String>) -> Self {
        MurexError::Generic(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        MurexError::Denied(msg.into())
    }
}

pub type MurexResult<T> = Result<T, MurexError>;
