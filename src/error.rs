#[derive(Debug, thiserror::Error)]
pub enum OxidisError {
    #[error("ERR {0}")]
    Generic(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("ERR unknown command '{0}', with args beginning with: {1}")]
    UnknownCommand(String, String),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR {0} is out of range")]
    Range(String),

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR increment would produce NaN or Infinity")]
    FloatOverflow,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("ERR {0} is not allowed in cluster mode")]
    ClusterMode(String),

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    #[error("LOADING Oxidis is loading the dataset in memory")]
    Loading,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type OxidisResult<T> = Result<T, OxidisError>;
