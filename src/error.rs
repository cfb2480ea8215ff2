use tonic::{Code, Status};

/// Errors returned by the daemon and by every client handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The channel, daemon or application this call needed is gone.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        match error {
            Error::AlreadyExists(message) => Status::already_exists(message),
            Error::NotFound(message) => Status::not_found(message),
            Error::InvalidArgument(message) => Status::invalid_argument(message),
            Error::Connection(message) => Status::unavailable(message),
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let message = status.message().to_owned();
        match status.code() {
            Code::AlreadyExists => Error::AlreadyExists(message),
            Code::NotFound => Error::NotFound(message),
            Code::InvalidArgument => Error::InvalidArgument(message),
            // Transport failures surface as Unavailable or Unknown depending on
            // where the connection broke.
            Code::Unavailable | Code::Unknown | Code::Cancelled => Error::Connection(message),
            _ => Error::Internal(message),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(error: tonic::transport::Error) -> Self {
        Error::Connection(error.to_string())
    }
}
