use thiserror::Error;
use tonic::Status;

/// The main Result type used throughout the plugin server
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum ErrorKind {
    /// The side-channel request header is missing or cannot be decoded
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// No function is registered under the requested id
    #[error("Unknown function: {0}")]
    UnknownFunction(i32),

    /// The requested combination of calling convention and parameters is not supported
    #[error("Unsupported mode: {0}")]
    UnsupportedMode(String),

    /// The script engine raised an exception while evaluating
    #[error("Evaluation error: {0}")]
    EvalError(String),

    /// A script result could not be converted to the declared return type
    #[error("Type conversion error: {0}")]
    TypeConversionError(String),

    /// The declared return type is not one of the known data types
    #[error("Invalid return type: {0}")]
    InvalidReturnType(i32),

    /// Row data does not match the declared parameters
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Function - {0}")]
    FunctionError(ErrorKind),

    #[error("Script - {0}")]
    ScriptError(ErrorKind),

    #[error("Connector - {0}")]
    ConnectorError(ErrorKind),

    #[error("gRPC Status - {0}")]
    GrpcStatus(Status),
}

impl Error {
    /// The [`ErrorKind`] carried by this error, `None` for a [`Error::GrpcStatus`].
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            Error::FunctionError(kind) | Error::ScriptError(kind) | Error::ConnectorError(kind) => {
                Some(kind)
            }
            Error::GrpcStatus(_) => None,
        }
    }

    /// Extract the gRPC Status if this error is a GrpcStatus variant,
    /// otherwise map the error kind to the matching status code.
    pub fn into_status(self) -> Status {
        let kind = match &self {
            Error::GrpcStatus(status) => return status.clone(),
            Error::FunctionError(kind) | Error::ScriptError(kind) | Error::ConnectorError(kind) => {
                kind
            }
        };
        let message = self.to_string();
        match kind {
            ErrorKind::DecodeError(_)
            | ErrorKind::ValidationError(_)
            | ErrorKind::TypeConversionError(_)
            | ErrorKind::InvalidReturnType(_)
            | ErrorKind::EvalError(_) => Status::invalid_argument(message),
            ErrorKind::UnknownFunction(_) | ErrorKind::UnsupportedMode(_) => {
                Status::unimplemented(message)
            }
            ErrorKind::InternalError(_) => Status::internal(message),
        }
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        value.into_status()
    }
}
