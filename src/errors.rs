use thiserror::Error;

/// Wire-level error taxonomy carried in `ErrorInfo.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Only recognised on inbound error responses; malformed frames are skipped
    /// without a reply.
    ParseError,
    /// Inbound only, like `ParseError`.
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            _ => None,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("handler panicked")]
    Panicked,
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::Internal { .. } | Self::Panicked => ErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("method `{0}` is already registered")]
    DuplicateMethod(String),
    #[error("method name must not be empty")]
    EmptyMethod,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint has already been started")]
    AlreadyStarted,
    #[error("i/o failure on the output stream: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_integers() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(-1), None);
    }

    #[test]
    fn handler_errors_map_to_wire_codes() {
        assert_eq!(
            HandlerError::invalid_params("missing name").code(),
            ErrorCode::InvalidParams
        );
        assert_eq!(HandlerError::internal("boom").code(), ErrorCode::InternalError);
        assert_eq!(HandlerError::Panicked.code(), ErrorCode::InternalError);
    }
}
