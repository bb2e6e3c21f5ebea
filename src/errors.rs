//! Errors.

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    SocketError(String),
    ClientBadStartup,
    ProtocolSyncError(String),
    ClientError(String),
    BadConfig(String),
    ParseBytesError(String),
    MaxMessageSize,
    TooManyInvalidMessages,
    ShuttingDown,
    /// An error that is reported to the client as an ErrorResponse and then
    /// handled inside the current sync window.
    Pg(PgError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::ClientBadStartup => write!(f, "Client sent an invalid startup message"),
            Error::ProtocolSyncError(msg) => write!(f, "Protocol synchronization error: {msg}"),
            Error::ClientError(msg) => write!(f, "Client error: {msg}"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::ParseBytesError(msg) => write!(f, "Failed to parse bytes: {msg}"),
            Error::MaxMessageSize => write!(f, "Message exceeds maximum allowed size"),
            Error::TooManyInvalidMessages => {
                write!(f, "Terminating connection due to too many invalid messages")
            }
            Error::ShuttingDown => write!(f, "Server is shutting down"),
            Error::Pg(err) => write!(f, "{err}"),
        }
    }
}

impl From<PgError> for Error {
    fn from(err: PgError) -> Self {
        Error::Pg(err)
    }
}

/// SQLSTATE codes used on the wire.
/// See: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SqlState {
    /// 08P01 protocol violation
    ProtocolViolation,
    /// 25P02 in failed sql transaction
    InFailedSqlTransaction,
    /// 26000 invalid statement or portal name
    InvalidSqlStatementName,
    /// 42P05 prepared statement already exists
    DuplicatePreparedStatement,
    /// 42601 syntax error
    SyntaxError,
    /// 42P01 undefined table
    UndefinedTable,
    /// 42704 undefined object (unknown setting)
    UndefinedObject,
    /// 22P02 invalid text representation
    InvalidTextRepresentation,
    /// 22007 invalid datetime format
    InvalidDatetimeFormat,
    /// 22003 numeric value out of range
    NumericValueOutOfRange,
    /// 57014 query canceled
    QueryCanceled,
    /// 0A000 feature not supported
    FeatureNotSupported,
    /// XX000 internal error
    InternalError,
}

impl SqlState {
    pub fn code(&self) -> &'static str {
        match self {
            SqlState::ProtocolViolation => "08P01",
            SqlState::InFailedSqlTransaction => "25P02",
            SqlState::InvalidSqlStatementName => "26000",
            SqlState::DuplicatePreparedStatement => "42P05",
            SqlState::SyntaxError => "42601",
            SqlState::UndefinedTable => "42P01",
            SqlState::UndefinedObject => "42704",
            SqlState::InvalidTextRepresentation => "22P02",
            SqlState::InvalidDatetimeFormat => "22007",
            SqlState::NumericValueOutOfRange => "22003",
            SqlState::QueryCanceled => "57014",
            SqlState::FeatureNotSupported => "0A000",
            SqlState::InternalError => "XX000",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Severity {
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// An error destined for the client as an ErrorResponse message.
#[derive(Debug, PartialEq, Clone)]
pub struct PgError {
    pub severity: Severity,
    pub code: SqlState,
    pub message: String,
    pub hint: Option<String>,
}

impl PgError {
    pub fn new(code: SqlState, message: impl Into<String>) -> PgError {
        PgError {
            severity: Severity::Error,
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn fatal(code: SqlState, message: impl Into<String>) -> PgError {
        PgError {
            severity: Severity::Fatal,
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> PgError {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}: {} [{}]",
            self.severity.as_str(),
            self.message,
            self.code.code()
        )
    }
}
