// Used in the StartupMessage to indicate regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

// SSLRequest: used to indicate the client wants an SSL connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: the cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// GSSENCRequest: GSSAPI encryption negotiation, always declined.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

// AuthenticationOk
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;

// ErrorResponse: a zero field type terminates the field list.
pub const MESSAGE_TERMINATOR: u8 = 0;

// Messages skipped because they arrived in the wrong connection mode are
// counted; past this limit the connection is closed with a fatal error.
pub const MAX_INVALID_MESSAGE_COUNT: usize = 100;

// The PostgreSQL epoch (2000-01-01) expressed in seconds since the Unix
// epoch. Binary timestamps are microseconds relative to this instant,
// binary dates are days relative to it.
pub const PG_EPOCH_UNIX_SECONDS: i64 = 946_684_800;

// Identity reported to clients in application_name/session_authorization.
pub const SERVER_IDENTITY: &str = "pg_bridge";

// server_version reported when the session does not override it.
pub const DEFAULT_SERVER_VERSION: &str = "14.1";
