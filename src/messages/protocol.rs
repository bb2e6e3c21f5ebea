// Server-to-client message builders. Each function assembles one complete
// frame into a BytesMut; callers buffer frames and flush at message
// boundaries.

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::constants::{AUTHENTICATION_SUCCESSFUL, MESSAGE_TERMINATOR};
use crate::errors::PgError;

/// Transaction status byte carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I': not in a transaction.
    Idle,
    /// 'T': in a transaction block.
    InTransaction,
    /// 'E': in a failed transaction block awaiting rollback.
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: i32,
    pub type_size: i16,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

impl FieldDescription {
    pub fn new(name: impl Into<String>, type_oid: i32, type_size: i16) -> FieldDescription {
        FieldDescription {
            name: name.into(),
            type_oid,
            type_size,
            format: 0,
        }
    }
}

/// Create an AuthenticationOk message.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(AUTHENTICATION_SUCCESSFUL);
    bytes
}

/// Create an AuthenticationCleartextPassword challenge.
pub fn cleartext_password_challenge() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(3);
    bytes
}

/// Create a BackendKeyData message carrying the id/secret pair the client
/// needs to issue a CancelRequest later.
pub fn backend_key_data(connection_id: i32, secret: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(connection_id);
    bytes.put_i32(secret);
    bytes
}

/// Create a ParameterStatus message.
pub fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    bytes.put_slice(key.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(value.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a ReadyForQuery message.
pub fn ready_for_query(status: TransactionStatus) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(status.as_byte());
    bytes
}

/// Create a CommandComplete message.
pub fn command_complete(tag: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'C');
    bytes.put_i32(tag.len() as i32 + 4 + 1);
    bytes.put_slice(tag.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create an EmptyQueryResponse message.
pub fn empty_query_response() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'I');
    bytes.put_i32(4);
    bytes
}

/// Create a ParseComplete message.
pub fn parse_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'1');
    bytes.put_i32(4);
    bytes
}

/// Create a BindComplete message.
pub fn bind_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'2');
    bytes.put_i32(4);
    bytes
}

/// Create a CloseComplete message.
pub fn close_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'3');
    bytes.put_i32(4);
    bytes
}

/// Create a NoData message.
pub fn no_data() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'n');
    bytes.put_i32(4);
    bytes
}

/// Create a PortalSuspended message.
pub fn portal_suspended() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b's');
    bytes.put_i32(4);
    bytes
}

/// Create a ParameterDescription message.
pub fn parameter_description(param_oids: &[i32]) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b't');
    bytes.put_i32(4 + 2 + 4 * param_oids.len() as i32);
    bytes.put_i16(param_oids.len() as i16);
    for oid in param_oids {
        bytes.put_i32(*oid);
    }
    bytes
}

/// Create a RowDescription message.
pub fn row_description(fields: &[FieldDescription]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    row_desc.put_i16(fields.len() as i16);

    for field in fields {
        // Column name
        row_desc.put_slice(field.name.as_bytes());
        row_desc.put_u8(0);

        // Does not belong to any table
        row_desc.put_i32(0);
        row_desc.put_i16(0);

        row_desc.put_i32(field.type_oid);
        row_desc.put_i16(field.type_size);

        // Type modifier
        row_desc.put_i32(-1);

        row_desc.put_i16(field.format);
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);

    res
}

/// Create a DataRow message. A `None` column is encoded as length -1.
pub fn data_row(row: &[Option<BytesMut>]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);

    for value in row {
        match value {
            Some(value) => {
                data_row.put_i32(value.len() as i32);
                data_row.put_slice(value);
            }
            None => {
                data_row.put_i32(-1);
            }
        }
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);

    res
}

/// Create a CopyInResponse message: overall format plus one format code per
/// column.
pub fn copy_in_response(binary: bool, column_formats: &[i16]) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'G');
    bytes.put_i32(4 + 1 + 2 + 2 * column_formats.len() as i32);
    bytes.put_u8(if binary { 1 } else { 0 });
    bytes.put_i16(column_formats.len() as i16);
    for format in column_formats {
        bytes.put_i16(*format);
    }
    bytes
}

/// Create an ErrorResponse message from a typed error.
pub fn error_response(err: &PgError) -> BytesMut {
    let mut error = BytesMut::new();

    // Severity, twice: localized and non-translatable.
    error.put_u8(b'S');
    error.put_slice(err.severity.as_str().as_bytes());
    error.put_u8(0);
    error.put_u8(b'V');
    error.put_slice(err.severity.as_str().as_bytes());
    error.put_u8(0);

    // SQLSTATE code.
    error.put_u8(b'C');
    error.put_slice(err.code.code().as_bytes());
    error.put_u8(0);

    // The short error message.
    error.put_u8(b'M');
    error.put_slice(err.message.as_bytes());
    error.put_u8(0);

    if let Some(hint) = &err.hint {
        error.put_u8(b'H');
        error.put_slice(hint.as_bytes());
        error.put_u8(0);
    }

    // No more fields follow.
    error.put_u8(MESSAGE_TERMINATOR);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Create a NoticeResponse message. Same field layout as ErrorResponse.
pub fn notice_response(code: &str, message: &str) -> BytesMut {
    let mut notice = BytesMut::new();

    notice.put_u8(b'S');
    notice.put_slice(b"NOTICE\0");
    notice.put_u8(b'V');
    notice.put_slice(b"NOTICE\0");
    notice.put_u8(b'C');
    notice.put_slice(code.as_bytes());
    notice.put_u8(0);
    notice.put_u8(b'M');
    notice.put_slice(message.as_bytes());
    notice.put_u8(0);
    notice.put_u8(MESSAGE_TERMINATOR);

    let mut res = BytesMut::with_capacity(notice.len() + 5);
    res.put_u8(b'N');
    res.put_i32(notice.len() as i32 + 4);
    res.put(notice);
    res
}
