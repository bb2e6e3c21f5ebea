// Typed client-to-server messages. Each regular message is one variant of
// `FrontendMessage`, keyed on the identifier byte; bootstrap frames form a
// separate family keyed on the leading protocol number.

// Standard library imports
use std::io::Cursor;

// External crate imports
use bytes::{Buf, BytesMut};

// Internal crate imports
use crate::constants::{
    CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE,
};
use crate::errors::Error;
use crate::messages::codec::{parse_startup, BytesMutReader};

/// The first frame of a connection. These have no identifier byte and are
/// distinguished by a 4-byte protocol discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapMessage {
    Startup { parameters: Vec<(String, String)> },
    SslRequest,
    CancelRequest { connection_id: i32, secret: i32 },
    GssEncRequest,
}

impl BootstrapMessage {
    /// Parse a bootstrap frame body (length already consumed).
    pub fn parse(mut bytes: BytesMut) -> Result<BootstrapMessage, Error> {
        if bytes.remaining() < 4 {
            return Err(Error::ClientBadStartup);
        }
        let code = bytes.get_i32();

        match code {
            PROTOCOL_VERSION_NUMBER => Ok(BootstrapMessage::Startup {
                parameters: parse_startup(bytes)?,
            }),
            SSL_REQUEST_CODE => Ok(BootstrapMessage::SslRequest),
            CANCEL_REQUEST_CODE => {
                if bytes.remaining() < 8 {
                    return Err(Error::ClientBadStartup);
                }
                Ok(BootstrapMessage::CancelRequest {
                    connection_id: bytes.get_i32(),
                    secret: bytes.get_i32(),
                })
            }
            GSSENC_REQUEST_CODE => Ok(BootstrapMessage::GssEncRequest),
            _ => Err(Error::ProtocolSyncError(format!(
                "Unexpected startup code: {code}"
            ))),
        }
    }
}

/// Parse (F) message.
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[derive(Clone, Debug, PartialEq)]
pub struct Parse {
    pub name: String,
    pub query: String,
    pub param_types: Vec<i32>,
}

impl TryFrom<&BytesMut> for Parse {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Parse, Error> {
        let mut cursor = Cursor::new(buf);
        let _code = cursor.get_u8();
        let _len = cursor.get_i32();
        let name = cursor.read_string()?;
        let query = cursor.read_string()?;
        if cursor.remaining() < 2 {
            return Err(Error::ParseBytesError("Parse message truncated".into()));
        }
        let num_params = cursor.get_i16();
        let mut param_types = Vec::new();

        for _ in 0..num_params {
            if cursor.remaining() < 4 {
                return Err(Error::ParseBytesError("Parse message truncated".into()));
            }
            param_types.push(cursor.get_i32());
        }

        Ok(Parse {
            name,
            query,
            param_types,
        })
    }
}

/// Bind (F) message.
#[derive(Clone, Debug, PartialEq)]
pub struct Bind {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub params: Vec<Option<BytesMut>>,
    pub result_formats: Vec<i16>,
}

impl TryFrom<&BytesMut> for Bind {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Bind, Error> {
        let mut cursor = Cursor::new(buf);
        let _code = cursor.get_u8();
        let _len = cursor.get_i32();
        let portal = cursor.read_string()?;
        let statement = cursor.read_string()?;

        if cursor.remaining() < 2 {
            return Err(Error::ParseBytesError("Bind message truncated".into()));
        }
        let num_param_format_codes = cursor.get_i16();
        let mut param_formats = Vec::new();
        for _ in 0..num_param_format_codes {
            if cursor.remaining() < 2 {
                return Err(Error::ParseBytesError("Bind message truncated".into()));
            }
            param_formats.push(cursor.get_i16());
        }

        if cursor.remaining() < 2 {
            return Err(Error::ParseBytesError("Bind message truncated".into()));
        }
        let num_param_values = cursor.get_i16();
        let mut params = Vec::new();
        for _ in 0..num_param_values {
            if cursor.remaining() < 4 {
                return Err(Error::ParseBytesError("Bind message truncated".into()));
            }
            let param_len = cursor.get_i32();
            if param_len == -1 {
                // A length of -1 is the null sentinel.
                params.push(None);
            } else {
                if param_len < 0 || cursor.remaining() < param_len as usize {
                    return Err(Error::ParseBytesError("Bind message truncated".into()));
                }
                let mut value = BytesMut::with_capacity(param_len as usize);
                value.extend_from_slice(
                    &cursor.get_ref()[cursor.position() as usize
                        ..cursor.position() as usize + param_len as usize],
                );
                cursor.advance(param_len as usize);
                params.push(Some(value));
            }
        }

        if cursor.remaining() < 2 {
            return Err(Error::ParseBytesError("Bind message truncated".into()));
        }
        let num_result_format_codes = cursor.get_i16();
        let mut result_formats = Vec::new();
        for _ in 0..num_result_format_codes {
            if cursor.remaining() < 2 {
                return Err(Error::ParseBytesError("Bind message truncated".into()));
            }
            result_formats.push(cursor.get_i16());
        }

        Ok(Bind {
            portal,
            statement,
            param_formats,
            params,
            result_formats,
        })
    }
}

/// All regular client messages as one tagged union.
#[derive(Clone, Debug, PartialEq)]
pub enum FrontendMessage {
    Query { sql: String },
    Parse(Parse),
    Bind(Bind),
    Describe { target: char, name: String },
    Execute { portal: String, max_rows: i32 },
    Close { target: char, name: String },
    Sync,
    Flush,
    Terminate,
    CopyData { payload: BytesMut },
    CopyDone,
    CopyFail { message: String },
    FunctionCall,
    Unknown { code: u8 },
}

impl FrontendMessage {
    pub fn identifier(&self) -> u8 {
        match self {
            FrontendMessage::Query { .. } => b'Q',
            FrontendMessage::Parse(_) => b'P',
            FrontendMessage::Bind(_) => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Sync => b'S',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Terminate => b'X',
            FrontendMessage::CopyData { .. } => b'd',
            FrontendMessage::CopyDone => b'c',
            FrontendMessage::CopyFail { .. } => b'f',
            FrontendMessage::FunctionCall => b'F',
            FrontendMessage::Unknown { code } => *code,
        }
    }
}

impl TryFrom<&BytesMut> for FrontendMessage {
    type Error = Error;

    /// Decode a complete frame (identifier + length + payload) into its
    /// typed form. Unrecognized identifiers yield `Unknown` so the caller
    /// can count them against the invalid-message limit.
    fn try_from(buf: &BytesMut) -> Result<FrontendMessage, Error> {
        let code = *buf.first().ok_or(Error::ParseBytesError(
            "Empty message buffer".to_string(),
        ))?;

        match code {
            b'Q' => {
                let mut cursor = Cursor::new(buf);
                let _code = cursor.get_u8();
                let _len = cursor.get_i32();
                let sql = cursor.read_string()?;
                Ok(FrontendMessage::Query { sql })
            }
            b'P' => Ok(FrontendMessage::Parse(buf.try_into()?)),
            b'B' => Ok(FrontendMessage::Bind(buf.try_into()?)),
            b'D' | b'C' => {
                let mut cursor = Cursor::new(buf);
                let _code = cursor.get_u8();
                let _len = cursor.get_i32();
                if cursor.remaining() < 1 {
                    return Err(Error::ParseBytesError("Message truncated".into()));
                }
                let target = cursor.get_u8() as char;
                if target != 'S' && target != 'P' {
                    return Err(Error::ProtocolSyncError(format!(
                        "Invalid describe/close target: {target}"
                    )));
                }
                let name = cursor.read_string()?;
                if code == b'D' {
                    Ok(FrontendMessage::Describe { target, name })
                } else {
                    Ok(FrontendMessage::Close { target, name })
                }
            }
            b'E' => {
                let mut cursor = Cursor::new(buf);
                let _code = cursor.get_u8();
                let _len = cursor.get_i32();
                let portal = cursor.read_string()?;
                if cursor.remaining() < 4 {
                    return Err(Error::ParseBytesError("Execute message truncated".into()));
                }
                let max_rows = cursor.get_i32();
                Ok(FrontendMessage::Execute { portal, max_rows })
            }
            b'S' => Ok(FrontendMessage::Sync),
            b'H' => Ok(FrontendMessage::Flush),
            b'X' => Ok(FrontendMessage::Terminate),
            b'd' => {
                let mut payload = BytesMut::with_capacity(buf.len().saturating_sub(5));
                payload.extend_from_slice(&buf[5..]);
                Ok(FrontendMessage::CopyData { payload })
            }
            b'c' => Ok(FrontendMessage::CopyDone),
            b'f' => {
                let mut cursor = Cursor::new(buf);
                let _code = cursor.get_u8();
                let _len = cursor.get_i32();
                let message = cursor.read_string()?;
                Ok(FrontendMessage::CopyFail { message })
            }
            b'F' => Ok(FrontendMessage::FunctionCall),
            _ => Ok(FrontendMessage::Unknown { code }),
        }
    }
}
