// Byte-level frame reader/writer for the PostgreSQL v3 protocol.

// Standard library imports
use std::io::{BufRead, Cursor};

// External crate imports
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::errors::Error;
use crate::messages::MAX_MESSAGE_SIZE;

/// Write all the data in the buffer to the stream.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(&buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Write all the data in the buffer to the stream and flush it.
/// Flushes happen at message boundaries only.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error flushing socket: {err:?}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Read a regular message header: identifier byte plus big-endian length.
pub async fn read_message_header<S>(stream: &mut S) -> Result<(u8, i32), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message code from socket: {err:?}"
            )))
        }
    };
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message len from socket - Code: {code:?}, Error: {err:?}"
            )))
        }
    };

    Ok((code, len))
}

/// Read message data given an already consumed header. The returned buffer
/// contains the full frame, header included.
pub async fn read_message_data<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "Message length is too small: {len}"
        )));
    }

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    let mut buf = BytesMut::with_capacity(len as usize + 1);
    buf.put_u8(code);
    buf.put_i32(len);

    let data_len = len as usize - 4;
    let mut data = vec![0; data_len];

    match stream.read_exact(&mut data).await {
        Ok(_) => {
            buf.put_slice(&data);
            Ok(buf)
        }
        Err(err) => Err(Error::SocketError(format!(
            "Error reading message data from socket - Code: {code:?}, Error: {err:?}"
        ))),
    }
}

/// Read a complete regular message from the stream.
pub async fn read_message<S>(stream: &mut S) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, len) = read_message_header(stream).await?;
    read_message_data(stream, code, len).await
}

/// Read a bootstrap frame (StartupMessage, SSLRequest, CancelRequest,
/// GSSENCRequest). These omit the identifier byte; the payload starts with
/// the 4-byte protocol discriminator, which is left in the returned buffer.
pub async fn read_bootstrap_message<S>(stream: &mut S) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(_) => return Err(Error::ClientBadStartup),
    };

    if len < 8 || len > MAX_MESSAGE_SIZE {
        return Err(Error::ClientBadStartup);
    }

    let mut startup = vec![0u8; len as usize - 4];
    match stream.read_exact(&mut startup).await {
        Ok(_) => (),
        Err(_) => return Err(Error::ClientBadStartup),
    };

    Ok(BytesMut::from(&startup[..]))
}

/// Trait for reading protocol C-strings out of message buffers.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for Cursor<&BytesMut> {
    /// Reads a null-terminated string, consuming the terminator. Errors when
    /// the buffer ends before a terminator is seen.
    fn read_string(&mut self) -> Result<String, Error> {
        let mut buf = vec![];
        match self.read_until(b'\0', &mut buf) {
            Ok(_) => {
                if buf.last() != Some(&b'\0') {
                    return Err(Error::ParseBytesError(
                        "Unterminated string in message".to_string(),
                    ));
                }
                Ok(String::from_utf8_lossy(&buf[..buf.len() - 1]).to_string())
            }
            Err(err) => Err(Error::ParseBytesError(err.to_string())),
        }
    }
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<String, Error> {
        let null_index = self.iter().position(|&byte| byte == b'\0');

        match null_index {
            Some(index) => {
                let string_bytes = self.split_to(index + 1);
                Ok(String::from_utf8_lossy(&string_bytes[..string_bytes.len() - 1]).to_string())
            }
            None => Err(Error::ParseBytesError(
                "Unterminated string in message".to_string(),
            )),
        }
    }
}

/// Parse the key/value parameter block of a StartupMessage.
pub fn parse_params(mut bytes: BytesMut) -> Result<Vec<(String, String)>, Error> {
    let mut result = Vec::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();

        // Null-terminated C-strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                return Err(Error::ClientBadStartup);
            }
            c = bytes.get_u8();
        }

        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ProtocolSyncError(format!(
            "Invalid client startup message: Expected key-value pairs, but received {} parameters",
            buf.len()
        )));
    }

    let mut i = 0;
    while i < buf.len() {
        result.push((buf[i].clone(), buf[i + 1].clone()));
        i += 2;
    }

    Ok(result)
}

/// Parse StartupMessage parameters, e.g. user, database, application_name.
pub fn parse_startup(bytes: BytesMut) -> Result<Vec<(String, String)>, Error> {
    let result = parse_params(bytes)?;

    // The user is the only parameter required by the protocol spec.
    if !result.iter().any(|(k, _)| k == "user") {
        return Err(Error::ClientBadStartup);
    }

    Ok(result)
}
