// Tests for the messages module: frame codec round trips, bootstrap
// dispatch, typed frontend messages and response builders.

// External crate imports
use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;

// Internal crate imports
use crate::errors::{Error, PgError, SqlState};
use crate::messages::frontend::{BootstrapMessage, FrontendMessage};
use crate::messages::protocol::{
    command_complete, copy_in_response, data_row, error_response, parameter_description,
    ready_for_query, row_description, FieldDescription, TransactionStatus,
};
use crate::messages::{parse_startup, read_message};

fn frame(code: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(code);
    buf.put_i32(payload.len() as i32 + 4);
    buf.put_slice(payload);
    buf
}

#[tokio::test]
async fn test_read_message_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(256);

    let message = frame(b'Q', b"SELECT 1\0");
    client.write_all(&message).await.expect("write");

    let read = read_message(&mut server).await.expect("read");
    // The reader consumes exactly identifier + length bytes.
    assert_eq!(&read[..], &message[..]);
}

#[tokio::test]
async fn test_read_message_rejects_bad_length() {
    let (mut client, mut server) = tokio::io::duplex(64);

    let mut message = BytesMut::new();
    message.put_u8(b'Q');
    message.put_i32(2); // Shorter than the length field itself.
    client.write_all(&message).await.expect("write");

    match read_message(&mut server).await {
        Err(Error::ProtocolSyncError(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[test]
fn test_parse_startup_success() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"user\0testuser\0");
    bytes.put_slice(b"database\0testdb\0");
    bytes.put_slice(b"application_name\0testapp\0");
    bytes.put_u8(0);

    let params = parse_startup(bytes).expect("parse");
    assert_eq!(params.len(), 3);
    assert!(params.contains(&("user".to_string(), "testuser".to_string())));
    assert!(params.contains(&("database".to_string(), "testdb".to_string())));
}

#[test]
fn test_parse_startup_missing_user() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"database\0testdb\0");
    bytes.put_u8(0);

    match parse_startup(bytes) {
        Err(Error::ClientBadStartup) => {}
        other => panic!("expected ClientBadStartup, got {other:?}"),
    }
}

#[test]
fn test_bootstrap_dispatch() {
    let mut startup = BytesMut::new();
    startup.put_i32(196608);
    startup.put_slice(b"user\0me\0");
    startup.put_u8(0);
    match BootstrapMessage::parse(startup).unwrap() {
        BootstrapMessage::Startup { parameters } => {
            assert_eq!(parameters, vec![("user".to_string(), "me".to_string())]);
        }
        other => panic!("expected Startup, got {other:?}"),
    }

    let mut ssl = BytesMut::new();
    ssl.put_i32(80877103);
    assert_eq!(BootstrapMessage::parse(ssl).unwrap(), BootstrapMessage::SslRequest);

    let mut cancel = BytesMut::new();
    cancel.put_i32(80877102);
    cancel.put_i32(7);
    cancel.put_i32(42);
    assert_eq!(
        BootstrapMessage::parse(cancel).unwrap(),
        BootstrapMessage::CancelRequest {
            connection_id: 7,
            secret: 42
        }
    );

    let mut gss = BytesMut::new();
    gss.put_i32(80877104);
    assert_eq!(BootstrapMessage::parse(gss).unwrap(), BootstrapMessage::GssEncRequest);

    let mut unknown = BytesMut::new();
    unknown.put_i32(123456);
    assert!(BootstrapMessage::parse(unknown).is_err());
}

#[test]
fn test_frontend_query_message() {
    let message = frame(b'Q', b"SELECT * FROM users\0");
    match FrontendMessage::try_from(&message).unwrap() {
        FrontendMessage::Query { sql } => assert_eq!(sql, "SELECT * FROM users"),
        other => panic!("expected Query, got {other:?}"),
    }
}

#[test]
fn test_frontend_query_fails_when_not_null_terminated() {
    let message = frame(b'Q', b"SELECT * FROM users");
    assert!(FrontendMessage::try_from(&message).is_err());
}

#[test]
fn test_frontend_parse_message() {
    let mut payload = BytesMut::new();
    payload.put_slice(b"some statement\0");
    payload.put_slice(b"SELECT * FROM users WHERE name = $1\0");
    payload.put_i16(1);
    payload.put_i32(1002);
    let message = frame(b'P', &payload);

    match FrontendMessage::try_from(&message).unwrap() {
        FrontendMessage::Parse(parse) => {
            assert_eq!(parse.name, "some statement");
            assert_eq!(parse.query, "SELECT * FROM users WHERE name = $1");
            assert_eq!(parse.param_types, vec![1002]);
        }
        other => panic!("expected Parse, got {other:?}"),
    }
}

#[test]
fn test_frontend_bind_message() {
    let mut payload = BytesMut::new();
    payload.put_slice(b"\0"); // portal
    payload.put_slice(b"s1\0"); // statement
    payload.put_i16(0); // no param format codes
    payload.put_i16(2); // two params
    payload.put_i32(4);
    payload.put_slice(b"1234");
    payload.put_i32(-1); // null
    payload.put_i16(1); // one result format code
    payload.put_i16(1);
    let message = frame(b'B', &payload);

    match FrontendMessage::try_from(&message).unwrap() {
        FrontendMessage::Bind(bind) => {
            assert_eq!(bind.portal, "");
            assert_eq!(bind.statement, "s1");
            assert_eq!(bind.params.len(), 2);
            assert_eq!(bind.params[0].as_deref(), Some(b"1234".as_slice()));
            assert_eq!(bind.params[1], None);
            assert_eq!(bind.result_formats, vec![1]);
        }
        other => panic!("expected Bind, got {other:?}"),
    }
}

#[test]
fn test_frontend_describe_and_close() {
    let mut payload = BytesMut::new();
    payload.put_u8(b'S');
    payload.put_slice(b"stmt1\0");
    match FrontendMessage::try_from(&frame(b'D', &payload)).unwrap() {
        FrontendMessage::Describe { target, name } => {
            assert_eq!(target, 'S');
            assert_eq!(name, "stmt1");
        }
        other => panic!("expected Describe, got {other:?}"),
    }

    let mut payload = BytesMut::new();
    payload.put_u8(b'P');
    payload.put_slice(b"\0");
    match FrontendMessage::try_from(&frame(b'C', &payload)).unwrap() {
        FrontendMessage::Close { target, name } => {
            assert_eq!(target, 'P');
            assert_eq!(name, "");
        }
        other => panic!("expected Close, got {other:?}"),
    }

    // Targets other than S and P are a protocol error.
    let mut payload = BytesMut::new();
    payload.put_u8(b'X');
    payload.put_slice(b"\0");
    assert!(FrontendMessage::try_from(&frame(b'D', &payload)).is_err());
}

#[test]
fn test_frontend_execute_message() {
    let mut payload = BytesMut::new();
    payload.put_slice(b"p1\0");
    payload.put_i32(50);
    match FrontendMessage::try_from(&frame(b'E', &payload)).unwrap() {
        FrontendMessage::Execute { portal, max_rows } => {
            assert_eq!(portal, "p1");
            assert_eq!(max_rows, 50);
        }
        other => panic!("expected Execute, got {other:?}"),
    }
}

#[test]
fn test_frontend_single_byte_messages() {
    assert_eq!(
        FrontendMessage::try_from(&frame(b'S', b"")).unwrap(),
        FrontendMessage::Sync
    );
    assert_eq!(
        FrontendMessage::try_from(&frame(b'H', b"")).unwrap(),
        FrontendMessage::Flush
    );
    assert_eq!(
        FrontendMessage::try_from(&frame(b'X', b"")).unwrap(),
        FrontendMessage::Terminate
    );
    assert_eq!(
        FrontendMessage::try_from(&frame(b'c', b"")).unwrap(),
        FrontendMessage::CopyDone
    );
    match FrontendMessage::try_from(&frame(b'z', b"")).unwrap() {
        FrontendMessage::Unknown { code } => assert_eq!(code, b'z'),
        other => panic!("expected Unknown, got {other:?}"),
    }
}

#[test]
fn test_frontend_copy_data_payload() {
    let message = frame(b'd', b"1\t'One'\n2\t'Two'\n");
    match FrontendMessage::try_from(&message).unwrap() {
        FrontendMessage::CopyData { payload } => {
            assert_eq!(&payload[..], b"1\t'One'\n2\t'Two'\n");
        }
        other => panic!("expected CopyData, got {other:?}"),
    }
}

#[test]
fn test_error_response_fields() {
    let err = PgError::new(SqlState::SyntaxError, "broken statement")
        .with_hint("fix the statement");
    let bytes = error_response(&err);

    assert_eq!(bytes[0], b'E');
    let text = String::from_utf8_lossy(&bytes[5..]);
    assert!(text.contains("42601"));
    assert!(text.contains("broken statement"));
    assert!(text.contains("ERROR"));
    assert!(text.contains("fix the statement"));
}

#[test]
fn test_ready_for_query_states() {
    for (status, expected) in [
        (TransactionStatus::Idle, b'I'),
        (TransactionStatus::InTransaction, b'T'),
        (TransactionStatus::Failed, b'E'),
    ] {
        let bytes = ready_for_query(status);
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[0], b'Z');
        assert_eq!(bytes[5], expected);
    }
}

#[test]
fn test_row_description_layout() {
    let fields = vec![
        FieldDescription::new("id", 23, 4),
        FieldDescription::new("name", 25, -1),
    ];
    let bytes = row_description(&fields);

    assert_eq!(bytes[0], b'T');
    let count = i16::from_be_bytes([bytes[5], bytes[6]]);
    assert_eq!(count, 2);

    // First field: name, table oid, attnum, type oid.
    let mut pos = 7;
    let nul = bytes[pos..].iter().position(|&b| b == 0).unwrap();
    assert_eq!(&bytes[pos..pos + nul], b"id");
    pos += nul + 1 + 4 + 2;
    let oid = i32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap());
    assert_eq!(oid, 23);
}

#[test]
fn test_data_row_nulls() {
    let mut value = BytesMut::new();
    value.put_slice(b"1");
    let bytes = data_row(&[Some(value), None]);

    assert_eq!(bytes[0], b'D');
    let count = i16::from_be_bytes([bytes[5], bytes[6]]);
    assert_eq!(count, 2);
    let first_len = i32::from_be_bytes(bytes[7..11].try_into().unwrap());
    assert_eq!(first_len, 1);
    // Null is encoded as length -1 with no payload.
    let second_len = i32::from_be_bytes(bytes[12..16].try_into().unwrap());
    assert_eq!(second_len, -1);
    assert_eq!(bytes.len(), 16);
}

#[test]
fn test_command_complete() {
    let bytes = command_complete("SELECT 1");
    assert_eq!(bytes[0], b'C');
    assert_eq!(&bytes[5..], b"SELECT 1\0");
}

#[test]
fn test_copy_in_response_layout() {
    let bytes = copy_in_response(false, &[0, 0]);
    assert_eq!(bytes[0], b'G');
    assert_eq!(bytes[5], 0); // overall text format
    assert_eq!(i16::from_be_bytes([bytes[6], bytes[7]]), 2);
    assert_eq!(i16::from_be_bytes([bytes[8], bytes[9]]), 0);
    assert_eq!(i16::from_be_bytes([bytes[10], bytes[11]]), 0);
}

#[test]
fn test_parameter_description_layout() {
    let bytes = parameter_description(&[25, 23]);
    assert_eq!(bytes[0], b't');
    assert_eq!(i16::from_be_bytes([bytes[5], bytes[6]]), 2);
    assert_eq!(i32::from_be_bytes(bytes[7..11].try_into().unwrap()), 25);
    assert_eq!(i32::from_be_bytes(bytes[11..15].try_into().unwrap()), 23);
}
