//! Frontend and backend messages of the v3 protocol, extended-query subset.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult};
use crate::message::{EncodedParam, Format};
use crate::transport::FieldDescription;
use crate::types::Oid;

/// Protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608;

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend messages
// ============================================================================

/// Appends itself to an outgoing buffer.
pub trait FrontendMessage {
    fn encode_to(&self, buf: &mut BytesMut);

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }
}

/// Write a tagged message whose body is produced by `body`.
fn framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(buf, "user");
        put_cstr(buf, &self.user);
        if let Some(db) = &self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }
        for (key, value) in &self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);

        let len = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Cleartext or MD5-hashed password.
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |b| put_cstr(b, self.password));
    }
}

/// Parse ('P'): prepare `query` under `name` with fixed parameter types.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_u32(oid.0);
            }
        });
    }
}

/// Bind ('B'): binary parameters, one result format for every column.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [EncodedParam],
    pub result_format: Format,
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                b.put_i16(param.format() as i16);
            }

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                b.put_i32(param.length());
                if let Some(value) = param.value() {
                    b.put_slice(value);
                }
            }

            b.put_i16(1);
            b.put_i16(self.result_format as i16);
        });
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 means no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Describe ('D'). `kind` is `b'S'` for a statement, `b'P'` for a portal.
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Close ('C'). `kind` is `b'S'` for a statement, `b'P'` for a portal.
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'C', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'S', |_| {});
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'X', |_| {});
    }
}

// ============================================================================
// Backend messages
// ============================================================================

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    /// Any other authentication request code.
    AuthenticationOther { code: i32 },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { process_id: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Decode one message body. `tag` is the message type byte; `body`
    /// excludes the tag and length header.
    pub fn decode(tag: u8, body: Bytes) -> PgResult<Self> {
        let mut body = body;
        let msg = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(take_u8(&mut body)?),
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: take_i32(&mut body)?,
                secret_key: take_i32(&mut body)?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = take_i16(&mut body)?.max(0) as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid(take_u32(&mut body)?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: take_i32(&mut body)?,
                channel: read_cstring(&mut body)?,
                payload: read_cstring(&mut body)?,
            },
            _ => {
                return Err(PgError::Protocol(format!(
                    "unknown message type: {:?}",
                    tag as char
                )))
            }
        };
        Ok(msg)
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        let code = take_i32(body)?;
        Ok(match code {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&take(body, 4)?);
                BackendMessage::AuthenticationMD5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                BackendMessage::AuthenticationSASL { mechanisms }
            }
            code => BackendMessage::AuthenticationOther { code },
        })
    }

    fn decode_row_description(body: &mut Bytes) -> PgResult<Self> {
        let count = take_i16(body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: read_cstring(body)?,
                table_oid: take_u32(body)?,
                column_attr: take_i16(body)?,
                type_oid: Oid(take_u32(body)?),
                type_size: take_i16(body)?,
                type_modifier: take_i32(body)?,
                format: Format::from(take_i16(body)?),
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> PgResult<Self> {
        let count = take_i16(body)?.max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = take_i32(body)?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(take(body, len as usize)?));
            }
        }
        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn truncated() -> PgError {
    PgError::Protocol("truncated message body".to_string())
}

fn take(buf: &mut Bytes, n: usize) -> PgResult<Bytes> {
    if buf.remaining() < n {
        return Err(truncated());
    }
    Ok(buf.split_to(n))
}

fn take_u8(buf: &mut Bytes) -> PgResult<u8> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn take_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn take_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn take_u32(buf: &mut Bytes) -> PgResult<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

/// Read a null-terminated string, replacing invalid UTF-8.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("missing null terminator in string".to_string()))?;

    let s = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(&buf[..end]).into_owned(),
    };
    buf.advance(end + 1);
    Ok(s)
}

fn read_error_fields(body: &mut Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(body)?);
    }
    Ok(fields)
}

/// Build a server error from ErrorResponse fields.
pub fn error_from_fields(fields: &HashMap<u8, String>) -> PgError {
    PgError::Server {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn header_len(encoded: &[u8]) -> usize {
        i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]) as usize
    }

    #[test]
    fn test_startup_message_structure() {
        let msg = StartupMessage {
            user: "test".to_string(),
            database: Some("testdb".to_string()),
            options: vec![],
        };
        let encoded = msg.encode();

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        assert_eq!(&encoded[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(encoded[encoded.len() - 1], 0);
    }

    #[test]
    fn test_bind_message_layout() {
        let message = Message::new("SELECT $1, $2", (7i32, Option::<i32>::None));
        let encoded = BindMessage {
            portal: "",
            statement: "s1",
            params: message.params(),
            result_format: Format::Binary,
        }
        .encode();

        assert_eq!(encoded[0], b'B');
        assert_eq!(header_len(&encoded), encoded.len() - 1);

        let expected: &[u8] = &[
            0, b's', b'1', 0, // portal, statement
            0, 2, 0, 1, 0, 1, // two binary param formats
            0, 2, 0, 0, 0, 4, 0, 0, 0, 7, 0xff, 0xff, 0xff, 0xff, // values
            0, 1, 0, 1, // one binary result format
        ];
        assert_eq!(&encoded[5..], expected);
    }

    #[test]
    fn test_parse_message_oids() {
        let encoded = ParseMessage {
            name: "",
            query: "SELECT 1",
            param_types: &[Oid::INT4, Oid(100500)],
        }
        .encode();
        assert_eq!(encoded[0], b'P');
        assert_eq!(header_len(&encoded), encoded.len() - 1);
        assert_eq!(&encoded[encoded.len() - 8..encoded.len() - 4], &23u32.to_be_bytes());
        assert_eq!(&encoded[encoded.len() - 4..], &100500u32.to_be_bytes());
    }

    #[test]
    fn test_decode_data_row() {
        let body = Bytes::from_static(&[0, 2, 0, 0, 0, 1, b'x', 0xff, 0xff, 0xff, 0xff]);
        match BackendMessage::decode(b'D', body).unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values, vec![Some(Bytes::from_static(b"x")), None]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_is_protocol_error() {
        let body = Bytes::from_static(&[0, 1, 0, 0, 0, 9, b'x']);
        let err = BackendMessage::decode(b'D', body).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));

        let err = BackendMessage::decode(b'C', Bytes::from_static(b"SELECT 1")).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_error_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "42P01".to_string());
        fields.insert(b'M', "relation \"nope\" does not exist".to_string());
        let err = error_from_fields(&fields);
        assert_eq!(err.code(), Some("42P01"));
    }
}
