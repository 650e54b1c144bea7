//! PostgreSQL v3 wire protocol messages.
//!
//! Only the subset the driver speaks: startup and authentication, the simple
//! query protocol, and the extended protocol with text-format parameters on
//! the unnamed statement/portal.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};
use super::types::Oid;

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
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
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Write a tagged message: tag byte, then Int32 length (including itself), then body.
fn frame(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start (untagged).
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    /// Extra startup parameters (client_encoding, application_name, options bag)
    pub parameters: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(&mut buf, "user");
        put_cstr(&mut buf, &self.user);
        if let Some(ref db) = self.database {
            put_cstr(&mut buf, "database");
            put_cstr(&mut buf, db);
        }
        for (key, value) in &self.parameters {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }
        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Password message (cleartext or MD5 hash).
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| put_cstr(b, &self.password))
    }
}

/// Simple query message ('Q'). May contain several statements.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        frame(b'Q', |b| put_cstr(b, &self.query))
    }
}

/// Parse message ('P') for the unnamed statement; parameter types are left
/// for the server to infer.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub query: String,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'P', |b| {
            put_cstr(b, "");
            put_cstr(b, &self.query);
            b.put_i16(0);
        })
    }
}

/// Largest parameter count a Bind message can carry (an unsigned 16-bit field).
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Bind message ('B'): all parameters and results in text format.
#[derive(Debug, Clone)]
pub struct BindMessage {
    /// Text-encoded parameters; None is SQL NULL
    pub params: Vec<Option<Vec<u8>>>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        frame(b'B', |b| {
            put_cstr(b, ""); // portal
            put_cstr(b, ""); // statement
            b.put_i16(0); // all parameters use the default (text) format
            b.put_u16(self.params.len() as u16);
            for param in &self.params {
                match param {
                    Some(data) => {
                        b.put_i32(data.len() as i32);
                        b.put_slice(data);
                    }
                    None => b.put_i32(-1),
                }
            }
            b.put_i16(0); // all results in text format
        })
    }
}

/// Describe message ('D') for the unnamed portal.
#[derive(Debug, Clone, Copy)]
pub struct DescribePortalMessage;

impl FrontendMessage for DescribePortalMessage {
    fn encode(&self) -> BytesMut {
        frame(b'D', |b| {
            b.put_u8(b'P');
            put_cstr(b, "");
        })
    }
}

/// Execute message ('E') for the unnamed portal, no row limit.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteMessage;

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        frame(b'E', |b| {
            put_cstr(b, "");
            b.put_i32(0);
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', |_| {})
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', |_| {})
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        })
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| b.put_slice(&self.data))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: Oid,
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    NoData,

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    /// Any other message the driver does not act on (notifications, ...)
    Other { tag: u8 },
}

impl BackendMessage {
    /// Decode one complete backend message.
    ///
    /// The input buffer must start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        need(buf, 5)?;
        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize - 4;
        need(buf, len)?;
        let mut body = buf.split_to(len);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            }),
            b'Z' => {
                need(&body, 1)?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            }),
            b'K' => {
                need(&body, 8)?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            tag => Ok(BackendMessage::Other { tag }),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4)?;
        match body.get_i32() {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            other => Err(PgError::Auth(format!(
                "Unsupported authentication method: {}",
                other
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            // table oid (4), column attr (2), type oid (4), size (2), modifier (4), format (2)
            need(&body, 18)?;
            body.advance(6);
            let type_oid = Oid::from_i32(body.get_i32());
            body.advance(8);
            fields.push(FieldDescription { name, type_oid });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol(format!(
            "Truncated message: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(&mut body)?);
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
