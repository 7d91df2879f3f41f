//! PostgreSQL v3 wire protocol server.
//!
//! Message framing plus the per-connection state machine for the simple-query
//! flow: startup (with SSL refusal), `Query`, result encoding, and error
//! responses. Every numeric field is network byte order; tagged messages
//! carry a four-byte length that includes itself.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::executor::{self, RecordBatch};
use crate::NodeState;

/// Protocol version magic carried by an SSLRequest startup packet.
const VERSION_SSL: i32 = 80877103;
/// Upper bound on accepted frame sizes.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Run-time parameters reported to every client after authentication.
const SERVER_PARAMETERS: &[(&str, &str)] = &[
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO YMD"),
    ("integer_datetimes", "on"),
    ("server_version", "17.0"),
];

#[derive(Debug)]
pub enum FrontendMessage {
    SslRequest,
    Startup { params: Vec<(String, String)> },
    Query { sql: String },
    Terminate,
}

#[derive(Debug)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
    pub type_len: i16,
}

#[derive(Debug)]
pub enum BackendMessage {
    SslRefused,
    AuthenticationOk,
    ParameterStatus(&'static str, &'static str),
    BackendKeyData { process_id: u32, secret_key: u32 },
    ReadyForQuery,
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<String>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(String),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DecodeState {
    /// Expecting an untagged, length-prefixed startup packet.
    Startup,
    /// Expecting a tag byte plus length.
    Head,
    /// Waiting for the body of a tagged message.
    Data(u8, usize),
}

pub struct PgCodec {
    decode_state: DecodeState,
}

impl PgCodec {
    pub fn new() -> PgCodec {
        PgCodec {
            decode_state: DecodeState::Startup,
        }
    }

    /// Expect another startup packet (after an SSL refusal).
    pub fn reset_to_startup(&mut self) {
        self.decode_state = DecodeState::Startup;
    }
}

impl Default for PgCodec {
    fn default() -> PgCodec {
        PgCodec::new()
    }
}

fn parse_frame_len(src: &[u8]) -> Result<usize, io::Error> {
    let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if declared < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid frame length",
        ));
    }
    let body = declared - 4;
    if body > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too big"));
    }
    Ok(body)
}

fn input_err(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

impl Decoder for PgCodec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrontendMessage>, io::Error> {
        loop {
            match self.decode_state {
                DecodeState::Startup => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let frame_len = parse_frame_len(&src[..4])?;
                    if src.len() < frame_len + 4 {
                        src.reserve(frame_len + 4 - src.len());
                        return Ok(None);
                    }
                    src.advance(4);
                    let body = src.split_to(frame_len);
                    self.decode_state = DecodeState::Head;
                    return Ok(Some(decode_startup(&body)?));
                }
                DecodeState::Head => {
                    if src.len() < 5 {
                        return Ok(None);
                    }
                    let tag = src[0];
                    let frame_len = parse_frame_len(&src[1..5])?;
                    src.advance(5);
                    src.reserve(frame_len);
                    self.decode_state = DecodeState::Data(tag, frame_len);
                }
                DecodeState::Data(tag, frame_len) => {
                    if src.len() < frame_len {
                        return Ok(None);
                    }
                    let body = src.split_to(frame_len);
                    self.decode_state = DecodeState::Head;
                    return Ok(Some(decode_tagged(tag, &body)?));
                }
            }
        }
    }
}

fn decode_startup(body: &[u8]) -> Result<FrontendMessage, io::Error> {
    // An 8-byte packet whose body is the SSL magic is an SSLRequest; every
    // other packet is a StartupMessage.
    if body.len() == 4 && i32::from_be_bytes([body[0], body[1], body[2], body[3]]) == VERSION_SSL {
        return Ok(FrontendMessage::SslRequest);
    }
    if body.len() < 4 {
        return Err(input_err("startup packet too short"));
    }
    let mut cursor = &body[4..];
    let mut params = Vec::new();
    loop {
        let Some(key) = read_cstr(&mut cursor)? else {
            break;
        };
        if key.is_empty() {
            break;
        }
        let value = read_cstr(&mut cursor)?.unwrap_or_default();
        params.push((key, value));
    }
    Ok(FrontendMessage::Startup { params })
}

/// Read one NUL-terminated string, or `None` at end of buffer.
fn read_cstr(cursor: &mut &[u8]) -> Result<Option<String>, io::Error> {
    if cursor.is_empty() {
        return Ok(None);
    }
    let Some(end) = cursor.iter().position(|b| *b == 0) else {
        return Err(input_err("string without terminator"));
    };
    let value = std::str::from_utf8(&cursor[..end])
        .map_err(|_| input_err("string is not valid UTF-8"))?
        .to_string();
    *cursor = &cursor[end + 1..];
    Ok(Some(value))
}

fn decode_tagged(tag: u8, body: &[u8]) -> Result<FrontendMessage, io::Error> {
    match tag {
        b'Q' => {
            let mut cursor = body;
            let sql = read_cstr(&mut cursor)?
                .ok_or_else(|| input_err("query message without string"))?;
            Ok(FrontendMessage::Query { sql })
        }
        b'X' => Ok(FrontendMessage::Terminate),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown message type {other}"),
        )),
    }
}

fn put_cstr(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}

impl Encoder<BackendMessage> for PgCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: BackendMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        // The SSL refusal is a bare byte with no length framing.
        if let BackendMessage::SslRefused = msg {
            dst.put_u8(b'N');
            return Ok(());
        }

        let tag = match &msg {
            BackendMessage::SslRefused => unreachable!(),
            BackendMessage::AuthenticationOk => b'R',
            BackendMessage::ParameterStatus(_, _) => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ReadyForQuery => b'Z',
            BackendMessage::RowDescription(_) => b'T',
            BackendMessage::DataRow(_) => b'D',
            BackendMessage::CommandComplete(_) => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ErrorResponse(_) => b'E',
        };
        dst.put_u8(tag);

        // Length placeholder, patched once the body is written.
        let len_offset = dst.len();
        dst.put_u32(0);

        match msg {
            BackendMessage::SslRefused => unreachable!(),
            BackendMessage::AuthenticationOk => dst.put_u32(0),
            BackendMessage::ParameterStatus(name, value) => {
                put_cstr(dst, name);
                put_cstr(dst, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                dst.put_u32(process_id);
                dst.put_u32(secret_key);
            }
            BackendMessage::ReadyForQuery => dst.put_u8(b'I'),
            BackendMessage::RowDescription(fields) => {
                dst.put_u16(fields.len() as u16);
                for field in &fields {
                    put_cstr(dst, &field.name);
                    dst.put_u32(0); // table OID
                    dst.put_u16(0); // column attribute number
                    dst.put_u32(field.type_oid);
                    dst.put_i16(field.type_len);
                    dst.put_i32(0); // type modifier
                    dst.put_u16(0); // format code: text
                }
            }
            BackendMessage::DataRow(cells) => {
                dst.put_u16(cells.len() as u16);
                for cell in &cells {
                    dst.put_i32(cell.len() as i32);
                    dst.put_slice(cell.as_bytes());
                }
            }
            BackendMessage::CommandComplete(tag_text) => put_cstr(dst, &tag_text),
            BackendMessage::EmptyQueryResponse => {}
            BackendMessage::ErrorResponse(message) => {
                dst.put_u8(b'S');
                put_cstr(dst, "ERROR");
                dst.put_u8(b'C');
                put_cstr(dst, "XX000");
                dst.put_u8(b'M');
                put_cstr(dst, &message);
                dst.put_u8(0);
            }
        }

        let frame_len = (dst.len() - len_offset) as u32;
        dst[len_offset..len_offset + 4].copy_from_slice(&frame_len.to_be_bytes());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub async fn serve(listener: TcpListener, state: Arc<NodeState>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                debug!(error = ?err, peer = %peer, "client connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<NodeState>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, PgCodec::new());

    // Startup phase: refuse SSL if asked, then greet the client.
    loop {
        let Some(msg) = framed.next().await else {
            return Ok(());
        };
        match msg? {
            FrontendMessage::SslRequest => {
                framed.send(BackendMessage::SslRefused).await?;
                framed.codec_mut().reset_to_startup();
            }
            FrontendMessage::Startup { params } => {
                for (key, value) in &params {
                    debug!(key = %key, value = %value, "startup parameter");
                }
                framed.feed(BackendMessage::AuthenticationOk).await?;
                for &(name, value) in SERVER_PARAMETERS {
                    framed
                        .feed(BackendMessage::ParameterStatus(name, value))
                        .await?;
                }
                let secret_key = rand::thread_rng().gen();
                framed
                    .feed(BackendMessage::BackendKeyData {
                        process_id: std::process::id(),
                        secret_key,
                    })
                    .await?;
                framed.feed(BackendMessage::ReadyForQuery).await?;
                framed.flush().await?;
                break;
            }
            other => anyhow::bail!("unexpected message during startup: {other:?}"),
        }
    }

    // Query phase: one reply sequence per Query message, in order.
    while let Some(msg) = framed.next().await {
        match msg? {
            FrontendMessage::Query { sql } => {
                crate::stats::NodeStats::bump(&state.stats.queries);
                match executor::execute(&state, &sql).await {
                    Ok(batch) => send_batch(&mut framed, &batch).await?,
                    Err(err) => {
                        crate::stats::NodeStats::bump(&state.stats.statement_errors);
                        framed
                            .feed(BackendMessage::ErrorResponse(err.to_string()))
                            .await?;
                        framed.feed(BackendMessage::ReadyForQuery).await?;
                        framed.flush().await?;
                    }
                }
            }
            FrontendMessage::Terminate => return Ok(()),
            other => anyhow::bail!("unexpected message in query phase: {other:?}"),
        }
    }
    Ok(())
}

async fn send_batch(
    framed: &mut Framed<TcpStream, PgCodec>,
    batch: &RecordBatch,
) -> anyhow::Result<()> {
    if batch.num_rows() == 0 {
        framed.feed(BackendMessage::EmptyQueryResponse).await?;
        framed.feed(BackendMessage::ReadyForQuery).await?;
        framed.flush().await?;
        return Ok(());
    }

    let fields = batch
        .fields
        .iter()
        .map(|field| FieldDescription {
            name: field.name.clone(),
            type_oid: field.data_type.pg_oid(),
            type_len: field.data_type.pg_len(),
        })
        .collect();
    framed.feed(BackendMessage::RowDescription(fields)).await?;
    for row in 0..batch.num_rows() {
        let cells = (0..batch.num_columns())
            .map(|column| batch.cell_text(row, column))
            .collect();
        framed.feed(BackendMessage::DataRow(cells)).await?;
    }
    framed
        .feed(BackendMessage::CommandComplete(format!(
            "SELECT {}",
            batch.num_rows()
        )))
        .await?;
    framed.feed(BackendMessage::ReadyForQuery).await?;
    framed.flush().await?;
    Ok(())
}
