//! NATS core text protocol framing.

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a message payload, matching the server default
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Longest unterminated line buffered before the peer is considered broken.
const MAX_CONTROL_LINE: usize = 64 * 1024;

/// Server INFO block. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub proto: i32,
    pub headers: bool,
    pub connect_urls: Vec<String>,
    pub ws_connect_urls: Vec<String>,
}

/// CONNECT options sent after INFO
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: u8,
    pub echo: bool,
}

impl ConnectInfo {
    pub fn new(name: Option<String>) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name,
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            echo: true,
        }
    }
}

/// Operations received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Operations sent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Codec for the client side of the NATS protocol.
///
/// Lines are terminated by CRLF on the wire; a bare LF is accepted too.
#[derive(Debug, Clone)]
pub struct NatsCodec {
    max_payload: usize,
}

impl Default for NatsCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl NatsCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(message.into())
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, Error> {
    field
        .parse()
        .map_err(|_| protocol_error(format!("invalid {}: {:?}", what, field)))
}

impl Decoder for NatsCodec {
    type Item = ServerOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, Error> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_CONTROL_LINE {
                return Err(protocol_error("control line too long"));
            }
            return Ok(None);
        };

        let line_end = if newline > 0 && src[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };
        let line = std::str::from_utf8(&src[..line_end])
            .map_err(|_| protocol_error("control line is not UTF-8"))?
            .to_string();

        let (op, args) = match line.split_once(|c: char| c == ' ' || c == '\t') {
            Some((op, args)) => (op, args.trim()),
            None => (line.as_str(), ""),
        };

        let item = match op.to_ascii_uppercase().as_str() {
            "MSG" => {
                let fields: Vec<&str> = args.split_whitespace().collect();
                let (subject, sid, reply, size) = match fields.as_slice() {
                    [subject, sid, size] => (*subject, *sid, None, *size),
                    [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
                    _ => return Err(protocol_error(format!("malformed MSG: {:?}", line))),
                };
                let sid = parse_number(sid, "sid")?;
                let size: usize = parse_number(size, "payload size")?;
                if size > self.max_payload {
                    return Err(protocol_error(format!(
                        "payload of {} bytes exceeds {}",
                        size, self.max_payload
                    )));
                }

                // Wait until the payload and its trailing CRLF are buffered
                let total = newline + 1 + size + 2;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }

                let subject = subject.to_string();
                src.advance(newline + 1);
                let payload = src.split_to(size).freeze();
                if &src[..2] != b"\r\n" {
                    return Err(protocol_error("payload not terminated by CRLF"));
                }
                src.advance(2);

                return Ok(Some(ServerOp::Msg {
                    subject,
                    sid,
                    reply,
                    payload,
                }));
            }
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(args.trim_matches('\'').to_string()),
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(args)
                    .map_err(|e| protocol_error(format!("invalid INFO: {}", e)))?;
                ServerOp::Info(Box::new(info))
            }
            _ => return Err(protocol_error(format!("unknown operation: {:?}", line))),
        };

        src.advance(newline + 1);
        Ok(Some(item))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, Error> {
        match self.decode(src)? {
            Some(op) => Ok(Some(op)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-operation",
            ))),
        }
    }
}

impl Encoder<ClientOp> for NatsCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<(), Error> {
        match item {
            ClientOp::Connect(info) => {
                let json = serde_json::to_string(&info)
                    .map_err(|e| protocol_error(format!("encoding CONNECT: {}", e)))?;
                dst.reserve(json.len() + 10);
                dst.put_slice(b"CONNECT ");
                dst.put_slice(json.as_bytes());
                dst.put_slice(b"\r\n");
            }
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                if payload.len() > self.max_payload {
                    return Err(protocol_error(format!(
                        "payload of {} bytes exceeds {}",
                        payload.len(),
                        self.max_payload
                    )));
                }
                let line = match reply {
                    Some(reply) => format!("PUB {} {} {}\r\n", subject, reply, payload.len()),
                    None => format!("PUB {} {}\r\n", subject, payload.len()),
                };
                dst.reserve(line.len() + payload.len() + 2);
                dst.put_slice(line.as_bytes());
                dst.put_slice(&payload);
                dst.put_slice(b"\r\n");
            }
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => {
                let line = match queue_group {
                    Some(queue) => format!("SUB {} {} {}\r\n", subject, queue, sid),
                    None => format!("SUB {} {}\r\n", subject, sid),
                };
                dst.put_slice(line.as_bytes());
            }
            ClientOp::Unsub { sid, max } => {
                let line = match max {
                    Some(max) => format!("UNSUB {} {}\r\n", sid, max),
                    None => format!("UNSUB {}\r\n", sid),
                };
                dst.put_slice(line.as_bytes());
            }
            ClientOp::Ping => dst.put_slice(b"PING\r\n"),
            ClientOp::Pong => dst.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }
}

/// Check a subject for publish (`wildcards == false`) or subscribe.
pub fn validate_subject(subject: &str, wildcards: bool) -> Result<(), Error> {
    if subject.is_empty() {
        return Err(protocol_error("empty subject"));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(protocol_error(format!("subject contains whitespace: {:?}", subject)));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return Err(protocol_error(format!("empty token in subject {:?}", subject))),
            "*" | ">" if !wildcards => {
                return Err(protocol_error(format!("wildcard in publish subject {:?}", subject)))
            }
            ">" if i != tokens.len() - 1 => {
                return Err(protocol_error(format!("'>' must be the last token in {:?}", subject)))
            }
            _ => {}
        }
    }
    Ok(())
}
