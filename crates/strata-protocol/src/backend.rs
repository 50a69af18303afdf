use crate::buffer::{put_annotations, put_bytes, put_string, put_uuid, ReadBuffer};
use crate::frame::Message;
use crate::messages::{Capabilities, Cardinality, ProtocolVersion, TransactionStatus};
use bytes::{BufMut, Bytes, BytesMut};
use strata_core::{ServerError, Severity, StrataError, TypeId};

pub const AUTH_OK: u32 = 0x00;
pub const AUTH_SASL: u32 = 0x0A;
pub const AUTH_SASL_CONTINUE: u32 = 0x0B;
pub const AUTH_SASL_FINAL: u32 = 0x0C;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    Sasl { methods: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDataDescription {
    pub annotations: Vec<(String, String)>,
    pub capabilities: Capabilities,
    pub result_cardinality: Cardinality,
    pub input_type: TypeId,
    pub input_descriptors: Bytes,
    pub output_type: TypeId,
    pub output_descriptors: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub severity: Severity,
    pub code: u32,
    pub text: String,
    pub annotations: Vec<(String, String)>,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// 'v' - the server proposes a different protocol version
    ServerHandshake {
        version: ProtocolVersion,
        extensions: Vec<(String, Vec<(String, String)>)>,
    },
    /// 'R'
    Authentication(Authentication),
    /// 'K' - opaque key identifying this session to the server
    ServerKeyData { data: [u8; 32] },
    /// 'S'
    ParameterStatus { name: Bytes, value: Bytes },
    /// 'Z'
    ReadyForCommand {
        annotations: Vec<(String, String)>,
        status: TransactionStatus,
    },
    /// 'T'
    CommandDataDescription(CommandDataDescription),
    /// 'D' - one encoded result row
    Data { payload: Bytes },
    /// 'C'
    CommandComplete {
        annotations: Vec<(String, String)>,
        capabilities: Capabilities,
        status: String,
    },
    /// 'E'
    ErrorResponse(ServerError),
    /// 'L'
    LogMessage(LogMessage),
}

impl ServerMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ServerMessage::ServerHandshake { .. } => b'v',
            ServerMessage::Authentication(_) => b'R',
            ServerMessage::ServerKeyData { .. } => b'K',
            ServerMessage::ParameterStatus { .. } => b'S',
            ServerMessage::ReadyForCommand { .. } => b'Z',
            ServerMessage::CommandDataDescription(_) => b'T',
            ServerMessage::Data { .. } => b'D',
            ServerMessage::CommandComplete { .. } => b'C',
            ServerMessage::ErrorResponse(_) => b'E',
            ServerMessage::LogMessage(_) => b'L',
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ServerHandshake { .. } => "ServerHandshake",
            ServerMessage::Authentication(_) => "Authentication",
            ServerMessage::ServerKeyData { .. } => "ServerKeyData",
            ServerMessage::ParameterStatus { .. } => "ParameterStatus",
            ServerMessage::ReadyForCommand { .. } => "ReadyForCommand",
            ServerMessage::CommandDataDescription(_) => "CommandDataDescription",
            ServerMessage::Data { .. } => "Data",
            ServerMessage::CommandComplete { .. } => "CommandComplete",
            ServerMessage::ErrorResponse(_) => "ErrorResponse",
            ServerMessage::LogMessage(_) => "LogMessage",
        }
    }

    pub fn decode(msg: Message) -> Result<Self, StrataError> {
        let mut buf = ReadBuffer::for_message(msg.body);
        let decoded = match msg.tag {
            b'v' => {
                let version = ProtocolVersion {
                    major: buf.get_u16()?,
                    minor: buf.get_u16()?,
                };
                let count = buf.get_u16()?;
                let mut extensions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = buf.get_string()?;
                    let annotations = buf.get_annotations()?;
                    extensions.push((name, annotations));
                }
                ServerMessage::ServerHandshake {
                    version,
                    extensions,
                }
            }
            b'R' => ServerMessage::Authentication(get_authentication(&mut buf)?),
            b'K' => {
                let raw = buf.take(32)?;
                let mut data = [0u8; 32];
                data.copy_from_slice(&raw);
                ServerMessage::ServerKeyData { data }
            }
            b'S' => ServerMessage::ParameterStatus {
                name: buf.get_bytes()?,
                value: buf.get_bytes()?,
            },
            b'Z' => ServerMessage::ReadyForCommand {
                annotations: buf.get_annotations()?,
                status: TransactionStatus::from_wire(buf.get_u8()?)?,
            },
            b'T' => ServerMessage::CommandDataDescription(CommandDataDescription {
                annotations: buf.get_annotations()?,
                capabilities: Capabilities(buf.get_u64()?),
                result_cardinality: Cardinality::from_wire(buf.get_u8()?)?,
                input_type: buf.get_uuid()?,
                input_descriptors: buf.get_bytes()?,
                output_type: buf.get_uuid()?,
                output_descriptors: buf.get_bytes()?,
            }),
            b'D' => {
                let chunks = buf.get_u16()?;
                if chunks != 1 {
                    return Err(StrataError::framing(format!(
                        "data message carries {chunks} chunks, expected 1"
                    )));
                }
                let payload = buf
                    .get_element()?
                    .ok_or_else(|| StrataError::framing("data message with NULL payload"))?;
                ServerMessage::Data { payload }
            }
            b'C' => ServerMessage::CommandComplete {
                annotations: buf.get_annotations()?,
                capabilities: Capabilities(buf.get_u64()?),
                status: buf.get_string()?,
            },
            b'E' => {
                let severity = Severity(buf.get_u8()?);
                let code = buf.get_u32()?;
                let message = buf.get_string()?;
                let count = buf.get_u16()?;
                let mut attributes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = buf.get_u16()?;
                    let value = buf.get_bytes()?;
                    attributes.push((key, value.to_vec()));
                }
                ServerMessage::ErrorResponse(ServerError {
                    severity,
                    code,
                    message,
                    attributes,
                })
            }
            b'L' => ServerMessage::LogMessage(LogMessage {
                severity: Severity(buf.get_u8()?),
                code: buf.get_u32()?,
                text: buf.get_string()?,
                annotations: buf.get_annotations()?,
            }),
            other => {
                return Err(StrataError::framing(format!(
                    "unknown server message type 0x{other:02x}"
                )))
            }
        };
        buf.finish()?;
        Ok(decoded)
    }

    /// Server-side serialization, used by test peers and proxies.
    pub fn encode(&self) -> Message {
        let mut body = BytesMut::new();
        match self {
            ServerMessage::ServerHandshake {
                version,
                extensions,
            } => {
                body.put_u16(version.major);
                body.put_u16(version.minor);
                body.put_u16(extensions.len() as u16);
                for (name, annotations) in extensions {
                    put_string(&mut body, name);
                    put_annotations(&mut body, annotations);
                }
            }
            ServerMessage::Authentication(auth) => match auth {
                Authentication::Ok => body.put_u32(AUTH_OK),
                Authentication::Sasl { methods } => {
                    body.put_u32(AUTH_SASL);
                    body.put_u32(methods.len() as u32);
                    for method in methods {
                        put_string(&mut body, method);
                    }
                }
                Authentication::SaslContinue { data } => {
                    body.put_u32(AUTH_SASL_CONTINUE);
                    put_bytes(&mut body, data);
                }
                Authentication::SaslFinal { data } => {
                    body.put_u32(AUTH_SASL_FINAL);
                    put_bytes(&mut body, data);
                }
            },
            ServerMessage::ServerKeyData { data } => body.extend_from_slice(data),
            ServerMessage::ParameterStatus { name, value } => {
                put_bytes(&mut body, name);
                put_bytes(&mut body, value);
            }
            ServerMessage::ReadyForCommand {
                annotations,
                status,
            } => {
                put_annotations(&mut body, annotations);
                body.put_u8(status.wire_byte());
            }
            ServerMessage::CommandDataDescription(desc) => {
                put_annotations(&mut body, &desc.annotations);
                body.put_u64(desc.capabilities.0);
                body.put_u8(desc.result_cardinality.wire_byte());
                put_uuid(&mut body, &desc.input_type);
                put_bytes(&mut body, &desc.input_descriptors);
                put_uuid(&mut body, &desc.output_type);
                put_bytes(&mut body, &desc.output_descriptors);
            }
            ServerMessage::Data { payload } => {
                body.put_u16(1);
                body.put_i32(payload.len() as i32);
                body.extend_from_slice(payload);
            }
            ServerMessage::CommandComplete {
                annotations,
                capabilities,
                status,
            } => {
                put_annotations(&mut body, annotations);
                body.put_u64(capabilities.0);
                put_string(&mut body, status);
            }
            ServerMessage::ErrorResponse(err) => {
                body.put_u8(err.severity.0);
                body.put_u32(err.code);
                put_string(&mut body, &err.message);
                body.put_u16(err.attributes.len() as u16);
                for (key, value) in &err.attributes {
                    body.put_u16(*key);
                    put_bytes(&mut body, value);
                }
            }
            ServerMessage::LogMessage(log) => {
                body.put_u8(log.severity.0);
                body.put_u32(log.code);
                put_string(&mut body, &log.text);
                put_annotations(&mut body, &log.annotations);
            }
        }
        Message::new(self.tag(), body.freeze())
    }
}

fn get_authentication(buf: &mut ReadBuffer) -> Result<Authentication, StrataError> {
    match buf.get_u32()? {
        AUTH_OK => Ok(Authentication::Ok),
        AUTH_SASL => {
            let count = buf.get_u32()?;
            let mut methods = Vec::new();
            for _ in 0..count {
                methods.push(buf.get_string()?);
            }
            Ok(Authentication::Sasl { methods })
        }
        AUTH_SASL_CONTINUE => Ok(Authentication::SaslContinue {
            data: buf.get_bytes()?,
        }),
        AUTH_SASL_FINAL => Ok(Authentication::SaslFinal {
            data: buf.get_bytes()?,
        }),
        other => Err(StrataError::framing(format!(
            "unknown authentication status 0x{other:02x}"
        ))),
    }
}
