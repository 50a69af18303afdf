use crate::buffer::{put_annotations, put_bytes, put_string, put_uuid, ReadBuffer};
use crate::frame::Message;
use crate::messages::{
    Capabilities, Cardinality, CommandParams, OutputFormat, ProtocolVersion,
};
use bytes::{BufMut, Bytes, BytesMut};
use strata_core::{StrataError, TypeId};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// 'V' - protocol version and connection parameters
    ClientHandshake {
        version: ProtocolVersion,
        params: Vec<(String, String)>,
    },
    /// 'p' - first SASL message
    SaslInitialResponse { method: String, data: Bytes },
    /// 'r' - subsequent SASL message
    SaslResponse { data: Bytes },
    /// 'P' - compile a command and describe its input/output
    Parse(CommandParams),
    /// 'O' - run a command with encoded arguments
    Execute {
        params: CommandParams,
        input_type: TypeId,
        output_type: TypeId,
        arguments: Bytes,
    },
    /// 'S'
    Sync,
    /// 'H'
    Flush,
    /// 'X'
    Terminate,
}

impl ClientMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ClientMessage::ClientHandshake { .. } => b'V',
            ClientMessage::SaslInitialResponse { .. } => b'p',
            ClientMessage::SaslResponse { .. } => b'r',
            ClientMessage::Parse(_) => b'P',
            ClientMessage::Execute { .. } => b'O',
            ClientMessage::Sync => b'S',
            ClientMessage::Flush => b'H',
            ClientMessage::Terminate => b'X',
        }
    }

    pub fn encode(&self) -> Message {
        let mut body = BytesMut::new();
        match self {
            ClientMessage::ClientHandshake { version, params } => {
                body.put_u16(version.major);
                body.put_u16(version.minor);
                body.put_u16(params.len() as u16);
                for (name, value) in params {
                    put_string(&mut body, name);
                    put_string(&mut body, value);
                }
                // no protocol extensions requested
                body.put_u16(0);
            }
            ClientMessage::SaslInitialResponse { method, data } => {
                put_string(&mut body, method);
                put_bytes(&mut body, data);
            }
            ClientMessage::SaslResponse { data } => put_bytes(&mut body, data),
            ClientMessage::Parse(params) => put_command_params(&mut body, params),
            ClientMessage::Execute {
                params,
                input_type,
                output_type,
                arguments,
            } => {
                put_command_params(&mut body, params);
                put_uuid(&mut body, input_type);
                put_uuid(&mut body, output_type);
                put_bytes(&mut body, arguments);
            }
            ClientMessage::Sync | ClientMessage::Flush | ClientMessage::Terminate => {}
        }
        Message::new(self.tag(), body.freeze())
    }

    /// Server-side parsing, used by test peers and proxies.
    pub fn decode(msg: Message) -> Result<Self, StrataError> {
        let mut buf = ReadBuffer::for_message(msg.body);
        let decoded = match msg.tag {
            b'V' => {
                let version = ProtocolVersion {
                    major: buf.get_u16()?,
                    minor: buf.get_u16()?,
                };
                let count = buf.get_u16()?;
                let mut params = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = buf.get_string()?;
                    let value = buf.get_string()?;
                    params.push((name, value));
                }
                let extensions = buf.get_u16()?;
                for _ in 0..extensions {
                    buf.get_string()?;
                    buf.get_annotations()?;
                }
                ClientMessage::ClientHandshake { version, params }
            }
            b'p' => ClientMessage::SaslInitialResponse {
                method: buf.get_string()?,
                data: buf.get_bytes()?,
            },
            b'r' => ClientMessage::SaslResponse {
                data: buf.get_bytes()?,
            },
            b'P' => ClientMessage::Parse(get_command_params(&mut buf)?),
            b'O' => ClientMessage::Execute {
                params: get_command_params(&mut buf)?,
                input_type: buf.get_uuid()?,
                output_type: buf.get_uuid()?,
                arguments: buf.get_bytes()?,
            },
            b'S' => ClientMessage::Sync,
            b'H' => ClientMessage::Flush,
            b'X' => ClientMessage::Terminate,
            other => {
                return Err(StrataError::framing(format!(
                    "unknown client message type 0x{other:02x}"
                )))
            }
        };
        buf.finish()?;
        Ok(decoded)
    }
}

fn put_command_params(body: &mut BytesMut, params: &CommandParams) {
    put_annotations(body, &params.annotations);
    body.put_u64(params.allowed_capabilities.0);
    body.put_u64(params.compilation_flags);
    body.put_u64(params.implicit_limit);
    body.put_u8(params.output_format.wire_byte());
    body.put_u8(params.expected_cardinality.wire_byte());
    put_string(body, &params.command_text);
}

fn get_command_params(buf: &mut ReadBuffer) -> Result<CommandParams, StrataError> {
    Ok(CommandParams {
        annotations: buf.get_annotations()?,
        allowed_capabilities: Capabilities(buf.get_u64()?),
        compilation_flags: buf.get_u64()?,
        implicit_limit: buf.get_u64()?,
        output_format: OutputFormat::from_wire(buf.get_u8()?)?,
        expected_cardinality: Cardinality::from_wire(buf.get_u8()?)?,
        command_text: buf.get_string()?,
    })
}
