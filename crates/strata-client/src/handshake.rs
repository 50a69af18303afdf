//! Connection setup as a typestate: each phase is a distinct type, so a
//! half-initialised connection cannot be used to run commands.

use crate::auth::{ScramClient, SCRAM_SHA_256};
use crate::config::ConnectConfig;
use crate::connection::{unexpected, Connection};
use crate::settings::ServerSettings;
use crate::state::ConnectionState;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::marker::PhantomData;
use strata_core::StrataError;
use strata_protocol::backend::{Authentication, ServerMessage};
use strata_protocol::frame::MessageCodec;
use strata_protocol::frontend::ClientMessage;
use strata_protocol::messages::{ProtocolVersion, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub trait Phase {
    const STATE: ConnectionState;
}

/// Transport open, nothing sent yet.
#[derive(Debug)]
pub struct Connecting;
/// ClientHandshake sent, waiting for the server's answer.
#[derive(Debug)]
pub struct Handshaking;
/// Authenticated, waiting for session data and the first ReadyForCommand.
#[derive(Debug)]
pub struct Authenticating;

impl Phase for Connecting {
    const STATE: ConnectionState = ConnectionState::Connecting;
}

impl Phase for Handshaking {
    const STATE: ConnectionState = ConnectionState::Handshaking;
}

impl Phase for Authenticating {
    const STATE: ConnectionState = ConnectionState::Authenticating;
}

pub struct Handshake<S, P> {
    framed: Framed<S, MessageCodec>,
    config: ConnectConfig,
    settings: ServerSettings,
    server_version: ProtocolVersion,
    _phase: PhantomData<P>,
}

impl<S, P: Phase> Handshake<S, P> {
    pub fn state(&self) -> ConnectionState {
        P::STATE
    }

    pub fn server_version(&self) -> ProtocolVersion {
        self.server_version
    }

    fn into_phase<N>(self) -> Handshake<S, N> {
        Handshake {
            framed: self.framed,
            config: self.config,
            settings: self.settings,
            server_version: self.server_version,
            _phase: PhantomData,
        }
    }
}

impl<S, P> Handshake<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Phase,
{
    async fn send(&mut self, msg: ClientMessage) -> Result<(), StrataError> {
        self.framed.send(msg.encode()).await
    }

    async fn recv(&mut self) -> Result<ServerMessage, StrataError> {
        loop {
            let msg = match self.framed.next().await {
                Some(Ok(msg)) => ServerMessage::decode(msg)?,
                Some(Err(err)) => return Err(err),
                None => return Err(StrataError::ConnectionClosed),
            };
            match msg {
                ServerMessage::LogMessage(log) => {
                    debug!(code = log.code, severity = %log.severity, "{}", log.text);
                }
                ServerMessage::ParameterStatus { name, value } => self.settings.set(&name, value),
                other => return Ok(other),
            }
        }
    }
}

impl<S> Handshake<S, Connecting>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: &ConnectConfig) -> Result<Self, StrataError> {
        config.validate()?;
        let codec = MessageCodec::with_max_message_size(config.max_message_size);
        Ok(Self {
            framed: Framed::new(stream, codec),
            config: config.clone(),
            settings: ServerSettings::default(),
            server_version: PROTOCOL_VERSION,
            _phase: PhantomData,
        })
    }

    pub async fn start(mut self) -> Result<Handshake<S, Handshaking>, StrataError> {
        debug!(user = %self.config.user, database = %self.config.database, "sending handshake");
        let hello = ClientMessage::ClientHandshake {
            version: PROTOCOL_VERSION,
            params: self.config.handshake_params(),
        };
        self.send(hello).await?;
        Ok(self.into_phase())
    }
}

impl<S> Handshake<S, Handshaking>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Settles the protocol version and runs whatever authentication the
    /// server asks for.
    pub async fn authenticate(mut self) -> Result<Handshake<S, Authenticating>, StrataError> {
        loop {
            match self.recv().await? {
                ServerMessage::ServerHandshake { version, .. } => {
                    if !version.is_supported() {
                        return Err(StrataError::framing(format!(
                            "server requires unsupported protocol version {}.{}",
                            version.major, version.minor
                        )));
                    }
                    debug!(major = version.major, minor = version.minor, "server adjusted protocol version");
                    self.server_version = version;
                }
                ServerMessage::Authentication(Authentication::Ok) => break,
                ServerMessage::Authentication(Authentication::Sasl { methods }) => {
                    self.sasl(&methods).await?;
                    break;
                }
                ServerMessage::ErrorResponse(err) => return Err(StrataError::Server(err)),
                other => return Err(unexpected(&other, "handshake")),
            }
        }
        Ok(self.into_phase())
    }

    async fn sasl(&mut self, methods: &[String]) -> Result<(), StrataError> {
        if !methods.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(StrataError::Authentication(format!(
                "no supported authentication method among {methods:?}"
            )));
        }
        let password = self
            .config
            .password
            .clone()
            .ok_or_else(|| StrataError::Authentication("server requires a password".into()))?;
        let mut scram = ScramClient::new(&self.config.user, &password);

        let first = scram.client_first()?;
        self.send(ClientMessage::SaslInitialResponse {
            method: SCRAM_SHA_256.to_string(),
            data: Bytes::from(first),
        })
        .await?;

        let server_first = match self.recv().await? {
            ServerMessage::Authentication(Authentication::SaslContinue { data }) => data,
            ServerMessage::ErrorResponse(err) => return Err(rejected(err)),
            other => return Err(unexpected(&other, "authentication")),
        };
        let client_final = scram.handle_server_first(&server_first)?;
        self.send(ClientMessage::SaslResponse {
            data: Bytes::from(client_final),
        })
        .await?;

        match self.recv().await? {
            ServerMessage::Authentication(Authentication::SaslFinal { data }) => {
                scram.verify_server_final(&data)?
            }
            ServerMessage::ErrorResponse(err) => return Err(rejected(err)),
            other => return Err(unexpected(&other, "authentication")),
        }
        match self.recv().await? {
            ServerMessage::Authentication(Authentication::Ok) => Ok(()),
            ServerMessage::ErrorResponse(err) => Err(rejected(err)),
            other => Err(unexpected(&other, "authentication")),
        }
    }
}

fn rejected(err: strata_core::ServerError) -> StrataError {
    warn!(code = err.code, "authentication rejected");
    StrataError::Authentication(err.message)
}

impl<S> Handshake<S, Authenticating>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Collects session data up to the first ReadyForCommand.
    pub async fn finish(mut self) -> Result<Connection<S>, StrataError> {
        let status = loop {
            match self.recv().await? {
                ServerMessage::ServerKeyData { data } => self.settings.set_key_data(data),
                ServerMessage::ReadyForCommand { status, .. } => break status,
                ServerMessage::ErrorResponse(err) => return Err(StrataError::Server(err)),
                other => return Err(unexpected(&other, "session setup")),
            }
        };
        info!(
            host = %self.config.host,
            database = %self.config.database,
            params = self.settings.len(),
            "connection ready"
        );
        Ok(Connection::new(
            self.framed,
            &self.config,
            self.settings,
            status,
        ))
    }
}
