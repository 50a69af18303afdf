use crate::config::ConnectConfig;
use crate::query_cache::{PreparedCommand, QueryCache};
use crate::rows::RowStream;
use crate::settings::ServerSettings;
use crate::state::ConnectionState;
use crate::transaction::{Transaction, TransactionOptions};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use strata_codec::{CodecRegistry, DecodeOptions, RowDecoder};
use strata_core::{ServerError, Severity, StrataError, Value};
use strata_protocol::backend::{CommandDataDescription, LogMessage, ServerMessage};
use strata_protocol::descriptor::DescriptorTable;
use strata_protocol::frame::{Message, MessageCodec};
use strata_protocol::frontend::ClientMessage;
use strata_protocol::messages::{
    Capabilities, Cardinality, CommandParams, OutputFormat, TransactionStatus,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type LogListener = Box<dyn Fn(&LogMessage) + Send + Sync>;

/// Returned by [`Connection::add_log_listener`] to remove the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogListenerId(u64);

/// An authenticated connection. One command is in flight at a time: a live
/// [`RowStream`] borrows the connection mutably until it is dropped.
pub struct Connection<S> {
    framed: Framed<S, MessageCodec>,
    pub(crate) state: ConnectionState,
    pub(crate) registry: CodecRegistry,
    pub(crate) cache: QueryCache,
    settings: ServerSettings,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) last_status: Option<String>,
    pub(crate) last_capabilities: Capabilities,
    listeners: Vec<(LogListenerId, LogListener)>,
    next_listener: u64,
    cancel: CancellationToken,
    decode_options: DecodeOptions,
    implicit_limit: u64,
    pub(crate) top_transaction: Option<TransactionOptions>,
    pub(crate) next_savepoint: u64,
}

pub(crate) fn unexpected(msg: &ServerMessage, during: &str) -> StrataError {
    StrataError::framing(format!("unexpected {} during {during}", msg.name()))
}

impl<S> Connection<S> {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction_status != TransactionStatus::Idle
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Status text of the last CommandComplete, e.g. `"SELECT"`.
    pub fn last_status(&self) -> Option<&str> {
        self.last_status.as_deref()
    }

    pub fn last_capabilities(&self) -> Capabilities {
        self.last_capabilities
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn add_log_listener<F>(&mut self, listener: F) -> LogListenerId
    where
        F: Fn(&LogMessage) + Send + Sync + 'static,
    {
        let id = LogListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if the listener was already removed.
    pub fn remove_log_listener(&mut self, id: LogListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Cancelling the token fails the pending read and the connection.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ensure_ready(&self) -> Result<(), StrataError> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Executing => Err(StrataError::state(
                "results of the previous command were not consumed",
            )),
            ConnectionState::Closed => Err(StrataError::state("connection is closed")),
            ConnectionState::Failed => Err(StrataError::state("connection has failed")),
            other => Err(StrataError::state(format!(
                "connection is {other}, not ready for a command"
            ))),
        }
    }

    pub(crate) fn fail(&mut self, err: &StrataError) {
        if self.state != ConnectionState::Failed {
            error!(%err, state = %self.state, "connection failed");
            counter!("strata_connection_failures_total").increment(1);
        }
        self.state = ConnectionState::Failed;
    }

    pub(crate) fn invalidate_codecs(&mut self) {
        self.registry.invalidate();
        self.cache.clear();
    }

    /// Bookkeeping for a non-fatal server error; the caller drains to
    /// ReadyForCommand.
    pub(crate) fn note_server_error(&mut self, err: &ServerError) {
        counter!("strata_command_errors_total").increment(1);
        warn!(code = err.code, severity = %err.severity, message = %err.message, "server error");
        if err.invalidates_type_cache() {
            debug!("server reported stale type descriptors");
            self.invalidate_codecs();
        }
    }

    fn dispatch_log(&self, log: &LogMessage) {
        if log.severity >= Severity::WARNING {
            warn!(code = log.code, severity = %log.severity, "{}", log.text);
        } else if log.severity >= Severity::INFO {
            info!(code = log.code, severity = %log.severity, "{}", log.text);
        } else {
            debug!(code = log.code, severity = %log.severity, "{}", log.text);
        }
        for (_, listener) in &self.listeners {
            listener(log);
        }
    }

    fn command_params(
        &self,
        text: &str,
        output_format: OutputFormat,
        expected_cardinality: Cardinality,
    ) -> CommandParams {
        let mut params = CommandParams::new(text);
        params.output_format = output_format;
        params.expected_cardinality = expected_cardinality;
        params.implicit_limit = self.implicit_limit;
        params
    }

    fn describe(
        &mut self,
        params: &CommandParams,
        desc: CommandDataDescription,
    ) -> Result<PreparedCommand, StrataError> {
        let input_table = DescriptorTable::parse(desc.input_descriptors)?;
        let output_table = DescriptorTable::parse(desc.output_descriptors)?;
        let input_codec = self.registry.get_or_build(desc.input_type, &input_table)?;
        let output_codec = self.registry.get_or_build(desc.output_type, &output_table)?;
        Ok(PreparedCommand {
            text: params.command_text.clone(),
            output_format: params.output_format,
            expected_cardinality: params.expected_cardinality,
            input_type: desc.input_type,
            input_codec,
            output_type: desc.output_type,
            output_codec,
            capabilities: desc.capabilities,
            result_cardinality: desc.result_cardinality,
        })
    }

    /// The server described the running command again; rebuild its output
    /// codec from scratch.
    pub(crate) fn redescribe(
        &mut self,
        desc: CommandDataDescription,
    ) -> Result<RowDecoder, StrataError> {
        debug!(output_type = %desc.output_type, "command re-described during execute");
        self.invalidate_codecs();
        let table = DescriptorTable::parse(desc.output_descriptors)?;
        let codec = self.registry.get_or_build(desc.output_type, &table)?;
        Ok(RowDecoder::new(codec, self.decode_options))
    }

    fn settle<T>(&mut self, result: Result<T, StrataError>) -> Result<T, StrataError> {
        match &result {
            Err(err) if err.is_fatal() => self.fail(err),
            _ => self.state = ConnectionState::Ready,
        }
        result
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        framed: Framed<S, MessageCodec>,
        config: &ConnectConfig,
        settings: ServerSettings,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self {
            framed,
            state: ConnectionState::Ready,
            registry: CodecRegistry::new(),
            cache: QueryCache::new(config.query_cache_capacity),
            settings,
            transaction_status,
            last_status: None,
            last_capabilities: Capabilities::NONE,
            listeners: Vec::new(),
            next_listener: 0,
            cancel: CancellationToken::new(),
            decode_options: DecodeOptions {
                include_implicit: config.expose_implicit_fields,
            },
            implicit_limit: config.implicit_limit,
            top_transaction: None,
            next_savepoint: 0,
        }
    }

    async fn send(&mut self, messages: Vec<ClientMessage>) -> Result<(), StrataError> {
        self.send_encoded(messages.iter().map(ClientMessage::encode).collect())
            .await
    }

    async fn send_encoded(&mut self, messages: Vec<Message>) -> Result<(), StrataError> {
        let framed = &mut self.framed;
        let write = async move {
            for msg in messages {
                framed.feed(msg).await?;
            }
            framed.flush().await
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StrataError::Cancelled),
            res = write => res,
        }
    }

    /// Next message that needs the caller's attention. Log messages and
    /// parameter updates are handled here.
    pub(crate) async fn recv(&mut self) -> Result<ServerMessage, StrataError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StrataError::Cancelled),
                next = self.framed.next() => next,
            };
            let msg = match next {
                Some(Ok(msg)) => ServerMessage::decode(msg)?,
                Some(Err(err)) => return Err(err),
                None => return Err(StrataError::ConnectionClosed),
            };
            trace!(message = msg.name(), "recv");
            match msg {
                ServerMessage::LogMessage(log) => self.dispatch_log(&log),
                ServerMessage::ParameterStatus { name, value } => self.settings.set(&name, value),
                other => return Ok(other),
            }
        }
    }

    /// Parses `text` on the server and builds codecs for its input and
    /// output, or returns the cached result of an earlier prepare.
    pub async fn prepare(
        &mut self,
        text: &str,
        output_format: OutputFormat,
        expected_cardinality: Cardinality,
    ) -> Result<PreparedCommand, StrataError> {
        self.ensure_ready()?;
        if let Some(hit) = self.cache.get(text, output_format, expected_cardinality) {
            if hit.is_current(&self.registry) {
                counter!("strata_query_cache_hit_total").increment(1);
                return Ok(hit.clone());
            }
        }
        let params = self.command_params(text, output_format, expected_cardinality);
        debug!(command = text, "parse");
        self.state = ConnectionState::Parsing;
        let result = self.parse_command(params).await;
        let prepared = self.settle(result)?;
        self.cache.insert(prepared.clone());
        Ok(prepared)
    }

    async fn parse_command(&mut self, params: CommandParams) -> Result<PreparedCommand, StrataError> {
        self.send(vec![ClientMessage::Parse(params.clone()), ClientMessage::Sync])
            .await?;
        let mut prepared = None;
        let mut server_error = None;
        loop {
            match self.recv().await? {
                ServerMessage::CommandDataDescription(desc) => {
                    prepared = Some(self.describe(&params, desc)?);
                }
                ServerMessage::ErrorResponse(err) => {
                    if err.is_fatal() {
                        return Err(StrataError::Server(err));
                    }
                    self.note_server_error(&err);
                    server_error = Some(err);
                }
                ServerMessage::ReadyForCommand { status, .. } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(unexpected(&other, "parse")),
            }
        }
        if let Some(err) = server_error {
            return Err(StrataError::Server(err));
        }
        prepared.ok_or_else(|| StrataError::framing("parse finished without a command description"))
    }

    /// Prepares (or reuses) `text` and starts executing it.
    pub async fn execute(
        &mut self,
        text: &str,
        args: &Value,
    ) -> Result<RowStream<'_, S>, StrataError> {
        let prepared = self
            .prepare(text, OutputFormat::Binary, Cardinality::Many)
            .await?;
        self.execute_prepared(&prepared, args).await
    }

    /// Encodes `args` and sends Execute. Encoding errors, including a message
    /// over the size limit, leave the connection ready with nothing sent.
    pub async fn execute_prepared(
        &mut self,
        prepared: &PreparedCommand,
        args: &Value,
    ) -> Result<RowStream<'_, S>, StrataError> {
        self.ensure_ready()?;
        if !prepared.is_current(&self.registry) {
            return Err(StrataError::state(
                "prepared command predates a type cache invalidation",
            ));
        }
        let arguments = self
            .registry
            .encode_arguments(prepared.input_codec, args)
            .inspect_err(|_| counter!("strata_command_errors_total").increment(1))?;
        let params = self.command_params(
            &prepared.text,
            prepared.output_format,
            prepared.expected_cardinality,
        );
        let execute = ClientMessage::Execute {
            params,
            input_type: prepared.input_type,
            output_type: prepared.output_type,
            arguments,
        }
        .encode();
        let limit = self.framed.codec().max_message_size();
        if execute.wire_len() > limit {
            counter!("strata_command_errors_total").increment(1);
            return Err(StrataError::codec(format!(
                "arguments make a {} byte message, over the limit of {limit}",
                execute.wire_len()
            )));
        }
        debug!(command = %prepared.text, "execute");
        counter!("strata_commands_total").increment(1);
        self.state = ConnectionState::Executing;
        let sync = ClientMessage::Sync.encode();
        if let Err(err) = self.send_encoded(vec![execute, sync]).await {
            self.fail(&err);
            return Err(err);
        }
        let decoder = RowDecoder::new(prepared.output_codec, self.decode_options);
        Ok(RowStream::new(self, decoder))
    }

    pub async fn query(&mut self, text: &str, args: &Value) -> Result<Vec<Value>, StrataError> {
        let prepared = self
            .prepare(text, OutputFormat::Binary, Cardinality::Many)
            .await?;
        self.execute_prepared(&prepared, args).await?.fetch_all().await
    }

    pub async fn query_single(
        &mut self,
        text: &str,
        args: &Value,
    ) -> Result<Option<Value>, StrataError> {
        let prepared = self
            .prepare(text, OutputFormat::Binary, Cardinality::AtMostOne)
            .await?;
        let mut rows = self.execute_prepared(&prepared, args).await?.fetch_all().await?;
        if rows.len() > 1 {
            return Err(StrataError::state(format!(
                "expected at most one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }

    pub async fn query_required_single(
        &mut self,
        text: &str,
        args: &Value,
    ) -> Result<Value, StrataError> {
        let prepared = self
            .prepare(text, OutputFormat::Binary, Cardinality::One)
            .await?;
        let mut rows = self.execute_prepared(&prepared, args).await?.fetch_all().await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            n => Err(StrataError::state(format!("expected exactly one row, got {n}"))),
        }
    }

    /// Runs commands that return no data.
    pub async fn execute_script(&mut self, text: &str) -> Result<(), StrataError> {
        let prepared = self
            .prepare(text, OutputFormat::None, Cardinality::NoResult)
            .await?;
        self.execute_prepared(&prepared, &Value::Nothing)
            .await?
            .finish()
            .await
    }

    pub async fn transaction(
        &mut self,
        options: TransactionOptions,
    ) -> Result<Transaction<'_, S>, StrataError> {
        Transaction::start(self, options).await
    }

    /// Reads and drops whatever is left of a command whose [`RowStream`] was
    /// dropped early, returning the connection to ready.
    pub async fn discard_pending_results(&mut self) -> Result<(), StrataError> {
        match self.state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Executing => {}
            _ => return self.ensure_ready(),
        }
        let result = self.drain().await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn drain(&mut self) -> Result<(), StrataError> {
        let mut skipped = 0usize;
        loop {
            match self.recv().await? {
                ServerMessage::Data { .. } => skipped += 1,
                ServerMessage::CommandDataDescription(_) => self.invalidate_codecs(),
                ServerMessage::CommandComplete {
                    status,
                    capabilities,
                    ..
                } => {
                    self.last_status = Some(status);
                    self.last_capabilities = capabilities;
                }
                ServerMessage::ErrorResponse(err) => {
                    if err.is_fatal() {
                        return Err(StrataError::Server(err));
                    }
                    self.note_server_error(&err);
                }
                ServerMessage::ReadyForCommand { status, .. } => {
                    self.transaction_status = status;
                    self.state = ConnectionState::Ready;
                    debug!(skipped, "pending results discarded");
                    return Ok(());
                }
                other => return Err(unexpected(&other, "discard")),
            }
        }
    }

    /// Sends Terminate and shuts the transport down.
    pub async fn close(mut self) -> Result<(), StrataError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        info!(state = %self.state, "closing connection");
        self.state = ConnectionState::Closed;
        self.send(vec![ClientMessage::Terminate]).await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }

    /// Drops the connection without telling the server.
    pub fn abort(mut self) {
        warn!(state = %self.state, "aborting connection");
        self.cancel.cancel();
        self.state = ConnectionState::Closed;
    }
}
