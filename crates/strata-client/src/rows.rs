use crate::connection::{unexpected, Connection};
use crate::state::ConnectionState;
use metrics::counter;
use strata_codec::RowDecoder;
use strata_core::{ServerError, StrataError, Value};
use strata_protocol::backend::ServerMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Rows of one executing command, pulled one Data message at a time.
///
/// The stream ends at ReadyForCommand. A non-fatal server error is held until
/// then so the connection is ready again when the error is returned. Once
/// the stream has ended or failed, further pulls are a protocol state error.
pub struct RowStream<'a, S> {
    conn: &'a mut Connection<S>,
    decoder: RowDecoder,
    rows: u64,
    done: bool,
}

impl<'a, S> RowStream<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(conn: &'a mut Connection<S>, decoder: RowDecoder) -> Self {
        Self {
            conn,
            decoder,
            rows: 0,
            done: false,
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next(&mut self) -> Result<Option<Value>, StrataError> {
        if self.done {
            return Err(StrataError::state("result stream already consumed"));
        }
        match self.advance().await {
            Ok(Some(row)) => {
                self.rows += 1;
                counter!("strata_rows_decoded_total").increment(1);
                Ok(Some(row))
            }
            Ok(None) => {
                self.done = true;
                debug!(rows = self.rows, status = ?self.conn.last_status, "command complete");
                Ok(None)
            }
            Err(err) => {
                self.done = true;
                if err.is_fatal() {
                    self.conn.fail(&err);
                }
                Err(err)
            }
        }
    }

    pub async fn fetch_all(mut self) -> Result<Vec<Value>, StrataError> {
        if self.done {
            return Err(StrataError::state("result stream already consumed"));
        }
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Reads to the end of the command, dropping any rows left.
    pub async fn finish(mut self) -> Result<(), StrataError> {
        while !self.done {
            self.next().await?;
        }
        Ok(())
    }

    async fn advance(&mut self) -> Result<Option<Value>, StrataError> {
        let mut held: Option<ServerError> = None;
        loop {
            match self.conn.recv().await? {
                ServerMessage::Data { payload } if held.is_none() => {
                    return match self.decoder.decode(&self.conn.registry, payload) {
                        Ok(row) => Ok(Some(row)),
                        Err(err) => {
                            // the rest of the stream can no longer be trusted
                            self.conn.fail(&err);
                            Err(err)
                        }
                    };
                }
                ServerMessage::Data { .. } => {}
                ServerMessage::CommandDataDescription(desc) => {
                    self.decoder = self.conn.redescribe(desc)?;
                }
                ServerMessage::CommandComplete {
                    status,
                    capabilities,
                    ..
                } => {
                    self.conn.last_status = Some(status);
                    self.conn.last_capabilities = capabilities;
                }
                ServerMessage::ErrorResponse(err) => {
                    if err.is_fatal() {
                        return Err(StrataError::Server(err));
                    }
                    self.conn.note_server_error(&err);
                    held = Some(err);
                }
                ServerMessage::ReadyForCommand { status, .. } => {
                    self.conn.transaction_status = status;
                    self.conn.state = ConnectionState::Ready;
                    return match held {
                        Some(err) => Err(StrataError::Server(err)),
                        None => Ok(None),
                    };
                }
                other => return Err(unexpected(&other, "execute")),
            }
        }
    }
}
