pub mod auth;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod query_cache;
pub mod rows;
pub mod settings;
pub mod state;
pub mod transaction;

pub use config::ConnectConfig;
pub use connection::{Connection, LogListener, LogListenerId};
pub use handshake::{Authenticating, Connecting, Handshake, Handshaking};
pub use query_cache::{PreparedCommand, QueryCache};
pub use rows::RowStream;
pub use settings::ServerSettings;
pub use state::ConnectionState;
pub use transaction::{
    IsolationLevel, Transaction, TransactionBlock, TransactionOptions, TransactionState,
};

use strata_core::StrataError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Runs the handshake over an already open transport.
pub async fn connect<S>(stream: S, config: &ConnectConfig) -> Result<Connection<S>, StrataError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Handshake::<S, Connecting>::new(stream, config)?
        .start()
        .await?
        .authenticate()
        .await?
        .finish()
        .await
}

pub async fn connect_tcp(config: &ConnectConfig) -> Result<Connection<TcpStream>, StrataError> {
    config.validate()?;
    let stream = TcpStream::connect(config.address()).await?;
    stream.set_nodelay(true)?;
    connect(stream, config).await
}

#[cfg(test)]
mod tests;
