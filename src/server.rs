//! The gateway's TCP accept loop and management HTTP endpoint.
//!
//! Grounded on the teacher's `create_router`/`serve_with_graceful_shutdown`
//! pair: the management surface is still a small Axum router bound
//! independently of the protocol listener, and shutdown is still a single
//! `CancellationToken` threaded into every long-running task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{response::Html, routing::get, Router};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout as tokio_timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};

/// Builds the management router: a landing page plus `/health`.
#[must_use]
pub fn create_router() -> Router {
    Router::new()
        .route("/", get(|| async { Html("IMS Connect Gateway") }))
        .route("/health", get(|| async { "OK" }))
}

/// Binds the management listener on `config.port + 1` (the protocol listener
/// owns `config.port` itself).
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn bind_management_listener(config: &ServerConfig) -> io::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.into_inner() + 1));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Serves the management router on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails during operation.
pub async fn serve_management(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(io::Error::other)
}

/// Binds the protocol listener on `config.port`, applying `backlog` via the
/// OS default (the standard library's `TcpListener` does not expose a
/// backlog knob; `config.backlog` is recorded for parity with other
/// implementations of this surface, consulted nowhere else in this crate).
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn bind_protocol_listener(config: &ServerConfig) -> io::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.into_inner()));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Accepts connections on `listener` until `shutdown` is cancelled, spawning
/// one task per connection via [`handle_connection`].
pub async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(config.tcp_no_delay) {
                            warn!(%peer, %err, "failed to set TCP_NODELAY");
                        }
                        let dispatcher = Arc::clone(&dispatcher);
                        let config = config.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, dispatcher, config, shutdown).await;
                        });
                    }
                    Err(err) => warn!(%err, "failed to accept connection"),
                }
            }
        }
    }
}

/// Reads length-prefixed frames from one connection, dispatches each, and
/// writes back the outcome, until the client disconnects, an idle timeout
/// elapses, or a `DEALLOCATE` closes the channel.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    let connection_id = dispatcher.sessions().open_session();
    info!(%peer, %connection_id, "connection accepted");

    let read_idle = Duration::from_secs(config.read_idle_sec);
    let write_idle = Duration::from_secs(config.write_idle_sec);
    let all_idle = Duration::from_secs(config.all_idle_sec);
    let mut decoder = crate::codec::frame::FrameDecoder::new();
    let mut read_buf = vec![0u8; config.max_message_size.into_inner()];

    loop {
        if let Some(frame) = pop_decoded_frame(&mut decoder) {
            match frame {
                Ok(frame) => {
                    let outcome = dispatcher.dispatch(connection_id, frame).await;
                    match outcome {
                        DispatchOutcome::Reply(bytes) => {
                            if write_all_with_timeout(&mut stream, &bytes, write_idle).await.is_err() {
                                break;
                            }
                        }
                        DispatchOutcome::ReplyThenClose(bytes) => {
                            let _ = write_all_with_timeout(&mut stream, &bytes, write_idle).await;
                            break;
                        }
                        DispatchOutcome::NoReply => {}
                    }
                    continue;
                }
                Err(err) => {
                    warn!(%peer, %err, "failed to decode frame; closing connection");
                    break;
                }
            }
        }

        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            result = tokio_timeout(all_idle.min(read_idle), stream.read(&mut read_buf)) => result,
        };
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => decoder.feed(&read_buf[..n]),
            Ok(Err(err)) => {
                warn!(%peer, %err, "read error; closing connection");
                break;
            }
            Err(_) => {
                info!(%peer, %connection_id, "connection idle timeout");
                break;
            }
        }
    }

    dispatcher.sessions().close(connection_id).await;
    info!(%peer, %connection_id, "connection closed");
}

fn pop_decoded_frame(
    decoder: &mut crate::codec::frame::FrameDecoder,
) -> Option<Result<crate::codec::frame::DecodedFrame, crate::error::GatewayError>> {
    match decoder.try_decode() {
        Ok(Some(frame)) => Some(Ok(frame)),
        Ok(None) => None,
        Err(err) => Some(Err(err.into())),
    }
}

async fn write_all_with_timeout(stream: &mut TcpStream, bytes: &[u8], write_idle: Duration) -> io::Result<()> {
    match tokio_timeout(write_idle, stream.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write idle timeout")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_router_has_health_route() {
        let router = create_router();
        assert!(!format!("{router:?}").is_empty());
    }

    #[tokio::test]
    async fn bind_protocol_listener_binds_requested_port() {
        let mut config = ServerConfig::default();
        config.port = crate::domain_types::PortNumber::try_new(0).expect("0 lets the OS pick");
        let (listener, addr) = bind_protocol_listener(&config).await.expect("binds");
        assert_ne!(addr.port(), 0);
        drop(listener);
    }
}
