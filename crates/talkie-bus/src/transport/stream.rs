//! NDJSON framing of a port over a byte stream.
//!
//! One JSON value per line. The connecting side writes a [`Handshake`] line
//! naming the port first; everything after it is frames. The stream stays open
//! until either side's port is dropped or the peer closes the connection.

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use talkie_types::ipc::Handshake;

use crate::error::BusError;

use super::Port;

/// Open the connecting side of a port over `stream`.
pub async fn open_stream<S>(name: &str, stream: S) -> Result<Port, BusError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let handshake = Handshake {
        port: name.to_string(),
    };
    write_line(&mut write_half, &serde_json::to_value(&handshake)?)
        .await
        .map_err(|e| BusError::transport(format!("{e:#}")))?;
    Ok(bridge(name, BufReader::new(read_half), write_half))
}

/// Accept a port over `stream`, reading the handshake to learn its name.
pub async fn accept_stream<S>(stream: S) -> Result<Port, BusError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| BusError::transport(format!("failed to read handshake: {e}")))?;
    if n == 0 {
        return Err(BusError::transport("stream closed before handshake"));
    }
    let handshake: Handshake = serde_json::from_str(line.trim())?;
    Ok(bridge(&handshake.port, reader, write_half))
}

async fn write_line<W>(writer: &mut W, frame: &Value) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(frame).context("Failed to serialize frame")?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Shuttle frames between a local port and the stream halves.
fn bridge<R, W>(name: &str, mut reader: BufReader<R>, mut writer: W) -> Port
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = Port::pair(name);
    let (inbound, mut outbound) = remote.split();

    let port_name = name.to_string();
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_line(&mut writer, &frame).await {
                warn!("Port {} write failed: {:#}", port_name, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let port_name = name.to_string();
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Port {} read failed: {}", port_name, e);
                    break;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let frame: Value = match serde_json::from_str(trimmed) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Port {} dropped malformed frame: {}", port_name, e);
                    continue;
                }
            };
            if inbound.post(frame).is_err() {
                break;
            }
        }
        debug!("Port {} stream closed", port_name);
    });

    local
}

#[cfg(unix)]
pub use unix::{UnixAcceptor, UnixConnector};

#[cfg(unix)]
mod unix {
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{info, warn};

    use crate::error::BusError;
    use crate::transport::{Acceptor, Connector, Port};

    use super::{accept_stream, open_stream};

    /// Connects to a background context listening on a Unix socket.
    #[derive(Debug, Clone)]
    pub struct UnixConnector {
        path: PathBuf,
    }

    impl UnixConnector {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    #[async_trait]
    impl Connector for UnixConnector {
        async fn connect(&self, name: &str) -> Result<Port, BusError> {
            let stream = UnixStream::connect(&self.path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused => BusError::NoListener {
                    name: name.to_string(),
                },
                _ => BusError::transport(format!(
                    "failed to connect to {}: {e}",
                    self.path.display()
                )),
            })?;
            open_stream(name, stream).await
        }
    }

    /// Accepts ports on a Unix socket.
    ///
    /// Connections are accepted and handshaken on a background task so that
    /// [`Acceptor::accept`] stays cancel-safe.
    pub struct UnixAcceptor {
        rx: mpsc::UnboundedReceiver<Port>,
        task: JoinHandle<()>,
    }

    impl UnixAcceptor {
        pub fn bind(path: &Path) -> Result<Self, BusError> {
            // Remove stale socket file if it exists
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|e| {
                BusError::transport(format!("failed to bind {}: {e}", path.display()))
            })?;
            info!("Listening on {}", path.display());

            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(async move {
                loop {
                    let stream = match listener.accept().await {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            break;
                        }
                    };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept_stream(stream).await {
                            Ok(port) => {
                                let _ = tx.send(port);
                            }
                            Err(e) => warn!("Rejected connection: {}", e),
                        }
                    });
                }
            });
            Ok(Self { rx, task })
        }
    }

    impl Drop for UnixAcceptor {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    #[async_trait]
    impl Acceptor for UnixAcceptor {
        async fn accept(&mut self) -> Option<Port> {
            self.rx.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);

        let (opened, accepted) = tokio::join!(open_stream("bus", client), accept_stream(server));
        let mut client_port = opened.unwrap();
        let mut server_port = accepted.unwrap();
        assert_eq!(server_port.name(), "bus");

        client_port.post(json!({ "type": "notify", "payload": 1 })).unwrap();
        assert_eq!(
            server_port.recv().await,
            Some(json!({ "type": "notify", "payload": 1 }))
        );

        server_port.post(json!("pong")).unwrap();
        assert_eq!(client_port.recv().await, Some(json!("pong")));
    }

    #[tokio::test]
    async fn dropping_a_port_closes_the_peer() {
        let (client, server) = tokio::io::duplex(4096);
        let (opened, accepted) = tokio::join!(open_stream("bus", client), accept_stream(server));
        let client_port = opened.unwrap();
        let mut server_port = accepted.unwrap();

        drop(client_port);
        assert_eq!(server_port.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_carries_frames_both_ways() {
        use crate::transport::{Acceptor, Connector};

        let path = std::env::temp_dir().join(format!("talkie-{}.sock", uuid::Uuid::new_v4()));
        let connector = UnixConnector::new(&path);
        assert!(matches!(
            connector.connect("talkie-message-bus").await,
            Err(BusError::NoListener { .. })
        ));

        let mut acceptor = UnixAcceptor::bind(&path).unwrap();
        let mut client = connector.connect("talkie-message-bus").await.unwrap();
        let mut server = acceptor.accept().await.unwrap();
        assert_eq!(server.name(), "talkie-message-bus");

        client.post(json!({ "type": "request", "id": 1 })).unwrap();
        assert_eq!(server.recv().await, Some(json!({ "type": "request", "id": 1 })));
        server.post(json!([1, 2, 3])).unwrap();
        assert_eq!(client.recv().await, Some(json!([1, 2, 3])));

        drop(client);
        assert_eq!(server.recv().await, None);
        drop(acceptor);
        let _ = std::fs::remove_file(&path);
    }
}
