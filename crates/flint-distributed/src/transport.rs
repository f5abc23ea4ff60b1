//! TCP transport layer for gradient synchronization.
//!
//! Reliable, ordered delivery with length-prefix framing. Each node sends
//! to its next ring neighbor and receives from its previous one.

use crate::config::ClusterConfig;
use crate::error::DistributedError;
use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Maximum backoff delay between connection retries.
const MAX_BACKOFF_MS: u64 = 5_000;

/// Initial backoff delay between connection retries.
const INITIAL_BACKOFF_MS: u64 = 100;

/// Sender half of the transport.
pub struct TransportSender {
    stream: OwnedWriteHalf,
}

/// Receiver half of the transport.
pub struct TransportReceiver {
    stream: OwnedReadHalf,
}

impl TransportSender {
    /// Send data with a length prefix.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let len = (data.len() as u32).to_le_bytes();
        self.stream.write_all(&len).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }
}

impl TransportReceiver {
    /// Receive data into `buffer`; the incoming frame must match its size.
    pub async fn recv(&mut self, buffer: &mut [u8]) -> Result<()> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len != buffer.len() {
            return Err(DistributedError::Protocol(format!(
                "expected {} bytes, got {}",
                buffer.len(),
                len
            ))
            .into());
        }

        self.stream.read_exact(buffer).await?;
        Ok(())
    }
}

/// TCP transport for ring communication.
pub struct TcpTransport;

impl TcpTransport {
    /// Connect to peers in a ring topology.
    ///
    /// Each node connects to its next peer and accepts a connection from
    /// its previous peer.
    pub async fn connect(config: &ClusterConfig) -> Result<(TransportSender, TransportReceiver)> {
        let world_size = config.nodes.len();
        let rank = config.rank;
        let my_addr = config.nodes[rank];
        let connection_timeout = Duration::from_millis(config.connection_timeout_ms);
        let max_retries = config.max_retries;

        info!("rank {} listening on {}", rank, my_addr);
        let listener = TcpListener::bind(my_addr).await?;

        let next_rank = (rank + 1) % world_size;
        let next_addr = config.nodes[next_rank];

        let connect_fut = async {
            let mut retries = 0u32;
            loop {
                if retries >= max_retries {
                    return Err(DistributedError::MaxRetriesExceeded {
                        addr: next_addr,
                        max_retries,
                    });
                }
                match TcpStream::connect(next_addr).await {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY: {e}");
                        }
                        info!("connected to next peer {} at {}", next_rank, next_addr);
                        return Ok(stream);
                    }
                    Err(e) => {
                        if retries == 0 {
                            debug!("waiting for peer {} at {} ({e})", next_rank, next_addr);
                        }
                        retries += 1;
                        let backoff =
                            (INITIAL_BACKOFF_MS * 2u64.pow(retries.min(6))).min(MAX_BACKOFF_MS);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        };

        let accept_fut = async {
            match timeout(connection_timeout, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY on incoming: {e}");
                    }
                    info!("accepted connection from {addr}");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(DistributedError::Io(e)),
                Err(_) => Err(DistributedError::ConnectionTimeout(
                    my_addr,
                    connection_timeout,
                )),
            }
        };

        let (next_peer, prev_peer) = tokio::try_join!(
            async { connect_fut.await.map_err(anyhow::Error::from) },
            async { accept_fut.await.map_err(anyhow::Error::from) }
        )?;

        // Send to the next peer, receive from the previous one.
        let (_, write_next) = next_peer.into_split();
        let (read_prev, _) = prev_peer.into_split();

        Ok((
            TransportSender { stream: write_next },
            TransportReceiver { stream: read_prev },
        ))
    }
}
