//! Bandwidth-optimal ring all-reduce over TCP.

use crate::{
    config::ClusterConfig,
    error::DistributedError,
    transport::{TcpTransport, TransportReceiver, TransportSender},
    DistributedBackend,
};
use anyhow::Result;
use async_trait::async_trait;
use bytemuck::{cast_slice, cast_slice_mut};
use tokio::sync::Mutex;

/// Ring all-reduce backend: scatter-reduce then all-gather, each node
/// exchanging one chunk per phase with its ring neighbors.
pub struct RingBackend {
    rank: usize,
    world_size: usize,
    sender: Mutex<TransportSender>,
    receiver: Mutex<TransportReceiver>,
}

impl RingBackend {
    /// Connect the ring. Requires at least two nodes; use
    /// [`crate::LocalBackend`] for single-process runs.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        if config.world_size() < 2 {
            return Err(DistributedError::Config(
                "ring all-reduce needs at least 2 nodes".into(),
            )
            .into());
        }
        let (sender, receiver) = TcpTransport::connect(&config).await?;
        Ok(Self {
            rank: config.rank,
            world_size: config.nodes.len(),
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        })
    }

    fn chunk_range(&self, len: usize, idx: usize) -> (usize, usize) {
        chunk_range(len, self.world_size, idx)
    }
}

/// Element range of chunk `idx` when `len` elements are split across
/// `world_size` ring members; the remainder spreads over the first chunks.
fn chunk_range(len: usize, world_size: usize, idx: usize) -> (usize, usize) {
    let base = len / world_size;
    let remainder = len % world_size;
    let start = idx * base + idx.min(remainder);
    let end = start + base + usize::from(idx < remainder);
    (start, end)
}

#[async_trait]
impl DistributedBackend for RingBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() % 4 != 0 {
            return Err(DistributedError::Protocol(format!(
                "buffer length {} is not a multiple of 4 (f32 size)",
                buffer.len()
            ))
            .into());
        }
        let floats: &mut [f32] = cast_slice_mut(buffer);
        let len = floats.len();

        let mut sender = self.sender.lock().await;
        let mut receiver = self.receiver.lock().await;

        // f32-typed receive scratch keeps the byte view properly aligned.
        let max_chunk = len / self.world_size + 1;
        let mut recv_buf = vec![0f32; max_chunk];

        // Phase 1: scatter-reduce. After world_size - 1 exchanges, each
        // node holds the full sum for one chunk.
        let mut send_idx = self.rank;
        let mut recv_idx = (self.rank + self.world_size - 1) % self.world_size;
        for _ in 0..self.world_size - 1 {
            let (s_start, s_end) = self.chunk_range(len, send_idx);
            let (r_start, r_end) = self.chunk_range(len, recv_idx);

            let send_chunk: Vec<f32> = floats[s_start..s_end].to_vec();
            let recv_slice = &mut recv_buf[..r_end - r_start];

            let send_fut = sender.send(cast_slice(&send_chunk));
            let recv_fut = receiver.recv(cast_slice_mut(recv_slice));
            tokio::try_join!(send_fut, recv_fut)?;

            for (acc, received) in floats[r_start..r_end].iter_mut().zip(recv_slice.iter()) {
                *acc += received;
            }

            send_idx = recv_idx;
            recv_idx = (recv_idx + self.world_size - 1) % self.world_size;
        }

        // Phase 2: all-gather the reduced chunks around the ring.
        send_idx = (self.rank + 1) % self.world_size;
        recv_idx = self.rank;
        for _ in 0..self.world_size - 1 {
            let (s_start, s_end) = self.chunk_range(len, send_idx);
            let (r_start, r_end) = self.chunk_range(len, recv_idx);

            let send_chunk: Vec<f32> = floats[s_start..s_end].to_vec();
            let recv_slice = &mut recv_buf[..r_end - r_start];

            let send_fut = sender.send(cast_slice(&send_chunk));
            let recv_fut = receiver.recv(cast_slice_mut(recv_slice));
            tokio::try_join!(send_fut, recv_fut)?;

            floats[r_start..r_end].copy_from_slice(recv_slice);

            send_idx = recv_idx;
            recv_idx = (recv_idx + self.world_size - 1) % self.world_size;
        }

        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        let mut buf = [0u8; 4];
        self.all_reduce(&mut buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributedContext;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn free_addrs(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|_| {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_node_ring_all_reduce_sums() {
        let nodes = free_addrs(2);
        let timeout = Duration::from_secs(20);

        let mut tasks = Vec::new();
        for rank in 0..2 {
            let nodes = nodes.clone();
            tasks.push(tokio::spawn(async move {
                let backend = RingBackend::new(ClusterConfig::new(nodes, rank))
                    .await
                    .unwrap();
                let ctx = DistributedContext::new(Box::new(backend));
                let mut data: Vec<f32> = if rank == 0 {
                    vec![1.0, 2.0, 3.0, 4.0, 5.0]
                } else {
                    vec![10.0, 20.0, 30.0, 40.0, 50.0]
                };
                ctx.all_reduce_f32(&mut data, timeout).await.unwrap();
                ctx.barrier(timeout).await.unwrap();
                data
            }));
        }

        for task in tasks {
            let data = task.await.unwrap();
            assert_eq!(data, vec![11.0, 22.0, 33.0, 44.0, 55.0]);
        }
    }

    #[test]
    fn chunk_ranges_cover_without_overlap() {
        for (len, world) in [(10, 3), (5, 2), (7, 7), (3, 5)] {
            let mut covered = Vec::new();
            for idx in 0..world {
                let (s, e) = chunk_range(len, world, idx);
                covered.extend(s..e);
            }
            assert_eq!(covered, (0..len).collect::<Vec<_>>(), "len={len} world={world}");
        }
    }
}
