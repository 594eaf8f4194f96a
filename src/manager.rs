use crate::indexer::{CandidateInfoHash, IndexerConfig, IndexerNode};
use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Owns the indexer nodes and merges their output into one stream.
pub struct Manager {
    shutdown: watch::Sender<bool>,
    nodes: Vec<(SocketAddr, JoinHandle<()>)>,
    grace: Duration,
}

/// Merged candidates from every node.
///
/// Bounded; when the consumer falls behind the oldest candidates are dropped
/// so the nodes never block on it.
pub struct CandidateStream {
    rx: broadcast::Receiver<CandidateInfoHash>,
}

impl CandidateStream {
    /// Next candidate, or `None` once every node has stopped.
    pub async fn recv(&mut self) -> Option<CandidateInfoHash> {
        loop {
            match self.rx.recv().await {
                Ok(c) => return Some(c),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(dropped = n, "indexer: consumer lagging; oldest candidates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Manager {
    /// Binds one node per address and starts them. Any bind failure is fatal
    /// and stops the nodes already started.
    pub async fn start(
        addrs: &[SocketAddr],
        config: IndexerConfig,
        capacity: usize,
        grace: Duration,
    ) -> anyhow::Result<(Self, CandidateStream)> {
        let (out_tx, out_rx) = broadcast::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let mut bound = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let node = IndexerNode::bind(*addr, config.clone(), out_tx.clone())
                .await
                .with_context(|| format!("bind indexer on {addr}"))?;
            bound.push(node);
        }

        let nodes = bound
            .into_iter()
            .map(|node| {
                let local = node.local_addr();
                (local, tokio::spawn(node.run(shutdown.subscribe())))
            })
            .collect();
        // Only the nodes hold senders now, so the stream closes when they exit.
        drop(out_tx);

        Ok((
            Self {
                shutdown,
                nodes,
                grace,
            },
            CandidateStream { rx: out_rx },
        ))
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|(a, _)| *a).collect()
    }

    /// Signals every node and waits for them, up to the grace period overall.
    /// Stragglers are aborted. Calling this twice is a no-op.
    pub async fn terminate(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        if nodes.is_empty() {
            return;
        }
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + self.grace;
        for (addr, mut handle) in nodes {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%err, bind = %addr, "indexer: node task failed"),
                Err(_) => {
                    tracing::warn!(bind = %addr, "indexer: node did not stop in time; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn config() -> IndexerConfig {
        IndexerConfig {
            interval: Duration::from_secs(3600),
            max_neighbors: 16,
            bootstrap: Vec::new(),
        }
    }

    fn get_peers(info_hash: &[u8; 20]) -> Vec<u8> {
        let mut raw = b"d1:ad2:id20:".to_vec();
        raw.extend_from_slice(&[0x33; 20]);
        raw.extend_from_slice(b"9:info_hash20:");
        raw.extend_from_slice(info_hash);
        raw.extend_from_slice(b"e1:q9:get_peers1:t2:aa1:y1:qe");
        raw
    }

    #[tokio::test]
    async fn merges_output_of_all_nodes() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()];
        let (mut manager, mut stream) = Manager::start(&addrs, config(), 64, Duration::from_secs(2))
            .await
            .unwrap();
        let bound = manager.local_addrs();
        assert_eq!(bound.len(), 2);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&get_peers(&[1; 20]), bound[0]).await.unwrap();
        client.send_to(&get_peers(&[2; 20]), bound[1]).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            let c = tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .unwrap()
                .unwrap();
            got.push(c.info_hash[0]);
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        manager.terminate().await;
        manager.terminate().await;
        // Every sender is gone once the nodes have exited.
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn zero_nodes_terminate_immediately() {
        let (mut manager, mut stream) = Manager::start(&[], config(), 8, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.recv().await, None);
        tokio::time::timeout(Duration::from_millis(100), manager.terminate())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec!["127.0.0.1:0".parse().unwrap(), taken.local_addr().unwrap()];
        let result = Manager::start(&addrs, config(), 8, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn slow_consumer_drops_oldest() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:0".parse().unwrap()];
        let (mut manager, mut stream) = Manager::start(&addrs, config(), 2, Duration::from_secs(2))
            .await
            .unwrap();
        let target = manager.local_addrs()[0];
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Wait for each reply so all five candidates are queued before reading.
        let mut buf = [0u8; 1500];
        for i in 0..5u8 {
            client.send_to(&get_peers(&[i; 20]), target).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!((first.info_hash[0], second.info_hash[0]), (3, 4));

        manager.terminate().await;
    }
}
