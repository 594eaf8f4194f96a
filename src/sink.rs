use crate::indexer::CandidateInfoHash;
use crate::leech::{LeechError, LeechSession};
use crate::metadata::TorrentMetadata;
use crate::seen::RollingSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Extra peer addresses remembered per in-flight fetch.
const MAX_FALLBACKS: usize = 16;
/// Recently completed hashes kept to suppress an immediate refetch.
const RECENT_COMPLETIONS: usize = 4096;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub max_leeches: usize,
    pub session_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_metadata_size: usize,
    pub drain_capacity: usize,
}

/// Fetches metadata for one infohash from one peer.
pub trait MetadataFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        info_hash: [u8; 20],
        peer: SocketAddr,
    ) -> impl Future<Output = Result<TorrentMetadata, LeechError>> + Send;
}

/// The BEP-9 fetcher used in production.
pub struct LeechFetcher {
    session_timeout: Duration,
    max_metadata_size: usize,
}

impl MetadataFetcher for LeechFetcher {
    fn fetch(
        &self,
        info_hash: [u8; 20],
        peer: SocketAddr,
    ) -> impl Future<Output = Result<TorrentMetadata, LeechError>> + Send {
        LeechSession::new(info_hash, peer, self.session_timeout, self.max_metadata_size).run()
    }
}

/// How `submit` handled a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Queued as a fallback address for the fetch already running.
    Fallback,
    /// Already tried or queued for this fetch, or the fallback list is full.
    Duplicate,
    /// Metadata was delivered moments ago.
    Recent,
    /// Concurrency cap reached.
    Dropped,
}

struct InFlightFetch {
    fallbacks: VecDeque<SocketAddr>,
    tried: HashSet<SocketAddr>,
    deadline: Instant,
}

impl InFlightFetch {
    fn new(first: SocketAddr, deadline: Instant) -> Self {
        let mut tried = HashSet::new();
        tried.insert(first);
        Self {
            fallbacks: VecDeque::new(),
            tried,
            deadline,
        }
    }

    fn offer(&mut self, peer: SocketAddr) -> bool {
        if self.tried.contains(&peer) || self.fallbacks.contains(&peer) {
            return false;
        }
        if self.fallbacks.len() >= MAX_FALLBACKS {
            return false;
        }
        self.fallbacks.push_back(peer);
        true
    }

    /// Next untried address, unless the overall deadline has passed.
    fn next_peer(&mut self, now: Instant) -> Option<SocketAddr> {
        if now >= self.deadline {
            return None;
        }
        let peer = self.fallbacks.pop_front()?;
        self.tried.insert(peer);
        Some(peer)
    }
}

struct SinkState {
    fetches: HashMap<[u8; 20], InFlightFetch>,
    completed: RollingSet,
}

struct Shared<F> {
    config: SinkConfig,
    fetcher: F,
    state: Mutex<SinkState>,
    drain: mpsc::Sender<TorrentMetadata>,
}

/// Deduplicates candidates across every indexer node and runs at most one
/// fetch per infohash, bounded by `max_leeches`.
pub struct MetadataSink<F: MetadataFetcher = LeechFetcher> {
    shared: Arc<Shared<F>>,
}

impl<F: MetadataFetcher> Clone for MetadataSink<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl MetadataSink<LeechFetcher> {
    pub fn new(config: SinkConfig) -> (Self, mpsc::Receiver<TorrentMetadata>) {
        let fetcher = LeechFetcher {
            session_timeout: config.session_timeout,
            max_metadata_size: config.max_metadata_size,
        };
        Self::with_fetcher(config, fetcher)
    }
}

impl<F: MetadataFetcher> MetadataSink<F> {
    pub fn with_fetcher(config: SinkConfig, fetcher: F) -> (Self, mpsc::Receiver<TorrentMetadata>) {
        let (drain, rx) = mpsc::channel(config.drain_capacity.max(1));
        let shared = Shared {
            config,
            fetcher,
            state: Mutex::new(SinkState {
                fetches: HashMap::new(),
                completed: RollingSet::new(RECENT_COMPLETIONS),
            }),
            drain,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Non-blocking admission. Must be called within a tokio runtime.
    pub fn submit(&self, candidate: CandidateInfoHash) -> Admission {
        let info_hash = candidate.info_hash;
        let deadline = {
            let mut state = self.shared.state.lock();
            if state.completed.contains(&info_hash) {
                return Admission::Recent;
            }
            if let Some(fetch) = state.fetches.get_mut(&info_hash) {
                return if fetch.offer(candidate.peer) {
                    Admission::Fallback
                } else {
                    Admission::Duplicate
                };
            }
            if state.fetches.len() >= self.shared.config.max_leeches {
                return Admission::Dropped;
            }
            let deadline = Instant::now() + self.shared.config.fetch_timeout;
            state
                .fetches
                .insert(info_hash, InFlightFetch::new(candidate.peer, deadline));
            deadline
        };

        tracing::trace!(hash = %candidate.hex(), peer = %candidate.peer, "sink: fetch started");
        tokio::spawn(run_fetch(Arc::clone(&self.shared), info_hash, candidate.peer, deadline));
        Admission::Started
    }

    /// Number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().fetches.len()
    }
}

/// Frees a fetch's map entry if its task ends without doing so itself,
/// which happens when the fetcher panics or the task is aborted.
struct FetchSlot<F: MetadataFetcher> {
    shared: Arc<Shared<F>>,
    info_hash: [u8; 20],
    released: bool,
}

impl<F: MetadataFetcher> Drop for FetchSlot<F> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(hash = %hex::encode(self.info_hash), "sink: fetch ended abnormally; slot released");
            self.shared.state.lock().fetches.remove(&self.info_hash);
        }
    }
}

async fn run_fetch<F: MetadataFetcher>(
    shared: Arc<Shared<F>>,
    info_hash: [u8; 20],
    first: SocketAddr,
    deadline: Instant,
) {
    let mut slot = FetchSlot {
        shared: Arc::clone(&shared),
        info_hash,
        released: false,
    };
    let mut peer = first;
    loop {
        let result = tokio::time::timeout_at(deadline, shared.fetcher.fetch(info_hash, peer))
            .await
            .unwrap_or(Err(LeechError::Timeout));

        match result {
            Ok(metadata) => {
                // The slot stays held until the drain accepts the result.
                if shared.drain.send(metadata).await.is_err() {
                    tracing::debug!(hash = %hex::encode(info_hash), "sink: drain closed; result dropped");
                }
                let mut state = shared.state.lock();
                state.fetches.remove(&info_hash);
                state.completed.test_and_set(&info_hash);
                slot.released = true;
                return;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::trace!(hash = %hex::encode(info_hash), %peer, %err, "sink: peer unreachable");
                } else {
                    tracing::debug!(hash = %hex::encode(info_hash), %peer, %err, "sink: leech failed");
                }
                let next = {
                    let mut state = shared.state.lock();
                    let next = state
                        .fetches
                        .get_mut(&info_hash)
                        .and_then(|f| f.next_peer(Instant::now()));
                    if next.is_none() {
                        state.fetches.remove(&info_hash);
                        slot.released = true;
                    }
                    next
                };
                match next {
                    Some(addr) => peer = addr,
                    None => return,
                }
            }
        }
    }
}
