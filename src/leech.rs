use crate::metadata::{MetadataError, TorrentMetadata};
use rbit::peer::{
    ExtensionHandshake, ExtensionMessage, METADATA_PIECE_SIZE, Message, MetadataMessage,
    MetadataMessageType, PeerConnection, PeerError, PeerId, metadata_piece_size,
};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;

/// Extension id we advertise for ut_metadata. Peers address their
/// ut_metadata messages to us with this id.
const LOCAL_UT_METADATA: u8 = 1;
const CLIENT: &str = "trawler";

#[derive(Debug, thiserror::Error)]
pub enum LeechError {
    #[error("peer: {0}")]
    Peer(#[from] PeerError),
    #[error("peer does not support the extension protocol")]
    NoExtensionProtocol,
    #[error("peer did not advertise ut_metadata")]
    NoMetadataExtension,
    #[error("unusable metadata_size {0:?}")]
    MetadataSize(Option<i64>),
    #[error("piece {0} out of range")]
    PieceOutOfRange(u32),
    #[error("piece {piece} has {got} bytes, expected {expected}")]
    BadPieceLength { piece: u32, got: usize, expected: usize },
    #[error("peer rejected piece {0}")]
    Rejected(u32),
    #[error("metadata digest does not match infohash")]
    DigestMismatch,
    #[error("metadata incomplete")]
    Incomplete,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("session timed out")]
    Timeout,
}

impl LeechError {
    /// Network-level failures (refused, reset, timed out) as opposed to the
    /// peer violating the protocol.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LeechError::Timeout
                | LeechError::Peer(PeerError::Io(_) | PeerError::ConnectionClosed | PeerError::Timeout)
        )
    }
}

/// Reassembles ut_metadata pieces into the raw info dict.
pub struct MetadataAssembler {
    buf: Vec<u8>,
    received: Vec<bool>,
    missing: usize,
}

impl MetadataAssembler {
    pub fn new(total_size: usize) -> Result<Self, LeechError> {
        if total_size == 0 {
            return Err(LeechError::MetadataSize(Some(0)));
        }
        let pieces = total_size.div_ceil(METADATA_PIECE_SIZE);
        Ok(Self {
            buf: vec![0u8; total_size],
            received: vec![false; pieces],
            missing: pieces,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.received.len()
    }

    pub fn insert(&mut self, piece: u32, data: &[u8]) -> Result<(), LeechError> {
        let idx = piece as usize;
        if idx >= self.received.len() {
            return Err(LeechError::PieceOutOfRange(piece));
        }
        let expected = metadata_piece_size(piece, self.buf.len());
        if data.len() != expected {
            return Err(LeechError::BadPieceLength {
                piece,
                got: data.len(),
                expected,
            });
        }

        let offset = idx * METADATA_PIECE_SIZE;
        self.buf[offset..offset + expected].copy_from_slice(data);
        if !self.received[idx] {
            self.received[idx] = true;
            self.missing -= 1;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Returns the buffer only if its SHA1 matches `info_hash`.
    pub fn finish(self, info_hash: &[u8; 20]) -> Result<Vec<u8>, LeechError> {
        if !self.is_complete() {
            return Err(LeechError::Incomplete);
        }
        let digest = Sha1::digest(&self.buf);
        if digest.as_slice() != info_hash.as_slice() {
            return Err(LeechError::DigestMismatch);
        }
        Ok(self.buf)
    }
}

/// One attempt to fetch metadata for `info_hash` from a single peer.
pub struct LeechSession {
    info_hash: [u8; 20],
    peer: SocketAddr,
    peer_id: [u8; 20],
    timeout: Duration,
    max_metadata_size: usize,
}

impl LeechSession {
    pub fn new(info_hash: [u8; 20], peer: SocketAddr, timeout: Duration, max_metadata_size: usize) -> Self {
        Self {
            info_hash,
            peer,
            peer_id: *PeerId::generate().as_bytes(),
            timeout,
            max_metadata_size,
        }
    }

    /// Runs the exchange to completion; exactly one outcome per session.
    pub async fn run(self) -> Result<TorrentMetadata, LeechError> {
        tokio::time::timeout(self.timeout, self.exchange())
            .await
            .map_err(|_| LeechError::Timeout)?
    }

    async fn exchange(&self) -> Result<TorrentMetadata, LeechError> {
        // rbit checks the remote infohash before returning the connection.
        let mut conn = PeerConnection::connect(self.peer, self.info_hash, self.peer_id).await?;
        if !conn.supports_extension {
            return Err(LeechError::NoExtensionProtocol);
        }

        let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", LOCAL_UT_METADATA)]);
        hs.client = Some(CLIENT.to_string());
        conn.send(Message::Extended {
            id: 0,
            payload: hs.encode()?,
        })
        .await?;

        let (remote_id, advertised) = wait_for_peer_handshake(&mut conn).await?;
        let total_size = match advertised {
            Some(n) if n > 0 && (n as u64) <= self.max_metadata_size as u64 => n as usize,
            other => return Err(LeechError::MetadataSize(other)),
        };

        let mut assembler = MetadataAssembler::new(total_size)?;
        for piece in 0..assembler.piece_count() {
            conn.send(Message::Extended {
                id: remote_id,
                payload: MetadataMessage::request(piece as u32).encode()?,
            })
            .await?;
        }

        while !assembler.is_complete() {
            let msg = next_metadata_message(&mut conn).await?;
            match msg.msg_type {
                MetadataMessageType::Data => {
                    let data = msg.data.unwrap_or_default();
                    assembler.insert(msg.piece, &data)?;
                }
                MetadataMessageType::Reject => return Err(LeechError::Rejected(msg.piece)),
                // We do not serve metadata.
                MetadataMessageType::Request => {}
            }
        }

        let raw = assembler.finish(&self.info_hash)?;
        Ok(TorrentMetadata::decode(self.info_hash, &raw)?)
    }
}

/// Remote ut_metadata id and advertised metadata_size.
async fn wait_for_peer_handshake(conn: &mut PeerConnection) -> Result<(u8, Option<i64>), LeechError> {
    loop {
        let Message::Extended { id, payload } = conn.receive().await? else {
            continue;
        };
        let ExtensionMessage::Handshake(peer_hs) = ExtensionMessage::decode(id, &payload)? else {
            continue;
        };
        let ut_id = peer_hs
            .get_extension_id("ut_metadata")
            .ok_or(LeechError::NoMetadataExtension)?;
        return Ok((ut_id, peer_hs.metadata_size));
    }
}

async fn next_metadata_message(conn: &mut PeerConnection) -> Result<MetadataMessage, LeechError> {
    // Peers interleave bitfield/have/keep-alive with the replies.
    loop {
        let Message::Extended { id, payload } = conn.receive().await? else {
            continue;
        };
        if id != LOCAL_UT_METADATA {
            continue;
        }
        return Ok(MetadataMessage::decode(&payload)?);
    }
}
