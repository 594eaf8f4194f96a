use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub const TOKEN_LEN: usize = 8;
const ROTATE_EVERY: Duration = Duration::from_secs(5 * 60);

/// Opaque `get_peers` tokens: SHA1(secret || ip) truncated, with the previous
/// secret still honoured so a token stays valid for one to two rotations.
pub struct TokenSecret {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Instant,
}

impl TokenSecret {
    pub fn new(now: Instant) -> Self {
        let current = rand::random();
        Self {
            current,
            previous: current,
            rotated_at: now,
        }
    }

    pub fn maybe_rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.rotated_at) < ROTATE_EVERY {
            return;
        }
        self.previous = std::mem::replace(&mut self.current, rand::random());
        self.rotated_at = now;
    }

    pub fn issue(&self, ip: IpAddr) -> [u8; TOKEN_LEN] {
        token_for(&self.current, ip)
    }

    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        token == token_for(&self.current, ip) || token == token_for(&self.previous, ip)
    }
}

fn token_for(secret: &[u8; 16], ip: IpAddr) -> [u8; TOKEN_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    let mut out = [0u8; TOKEN_LEN];
    out.copy_from_slice(&digest[..TOKEN_LEN]);
    out
}
