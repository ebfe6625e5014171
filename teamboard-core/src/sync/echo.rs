/// Echo tracker using SHA-256 fingerprints of expected sequences.
///
/// Before every local write: fingerprint the optimistic sequence, register it.
/// On remote notification: fingerprint the decoded sequence, check against
/// pending fingerprints.
/// Match found -> consume fingerprint, the notification is our own echo.
/// No match -> foreign change.
/// TTL is cleanup only; fingerprints are consumed on match regardless.
use std::time::{Duration, Instant};

use super::types::SequenceFingerprint;

struct PendingFingerprint {
    fingerprint: SequenceFingerprint,
    registered_at: Instant,
}

pub struct EchoTracker {
    /// Several writes may be pending before their echoes arrive
    pending: Vec<PendingFingerprint>,
    ttl: Duration,
}

impl EchoTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Vec::new(),
            ttl,
        }
    }

    pub fn register(&mut self, fingerprint: SequenceFingerprint) {
        self.pending.push(PendingFingerprint {
            fingerprint,
            registered_at: Instant::now(),
        });
    }

    /// True (and consumed) when `fingerprint` matches a pending write.
    pub fn check_and_consume(&mut self, fingerprint: &SequenceFingerprint) -> bool {
        match self.pending.iter().position(|p| &p.fingerprint == fingerprint) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop one pending registration of `fingerprint`, as when its write
    /// failed and no echo will follow.
    pub fn forget(&mut self, fingerprint: &SequenceFingerprint) {
        if let Some(pos) = self.pending.iter().position(|p| &p.fingerprint == fingerprint) {
            self.pending.remove(pos);
        }
    }

    /// Remove expired fingerprints (cleanup, not functional).
    pub fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.pending
            .retain(|p| now.duration_since(p.registered_at) < ttl);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
