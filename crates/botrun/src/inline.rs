//! Inline query routing keys and per-query pagination sessions.
//!
//! Inline results are paginated: the messaging API calls back with the same
//! `(sender, query)` pair and an offset for every page. The job queue pins those
//! calls to one worker ([`InlineKey::target`]) so the session below, which lives in
//! that worker's memory, sees every page.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::jobs::WorkerId;

/// Sessions idle for longer than this are forgotten.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlineKey {
    pub sender_id: i64,
    pub query: String,
}

impl InlineKey {
    pub fn new(sender_id: i64, query: impl Into<String>) -> Self {
        Self {
            sender_id,
            query: query.into(),
        }
    }

    /// Extract the key from an update carrying `inline_query.from.id` and
    /// `inline_query.query`.
    pub fn from_update(update: &Value) -> Option<Self> {
        let inline = update.get("inline_query")?;
        let sender_id = inline.get("from")?.get("id")?.as_i64()?;
        let query = inline.get("query")?.as_str()?;
        Some(Self::new(sender_id, query))
    }

    /// The worker that owns this query for a pool of `worker_count`.
    ///
    /// FNV-1a over the sender id and query bytes: stable across processes and runs,
    /// unlike the std hasher's random keys.
    pub fn target(&self, worker_count: usize) -> WorkerId {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let sender = self.sender_id.to_le_bytes();
        let bytes = sender
            .iter()
            .chain(std::iter::once(&0xff))
            .chain(self.query.as_bytes());
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
        (hash % worker_count.max(1) as u64) as WorkerId
    }
}

/// Pagination cursor for one inline query.
#[derive(Debug, Clone)]
pub struct InlineSession {
    pub offset: usize,
    expires_at: Instant,
}

impl InlineSession {
    /// Move the cursor forward after serving `count` results.
    pub fn advance(&mut self, count: usize) {
        self.offset += count;
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Worker-local session store with explicit expiry.
#[derive(Debug)]
pub struct InlineSessions {
    sessions: HashMap<InlineKey, InlineSession>,
    ttl: Duration,
}

impl Default for InlineSessions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InlineSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    /// The live session for `key`, starting a fresh one at offset 0 when there is
    /// none or it expired. Every access pushes the expiry out by the TTL.
    pub fn session(&mut self, key: InlineKey, now: Instant) -> &mut InlineSession {
        let ttl = self.ttl;
        let session = self.sessions.entry(key).or_insert(InlineSession {
            offset: 0,
            expires_at: now + ttl,
        });
        if session.expires_at <= now {
            session.offset = 0;
        }
        session.expires_at = now + ttl;
        session
    }

    /// Forget a session, typically once its last page was served.
    pub fn end(&mut self, key: &InlineKey) -> bool {
        self.sessions.remove(key).is_some()
    }

    /// Drop expired sessions, returning how many went.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
