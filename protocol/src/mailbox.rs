//! # Mailbox Store
//!
//! Holds delivered-but-unread payloads keyed by message id, each with an
//! expiry. Reads do not consume entries; an entry simply stops being
//! visible once its time-to-live has elapsed, whether or not anyone read it.
//!
//! Two backends implement the [`Mailbox`] contract:
//!
//! - [`MemoryMailbox`]: a `DashMap`, for development and tests.
//! - [`SledMailbox`]: an embedded sled tree that survives restarts.
//!
//! Both expire lazily on read. [`Mailbox::purge_expired`] reclaims space
//! from entries nobody asked for again; the node calls it periodically.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use sled::{Db, IVec, Tree};
use tokio::time::Instant;

use crate::config::MAILBOX_TREE;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("corrupt mailbox entry for {0}")]
    Corrupt(String),
}

pub type MailboxResult<T> = Result<T, MailboxError>;

/// Expiring key-value store for delivered messages.
#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// `Ok(false)` means the store declined the write.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> MailboxResult<bool>;

    /// The live value under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> MailboxResult<Option<Vec<u8>>>;

    /// Drops every expired entry and returns how many were removed.
    async fn purge_expired(&self) -> MailboxResult<usize>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// MemoryMailbox
// ---------------------------------------------------------------------------

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process mailbox. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryMailbox {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> MailboxResult<bool> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> MailboxResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone());
        Ok(value)
    }

    async fn purge_expired(&self) -> MailboxResult<usize> {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let live = now < entry.expires_at;
            if !live {
                removed += 1;
            }
            live
        });
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// SledMailbox
// ---------------------------------------------------------------------------

const EXPIRY_PREFIX_LEN: usize = 8;

/// Durable mailbox on a sled tree.
///
/// Each value is the expiry as big-endian unix milliseconds followed by the
/// payload bytes. Expiry uses wall-clock time since entries outlive the
/// process.
#[derive(Debug, Clone)]
pub struct SledMailbox {
    db: Db,
    entries: Tree,
}

impl SledMailbox {
    /// Opens or creates the mailbox database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> MailboxResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A mailbox that is deleted when dropped.
    pub fn open_temporary() -> MailboxResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> MailboxResult<Self> {
        let entries = db.open_tree(MAILBOX_TREE)?;
        Ok(Self { db, entries })
    }

    /// Blocks until pending writes are on disk.
    pub fn flush(&self) -> MailboxResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes `key` only while it still holds exactly `seen`. A `set` that
    /// landed after `seen` was read keeps its entry.
    fn remove_if_unchanged(&self, key: &[u8], seen: &IVec) -> MailboxResult<bool> {
        let swapped = self
            .entries
            .compare_and_swap(key, Some(seen), None as Option<&[u8]>)?;
        Ok(swapped.is_ok())
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn split_entry(key: &str, raw: &[u8]) -> MailboxResult<(u64, Vec<u8>)> {
    if raw.len() < EXPIRY_PREFIX_LEN {
        return Err(MailboxError::Corrupt(key.to_string()));
    }
    let (prefix, payload) = raw.split_at(EXPIRY_PREFIX_LEN);
    let mut expiry = [0u8; EXPIRY_PREFIX_LEN];
    expiry.copy_from_slice(prefix);
    Ok((u64::from_be_bytes(expiry), payload.to_vec()))
}

#[async_trait]
impl Mailbox for SledMailbox {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> MailboxResult<bool> {
        let expires_at = unix_millis(SystemTime::now()).saturating_add(ttl.as_millis() as u64);

        let mut raw = Vec::with_capacity(EXPIRY_PREFIX_LEN + value.len());
        raw.extend_from_slice(&expires_at.to_be_bytes());
        raw.extend_from_slice(value);

        self.entries.insert(key.as_bytes(), raw)?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> MailboxResult<Option<Vec<u8>>> {
        let Some(raw) = self.entries.get(key.as_bytes())? else {
            return Ok(None);
        };
        let (expires_at, payload) = split_entry(key, &raw)?;
        if unix_millis(SystemTime::now()) >= expires_at {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    async fn purge_expired(&self) -> MailboxResult<usize> {
        let now = unix_millis(SystemTime::now());
        let mut removed = 0;

        for item in self.entries.iter() {
            let (key, raw) = item?;
            let expired = match split_entry(&String::from_utf8_lossy(&key), &raw) {
                Ok((expires_at, _)) => now >= expires_at,
                Err(_) => true,
            };
            if expired && self.remove_if_unchanged(&key, &raw)? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn memory_set_then_get() {
        let mailbox = MemoryMailbox::new();
        assert!(mailbox.set("m1", b"payload", HOUR).await.unwrap());
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(mailbox.get("m2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_do_not_consume() {
        let mailbox = MemoryMailbox::new();
        mailbox.set("m1", b"x", HOUR).await.unwrap();
        mailbox.get("m1").await.unwrap();
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn second_set_overwrites() {
        let mailbox = MemoryMailbox::new();
        mailbox.set("m1", b"first", HOUR).await.unwrap();
        mailbox.set("m1", b"second", HOUR).await.unwrap();
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(mailbox.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_entries_expire() {
        let mailbox = MemoryMailbox::new();
        mailbox.set("m1", b"x", HOUR).await.unwrap();

        tokio::time::advance(HOUR - Duration::from_secs(1)).await;
        assert!(mailbox.get("m1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(mailbox.get("m1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_purge_removes_only_expired() {
        let mailbox = MemoryMailbox::new();
        mailbox.set("old", b"x", Duration::from_secs(10)).await.unwrap();
        mailbox.set("new", b"y", HOUR).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(mailbox.purge_expired().await.unwrap(), 1);
        assert_eq!(mailbox.len(), 1);
        assert!(mailbox.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sled_set_then_get() {
        let mailbox = SledMailbox::open_temporary().unwrap();
        assert!(mailbox.set("m1", b"payload", HOUR).await.unwrap());
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(mailbox.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sled_empty_payload_is_present() {
        let mailbox = SledMailbox::open_temporary().unwrap();
        mailbox.set("m1", b"", HOUR).await.unwrap();
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn sled_zero_ttl_is_immediately_expired() {
        let mailbox = SledMailbox::open_temporary().unwrap();
        mailbox.set("m1", b"x", Duration::ZERO).await.unwrap();
        mailbox.set("m2", b"y", HOUR).await.unwrap();

        assert_eq!(mailbox.get("m1").await.unwrap(), None);
        assert_eq!(mailbox.purge_expired().await.unwrap(), 1);
        assert_eq!(mailbox.len(), 1);
    }

    #[tokio::test]
    async fn sled_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mailbox = SledMailbox::open(dir.path()).unwrap();
            mailbox.set("m1", b"durable", HOUR).await.unwrap();
            mailbox.flush().unwrap();
        }
        let reopened = SledMailbox::open(dir.path()).unwrap();
        assert_eq!(reopened.get("m1").await.unwrap(), Some(b"durable".to_vec()));
    }

    #[tokio::test]
    async fn sled_purge_keeps_entry_rewritten_after_scan() {
        let mailbox = SledMailbox::open_temporary().unwrap();
        mailbox.set("m1", b"stale", Duration::ZERO).await.unwrap();
        let seen = mailbox.entries.get("m1").unwrap().unwrap();

        mailbox.set("m1", b"fresh", HOUR).await.unwrap();

        assert!(!mailbox.remove_if_unchanged(b"m1", &seen).unwrap());
        assert_eq!(mailbox.get("m1").await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sled_concurrent_purge_never_drops_fresh_writes() {
        let mailbox = std::sync::Arc::new(SledMailbox::open_temporary().unwrap());

        for round in 0..20 {
            let keys: Vec<String> = (0..50).map(|i| format!("r{round}_m{i}")).collect();
            for key in &keys {
                mailbox.set(key, b"stale", Duration::ZERO).await.unwrap();
            }

            let purger = {
                let mailbox = std::sync::Arc::clone(&mailbox);
                tokio::spawn(async move { mailbox.purge_expired().await.unwrap() })
            };
            let writers: Vec<_> = keys
                .iter()
                .cloned()
                .map(|key| {
                    let mailbox = std::sync::Arc::clone(&mailbox);
                    tokio::spawn(async move {
                        assert!(mailbox.set(&key, b"fresh", HOUR).await.unwrap());
                    })
                })
                .collect();

            for writer in writers {
                writer.await.unwrap();
            }
            purger.await.unwrap();

            for key in &keys {
                assert_eq!(
                    mailbox.get(key).await.unwrap(),
                    Some(b"fresh".to_vec()),
                    "acknowledged write to {key} was purged"
                );
            }
        }
    }

    #[tokio::test]
    async fn truncated_sled_entry_is_corrupt() {
        let mailbox = SledMailbox::open_temporary().unwrap();
        mailbox.entries.insert("bad", &[1u8, 2, 3][..]).unwrap();
        assert!(matches!(
            mailbox.get("bad").await,
            Err(MailboxError::Corrupt(key)) if key == "bad"
        ));
        assert_eq!(mailbox.purge_expired().await.unwrap(), 1);
    }
}
