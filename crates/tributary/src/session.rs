//! Session-id allocation.
//!
//! Every merged upload occupies one session in the master report, and
//! session ids must be unique within it. Serial merges assign ids at merge
//! time, monotonic from the current master. Parallel fan-out cannot do
//! that — merges race — so the dispatcher pre-allocates one id per upload
//! before scheduling, tracked by a per-commit watermark in the KV store.
//!
//! The watermark is a derived cache: when the key is missing it is
//! recomputed from the master report's highest session id. Ids already
//! present in the master (for instance carried forward from a parent
//! commit) are skipped.

use std::sync::Arc;

use anyhow::{Context, Result};
use tributary_kv::KeyValueStore;
use tributary_types::CommitRef;

use crate::report::Report;

pub fn session_counter_key(commit: &CommitRef) -> String {
    format!(
        "parallel-session-counter/{}/{}",
        commit.repo_id, commit.commit_sha
    )
}

pub struct SessionAllocator {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionAllocator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Pre-allocate `count` session ids for a parallel fan-out.
    ///
    /// Ids start at the watermark (re-seeded from the master when the key
    /// is missing), skip any id the master already uses, and the watermark
    /// advances past the last allocation so concurrent fan-outs for the
    /// same commit cannot collide.
    pub fn allocate_parallel_ids(
        &self,
        commit: &CommitRef,
        master: &Report,
        count: usize,
    ) -> Result<Vec<u32>> {
        let key = session_counter_key(commit);
        let watermark = match self.kv.get(&key)? {
            Some(raw) => String::from_utf8_lossy(&raw)
                .parse::<u32>()
                .unwrap_or_else(|_| master.next_session_id()),
            None => master.next_session_id(),
        };

        let taken = master.session_ids();
        let mut ids = Vec::with_capacity(count);
        let mut candidate = watermark;
        while ids.len() < count {
            if !taken.contains(&candidate) {
                ids.push(candidate);
            }
            candidate = candidate
                .checked_add(1)
                .context("session id space exhausted")?;
        }

        self.kv.set(&key, candidate.to_string().as_bytes())?;
        Ok(ids)
    }
}
