// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The ephemeral caret log.
//!
//! Carets live in memory: correctness of an editing session never depends
//! on caret persistence. Three things distinguish this log from the durable
//! ones:
//!
//! - **Bounded history.** Only the most recent [`CARET_RETENTION`] changes
//!   are kept. A reader polling from below the floor gets
//!   `revisionNotAvailable` and falls back to `get_snapshot`.
//! - **Best-effort persistence.** Locally-owned carets are batched and
//!   flushed to `/caret/${session_id}` after a short delay, fire-and-forget
//!   with bounded retries. Flush failures are logged and forgotten.
//! - **Cross-server visibility.** A periodic task lists `/caret/*` and
//!   merges carets written by peer servers attached to the same file, as
//!   synthesized begin/set/end operations. This server only ever writes the
//!   paths of sessions it owns.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use scribe_delta::{
    AuthorId, Caret, CaretColor, CaretDelta, CaretField, CaretOp, CaretSnapshot, Change, Payload,
    RevNum, SessionId, Snapshot, Timestamp,
};
use scribe_file::{StoragePath, TransactionSpec, TransactionalFile};
use scribe_proto::Codec;

use crate::colors::ColorPicker;
use crate::DocError;

/// Retained caret changes; older revisions are garbage-collected.
pub(crate) const CARET_RETENTION: usize = 100;
/// Delay between a caret becoming dirty and its flush transaction.
const FLUSH_DELAY: Duration = Duration::from_secs(5);
/// Delay between flush retries.
const FLUSH_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Flush attempts before giving up on a batch.
const FLUSH_RETRY_LIMIT: u32 = 10;
/// Cadence of the peer-caret discovery pass.
const REMOTE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Ceiling for long-polls that arrive without a timeout.
const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(600);

struct CaretState {
    /// Snapshot at the current caret revision.
    snapshot: Snapshot<CaretDelta>,
    /// Snapshot just below the oldest retained change.
    floor_snapshot: Snapshot<CaretDelta>,
    /// Retained changes, contiguous, ending at `snapshot.rev_num`.
    history: VecDeque<Change<CaretDelta>>,
    colors: ColorPicker,
    /// Locally-owned sessions and their colors.
    local: BTreeMap<SessionId, CaretColor>,
    /// Last merged caret per remote-owned session.
    remote: BTreeMap<SessionId, Caret>,
    /// Locally-owned sessions with unflushed state (ended ones flush as
    /// deletions).
    dirty: BTreeSet<SessionId>,
}

impl CaretState {
    fn new() -> Self {
        Self {
            snapshot: Snapshot::genesis(),
            floor_snapshot: Snapshot::genesis(),
            history: VecDeque::new(),
            colors: ColorPicker::new(),
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Oldest revision whose change is still retained.
    fn floor(&self) -> RevNum {
        self.history
            .front()
            .map_or_else(|| self.snapshot.rev_num.next(), |change| change.rev_num)
    }

    fn caret_of(&self, session_id: &SessionId) -> Option<Caret> {
        self.snapshot.contents.ops().iter().find_map(|op| match op {
            CaretOp::Begin { caret } if &caret.session_id == session_id => Some(caret.clone()),
            _ => None,
        })
    }

    /// Appends a delta, advances the snapshot, trims retention.
    fn append(&mut self, delta: CaretDelta, author_id: Option<AuthorId>) -> Change<CaretDelta> {
        let change = Change {
            rev_num: self.snapshot.rev_num.next(),
            delta,
            timestamp: Some(Timestamp::now()),
            author_id,
        };
        self.snapshot = Snapshot {
            rev_num: change.rev_num,
            contents: self.snapshot.contents.compose(&change.delta, true),
        };
        self.history.push_back(change.clone());
        while self.history.len() > CARET_RETENTION {
            if let Some(old) = self.history.pop_front() {
                self.floor_snapshot = Snapshot {
                    rev_num: old.rev_num,
                    contents: self.floor_snapshot.contents.compose(&old.delta, true),
                };
            }
        }
        change
    }

    /// Snapshot at `target`, reconstructed from retained history.
    fn snapshot_at(&self, target: RevNum) -> Result<Snapshot<CaretDelta>, DocError> {
        if target == self.snapshot.rev_num {
            return Ok(self.snapshot.clone());
        }
        if target > self.snapshot.rev_num {
            return Err(DocError::RevisionTooHigh {
                requested: target,
                current: self.snapshot.rev_num,
            });
        }
        if target < self.floor_snapshot.rev_num {
            return Err(DocError::RevisionNotAvailable {
                requested: target,
                floor: self.floor_snapshot.rev_num,
            });
        }
        let mut snap = self.floor_snapshot.clone();
        for change in &self.history {
            if change.rev_num > target {
                break;
            }
            snap = Snapshot {
                rev_num: change.rev_num,
                contents: snap.contents.compose(&change.delta, true),
            };
        }
        Ok(snap)
    }
}

/// In-memory caret log for one document.
pub struct CaretControl {
    file: Arc<dyn TransactionalFile>,
    codec: Codec,
    state: Mutex<CaretState>,
    changed: Notify,
    dirt: Notify,
}

impl CaretControl {
    /// A fresh caret log over `file`.
    pub fn new(file: Arc<dyn TransactionalFile>, codec: Codec) -> Self {
        Self {
            file,
            codec,
            state: Mutex::new(CaretState::new()),
            changed: Notify::new(),
            dirt: Notify::new(),
        }
    }

    /// Spawns the flush and peer-discovery tasks. The returned handles are
    /// abortable at any point; a partial flush is harmless.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let flusher = {
            let control = Arc::clone(self);
            tokio::spawn(async move { control.flush_loop().await })
        };
        let discoverer = {
            let control = Arc::clone(self);
            tokio::spawn(async move { control.remote_loop().await })
        };
        vec![flusher, discoverer]
    }

    /// Current caret revision.
    pub async fn current_rev_num(&self) -> RevNum {
        self.state.lock().await.snapshot.rev_num
    }

    /// Opens a session's caret with a server-assigned color.
    ///
    /// Idempotent: re-opening an already-open session returns its existing
    /// caret.
    pub async fn begin_session(
        &self,
        session_id: SessionId,
        author_id: AuthorId,
        doc_rev_num: RevNum,
    ) -> Result<Caret, DocError> {
        let mut state = self.state.lock().await;
        if state.local.contains_key(&session_id) {
            return state.caret_of(&session_id).ok_or_else(|| {
                DocError::Wtf(format!("local session {session_id} has no caret"))
            });
        }
        let color = state.colors.acquire();
        let caret = Caret {
            session_id: session_id.clone(),
            author_id,
            rev_num: doc_rev_num,
            index: 0,
            length: 0,
            color,
            last_active: Timestamp::now(),
        };
        state.local.insert(session_id.clone(), color);
        state.dirty.insert(session_id.clone());
        state.append(CaretDelta::new().begin(caret.clone()), None);
        drop(state);
        self.changed.notify_waiters();
        self.dirt.notify_one();
        debug!(doc = self.file.doc_path(), session = %session_id, %color, "caret session opened");
        Ok(caret)
    }

    /// Applies a caret movement; creates the caret on first update.
    ///
    /// Returns the caret-log change to acknowledge, stamped at the new
    /// caret revision (an empty correction — the server is authoritative
    /// for carets, so the client's movement always lands unmodified).
    pub async fn update_caret(
        &self,
        session_id: &SessionId,
        author_id: &AuthorId,
        doc_rev_num: RevNum,
        index: usize,
        length: usize,
    ) -> Result<Change<CaretDelta>, DocError> {
        let mut state = self.state.lock().await;
        let rev = if state.local.contains_key(session_id) {
            let delta = CaretDelta::new()
                .set(session_id.clone(), CaretField::RevNum(doc_rev_num))
                .set(session_id.clone(), CaretField::Index(index))
                .set(session_id.clone(), CaretField::Length(length))
                .set(
                    session_id.clone(),
                    CaretField::LastActive(Timestamp::now()),
                );
            state
                .append(delta, Some(author_id.clone()))
                .rev_num
        } else {
            // First movement of a session we have not seen: create it.
            let color = state.colors.acquire();
            let caret = Caret {
                session_id: session_id.clone(),
                author_id: author_id.clone(),
                rev_num: doc_rev_num,
                index,
                length,
                color,
                last_active: Timestamp::now(),
            };
            state.local.insert(session_id.clone(), color);
            state.append(CaretDelta::new().begin(caret), None).rev_num
        };
        state.dirty.insert(session_id.clone());
        drop(state);
        self.changed.notify_waiters();
        self.dirt.notify_one();
        Ok(Change::identity(rev))
    }

    /// Ends a session: removes its caret and recycles its color.
    pub async fn end_session(&self, session_id: &SessionId) {
        let mut state = self.state.lock().await;
        let Some(color) = state.local.remove(session_id) else {
            return;
        };
        state.colors.release(color);
        state.dirty.insert(session_id.clone());
        state.append(CaretDelta::new().end(session_id.clone()), None);
        drop(state);
        self.changed.notify_waiters();
        self.dirt.notify_one();
        debug!(doc = self.file.doc_path(), session = %session_id, "caret session ended");
    }

    /// The caret set at `rev`, or at the current revision when omitted.
    pub async fn get_snapshot(&self, rev: Option<RevNum>) -> Result<CaretSnapshot, DocError> {
        let state = self.state.lock().await;
        let target = rev.unwrap_or(state.snapshot.rev_num);
        let snap = state.snapshot_at(target)?;
        drop(state);
        Ok(CaretSnapshot::from_snapshot(&snap)?)
    }

    /// Long-poll for a caret change after `base`.
    ///
    /// Reports `revisionNotAvailable` when `base` has fallen below the
    /// retention floor; the caller re-seeds from `get_snapshot`.
    pub async fn get_change_after(
        &self,
        base: RevNum,
        timeout: Option<Duration>,
    ) -> Result<Change<CaretDelta>, DocError> {
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(DEFAULT_POLL_CEILING);
        loop {
            let state = self.state.lock().await;
            let current = state.snapshot.rev_num;
            if base > current {
                return Err(DocError::RevisionTooHigh {
                    requested: base,
                    current,
                });
            }
            if base < current {
                let floor = state.floor();
                if base.next() < floor {
                    return Err(DocError::RevisionNotAvailable {
                        requested: base,
                        floor,
                    });
                }
                let mut composed = CaretDelta::new();
                let mut single: Option<Change<CaretDelta>> = None;
                let mut count = 0usize;
                for change in &state.history {
                    if change.rev_num > base {
                        composed = composed.compose(&change.delta, false);
                        single = Some(change.clone());
                        count += 1;
                    }
                }
                drop(state);
                return Ok(match (count, single) {
                    (1, Some(change)) => change,
                    _ => Change::bare(current, composed),
                });
            }
            let notified = self.changed.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            drop(state);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DocError::TimedOut);
            }
        }
    }

    /// Merges carets stored by peer servers into the local log.
    ///
    /// Only sessions this server does not own are considered; the local
    /// writer is the sole writer of its own `/caret/*` paths.
    pub async fn refresh_remote(&self) -> Result<(), DocError> {
        let root = StoragePath::new("/caret")?;
        let listed = self
            .file
            .transact(TransactionSpec::new().list_path_prefix(root.clone()))
            .await?;
        let mut read = TransactionSpec::new();
        let mut any = false;
        for path in &listed.paths {
            read = read.read_path(path.clone());
            any = true;
        }
        let stored = if any {
            self.file.transact(read).await?.data
        } else {
            BTreeMap::new()
        };
        let mut state = self.state.lock().await;
        let mut seen: BTreeSet<SessionId> = BTreeSet::new();
        let mut delta = CaretDelta::new();
        for buf in stored.values() {
            let value: serde_json::Value = match serde_json::from_str(buf.as_utf8()?) {
                Ok(value) => value,
                Err(err) => {
                    warn!(doc = self.file.doc_path(), %err, "undecodable stored caret");
                    continue;
                }
            };
            let caret = match self.codec.decode_caret(&value) {
                Ok(caret) => caret,
                Err(err) => {
                    warn!(doc = self.file.doc_path(), %err, "divergent stored caret");
                    continue;
                }
            };
            if state.local.contains_key(&caret.session_id) {
                continue;
            }
            seen.insert(caret.session_id.clone());
            let known = state.remote.get(&caret.session_id) == Some(&caret);
            if !known {
                state.remote.insert(caret.session_id.clone(), caret.clone());
                delta = delta.begin(caret);
            }
        }
        let departed: Vec<SessionId> = state
            .remote
            .keys()
            .filter(|sid| !seen.contains(*sid))
            .cloned()
            .collect();
        for sid in departed {
            state.remote.remove(&sid);
            delta = delta.end(sid);
        }
        if !delta.is_empty() {
            state.append(delta, None);
            drop(state);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn remote_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REMOTE_REFRESH_INTERVAL).await;
            if let Err(err) = self.refresh_remote().await {
                debug!(doc = self.file.doc_path(), %err, "peer caret refresh failed");
            }
        }
    }

    /// Drains the dirty set into one write transaction, with bounded retries.
    async fn flush_loop(self: Arc<Self>) {
        loop {
            self.dirt.notified().await;
            tokio::time::sleep(FLUSH_DELAY).await;
            let spec = {
                let mut state = self.state.lock().await;
                let dirty: Vec<SessionId> = state.dirty.iter().cloned().collect();
                state.dirty.clear();
                let mut spec = TransactionSpec::new();
                let mut any = false;
                for sid in dirty {
                    let Ok(path) = Self::caret_path(&sid) else {
                        warn!(session = %sid, "session id is not storable; skipping flush");
                        continue;
                    };
                    if state.local.contains_key(&sid) {
                        if let Some(caret) = state.caret_of(&sid) {
                            let buf = scribe_file::FrozenBuffer::from_string(
                                self.codec.encode_caret(&caret).to_string(),
                            );
                            spec = spec.write_path(path, buf);
                            any = true;
                        }
                    } else {
                        spec = spec.delete_path(path);
                        any = true;
                    }
                }
                any.then_some(spec)
            };
            let Some(spec) = spec else { continue };
            for attempt in 1..=FLUSH_RETRY_LIMIT {
                match self.file.transact(spec.clone()).await {
                    Ok(_) => break,
                    Err(err) if attempt == FLUSH_RETRY_LIMIT => {
                        warn!(
                            doc = self.file.doc_path(),
                            %err,
                            "caret flush abandoned after {FLUSH_RETRY_LIMIT} attempts"
                        );
                    }
                    Err(err) => {
                        debug!(doc = self.file.doc_path(), %err, attempt, "caret flush failed; retrying");
                        tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    fn caret_path(session_id: &SessionId) -> Result<StoragePath, DocError> {
        Ok(StoragePath::new("/caret")?.join(session_id.as_str())?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scribe_file::MemoryFile;

    async fn control() -> Arc<CaretControl> {
        let file = Arc::new(MemoryFile::new("doc-caret"));
        file.create().await.unwrap();
        Arc::new(CaretControl::new(file, Codec::new()))
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn author() -> AuthorId {
        AuthorId::new("alice").unwrap()
    }

    // ── 1. session open assigns distinct colors ─────────────────────────

    #[tokio::test]
    async fn open_assigns_distinct_colors() {
        let control = control().await;
        let a = control
            .begin_session(sid("s1"), author(), RevNum::ZERO)
            .await
            .unwrap();
        let b = control
            .begin_session(sid("s2"), author(), RevNum::ZERO)
            .await
            .unwrap();
        assert_ne!(a.color, b.color);
        let snap = control.get_snapshot(None).await.unwrap();
        assert_eq!(snap.len(), 2);
    }

    // ── 2. update moves the caret and bumps the caret revision ──────────

    #[tokio::test]
    async fn update_moves_caret() {
        let control = control().await;
        control
            .begin_session(sid("s1"), author(), RevNum::ZERO)
            .await
            .unwrap();
        let ack = control
            .update_caret(&sid("s1"), &author(), RevNum::from_raw(3), 7, 2)
            .await
            .unwrap();
        assert!(ack.delta.is_empty());
        let snap = control.get_snapshot(None).await.unwrap();
        assert_eq!(snap.rev_num, ack.rev_num);
        let caret = snap.get(&sid("s1")).unwrap();
        assert_eq!((caret.index, caret.length), (7, 2));
        assert_eq!(caret.rev_num.value(), 3);
    }

    // ── 3. create-on-first-update ───────────────────────────────────────

    #[tokio::test]
    async fn update_creates_unknown_session() {
        let control = control().await;
        control
            .update_caret(&sid("ghost"), &author(), RevNum::ZERO, 4, 0)
            .await
            .unwrap();
        let snap = control.get_snapshot(None).await.unwrap();
        assert_eq!(snap.get(&sid("ghost")).unwrap().index, 4);
    }

    // ── 4. end removes the caret and recycles the color ─────────────────

    #[tokio::test]
    async fn end_session_removes_caret() {
        let control = control().await;
        let caret = control
            .begin_session(sid("s1"), author(), RevNum::ZERO)
            .await
            .unwrap();
        control.end_session(&sid("s1")).await;
        let snap = control.get_snapshot(None).await.unwrap();
        assert!(snap.get(&sid("s1")).is_none());
        // The released hue is the next one assigned after the free pool
        // cycles around to it.
        let mut last = None;
        for n in 0..crate::colors::PALETTE.len() {
            let c = control
                .begin_session(sid(&format!("s{}", n + 10)), author(), RevNum::ZERO)
                .await
                .unwrap();
            last = Some(c.color);
        }
        assert_eq!(last, Some(caret.color));
    }

    // ── 5. bounded history forces snapshot fallback ─────────────────────

    #[tokio::test]
    async fn retention_floor_reports_not_available() {
        let control = control().await;
        control
            .begin_session(sid("s1"), author(), RevNum::ZERO)
            .await
            .unwrap();
        for i in 0..(CARET_RETENTION + 50) {
            control
                .update_caret(&sid("s1"), &author(), RevNum::ZERO, i, 0)
                .await
                .unwrap();
        }
        let err = control
            .get_change_after(RevNum::from_raw(10), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::RevisionNotAvailable { .. }));
        // Fallback works and reflects the latest movement.
        let snap = control.get_snapshot(None).await.unwrap();
        assert_eq!(
            snap.get(&sid("s1")).unwrap().index,
            CARET_RETENTION + 49
        );
    }

    // ── 6. long-poll wakes on movement ──────────────────────────────────

    #[tokio::test]
    async fn long_poll_wakes_on_update() {
        let control = control().await;
        control
            .begin_session(sid("s1"), author(), RevNum::ZERO)
            .await
            .unwrap();
        let base = control.current_rev_num().await;
        let poller = {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                control
                    .get_change_after(base, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        control
            .update_caret(&sid("s1"), &author(), RevNum::ZERO, 1, 0)
            .await
            .unwrap();
        let change = poller.await.unwrap().unwrap();
        assert!(change.rev_num > base);
    }

    // ── 7. peer carets are merged and retired ───────────────────────────

    #[tokio::test]
    async fn remote_carets_merge_and_depart() {
        let file = Arc::new(MemoryFile::new("doc-caret"));
        file.create().await.unwrap();
        let codec = Codec::new();
        let peer_file: Arc<dyn TransactionalFile> = file.clone();
        let control = Arc::new(CaretControl::new(peer_file, codec));
        // A peer server wrote this caret path.
        let peer = Caret {
            session_id: sid("peer-1"),
            author_id: AuthorId::new("bob").unwrap(),
            rev_num: RevNum::from_raw(2),
            index: 5,
            length: 1,
            color: scribe_delta::CaretColor::from_rgb(1, 2, 3),
            last_active: Timestamp::from_msec(7),
        };
        let path = StoragePath::new("/caret/peer-1").unwrap();
        file.transact(TransactionSpec::new().write_path(
            path.clone(),
            scribe_file::FrozenBuffer::from_string(codec.encode_caret(&peer).to_string()),
        ))
        .await
        .unwrap();
        control.refresh_remote().await.unwrap();
        let snap = control.get_snapshot(None).await.unwrap();
        assert_eq!(snap.get(&sid("peer-1")).unwrap().index, 5);
        // The peer session departs; its path disappears.
        file.transact(TransactionSpec::new().delete_path(path))
            .await
            .unwrap();
        control.refresh_remote().await.unwrap();
        let snap = control.get_snapshot(None).await.unwrap();
        assert!(snap.get(&sid("peer-1")).is_none());
    }
}
