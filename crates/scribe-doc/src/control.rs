// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The durable revision log and its OT append protocol.
//!
//! Storage layout, per payload (body at the file root, property under
//! `/property`):
//!
//! ```text
//! <prefix>/revision_number        ASCII decimal of the current revision
//! <prefix>/revision/${n}/change   encoded change producing revision n
//! <prefix>/snapshot/${n}          encoded snapshot cache, every 100 revisions
//! ```
//!
//! Every append is a compare-and-swap on `<prefix>/revision_number`: the
//! file transaction checks the counter still hashes to the revision the
//! writer observed, then writes the change and the bumped counter together.
//! Losing the race is not an error — the writer re-reads, rebases, and
//! tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use scribe_delta::{
    BodyDelta, Change, Payload, PropertyDelta, RevNum, Snapshot, Timestamp,
};
use scribe_file::{
    FileError, FrozenBuffer, StoragePath, TransactionSpec, TransactionalFile,
};
use scribe_proto::{Codec, ProtoError};

use crate::DocError;

/// Stored-snapshot cadence: one cached snapshot per this many revisions.
const SNAPSHOT_CADENCE: u64 = 100;
/// Append attempts before an update reports `tooMuchContention`.
const UPDATE_RETRY_LIMIT: u32 = 25;
/// Changes fetched per read transaction while composing a range.
const READ_CHUNK: u64 = 64;

/// Storage prefix of the property log.
pub(crate) const PROPERTY_PREFIX: &str = "property";

/// A payload family that can live in a revision log.
///
/// Binds the delta algebra to its wire/storage encoding and its name in
/// logs. Implemented by the three concrete payloads; the generic machinery
/// in [`DocControl`] and the caret log is written against this.
pub trait LogKind: Payload {
    /// Payload name used in tracing fields.
    const NAME: &'static str;

    /// The revision-0 contents of a fresh log. Must be document-form.
    fn genesis() -> Self {
        Self::empty()
    }

    /// Encodes a change of this payload.
    fn encode_change(codec: Codec, change: &Change<Self>) -> serde_json::Value;
    /// Decodes a change of this payload.
    fn decode_change(codec: Codec, value: &serde_json::Value)
        -> Result<Change<Self>, ProtoError>;
    /// Encodes a snapshot of this payload.
    fn encode_snapshot(codec: Codec, snap: &Snapshot<Self>) -> serde_json::Value;
    /// Decodes a snapshot of this payload.
    fn decode_snapshot(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Snapshot<Self>, ProtoError>;
}

impl LogKind for BodyDelta {
    const NAME: &'static str = "body";

    /// A fresh body is the newline-terminated empty document the editor
    /// convention expects. The non-empty base keeps incremental edits
    /// distinguishable from full-document replacements: any edit must
    /// retain or delete around the trailing newline.
    fn genesis() -> Self {
        BodyDelta::document("\n")
    }

    fn encode_change(codec: Codec, change: &Change<Self>) -> serde_json::Value {
        codec.encode_body_change(change)
    }

    fn decode_change(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Change<Self>, ProtoError> {
        codec.decode_body_change(value)
    }

    fn encode_snapshot(codec: Codec, snap: &Snapshot<Self>) -> serde_json::Value {
        codec.encode_body_snapshot(snap)
    }

    fn decode_snapshot(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Snapshot<Self>, ProtoError> {
        codec.decode_body_snapshot(value)
    }
}

impl LogKind for PropertyDelta {
    const NAME: &'static str = "property";

    fn encode_change(codec: Codec, change: &Change<Self>) -> serde_json::Value {
        codec.encode_property_change(change)
    }

    fn decode_change(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Change<Self>, ProtoError> {
        codec.decode_property_change(value)
    }

    fn encode_snapshot(codec: Codec, snap: &Snapshot<Self>) -> serde_json::Value {
        codec.encode_property_snapshot(snap)
    }

    fn decode_snapshot(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Snapshot<Self>, ProtoError> {
        codec.decode_property_snapshot(value)
    }
}

impl LogKind for scribe_delta::CaretDelta {
    const NAME: &'static str = "caret";

    fn encode_change(codec: Codec, change: &Change<Self>) -> serde_json::Value {
        codec.encode_caret_change(change)
    }

    fn decode_change(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Change<Self>, ProtoError> {
        codec.decode_caret_change(value)
    }

    fn encode_snapshot(codec: Codec, snap: &Snapshot<Self>) -> serde_json::Value {
        let view = scribe_delta::CaretSnapshot::from_snapshot(snap)
            .map(|view| codec.encode_caret_snapshot(&view));
        view.unwrap_or(serde_json::Value::Null)
    }

    fn decode_snapshot(
        codec: Codec,
        value: &serde_json::Value,
    ) -> Result<Snapshot<Self>, ProtoError> {
        Ok(codec.decode_caret_snapshot(value)?.into_snapshot())
    }
}

/// The durable revision log for the body payload.
pub type BodyControl = DocControl<BodyDelta>;
/// The durable revision log for the property payload.
pub type PropertyControl = DocControl<PropertyDelta>;

/// Append-only revision log for one payload kind of one document.
///
/// Readers share the control freely; the only mutation path is
/// [`update`](Self::update), serialized by the storage compare-and-swap.
pub struct DocControl<P: LogKind> {
    file: Arc<dyn TransactionalFile>,
    codec: Codec,
    rev_path: StoragePath,
    revs_root: StoragePath,
    snap_root: StoragePath,
    cache: RwLock<Option<Snapshot<P>>>,
}

impl DocControl<BodyDelta> {
    /// The body log, living at the file root.
    pub fn body(file: Arc<dyn TransactionalFile>, codec: Codec) -> Result<Self, DocError> {
        Self::with_prefix(file, codec, None)
    }
}

impl DocControl<PropertyDelta> {
    /// The property log, living under `/property`.
    pub fn property(file: Arc<dyn TransactionalFile>, codec: Codec) -> Result<Self, DocError> {
        Self::with_prefix(file, codec, Some(PROPERTY_PREFIX))
    }
}

impl<P: LogKind> DocControl<P> {
    fn with_prefix(
        file: Arc<dyn TransactionalFile>,
        codec: Codec,
        prefix: Option<&str>,
    ) -> Result<Self, DocError> {
        let lead = prefix.map_or_else(String::new, |p| format!("/{p}"));
        Ok(Self {
            file,
            codec,
            rev_path: StoragePath::new(format!("{lead}/revision_number"))?,
            revs_root: StoragePath::new(format!("{lead}/revision"))?,
            snap_root: StoragePath::new(format!("{lead}/snapshot"))?,
            cache: RwLock::new(None),
        })
    }

    fn change_path(&self, rev: RevNum) -> Result<StoragePath, DocError> {
        Ok(self.revs_root.join_index(rev.value()).join("change")?)
    }

    fn encode_buffer(&self, value: &serde_json::Value) -> FrozenBuffer {
        FrozenBuffer::from_string(value.to_string())
    }

    fn decode_buffer(buf: &FrozenBuffer) -> Result<serde_json::Value, DocError> {
        serde_json::from_str(buf.as_utf8()?)
            .map_err(|err| DocError::BadData(format!("stored value is not JSON: {err}")))
    }

    async fn read_rev_path(&self) -> Result<Option<RevNum>, DocError> {
        let result = self
            .file
            .transact(TransactionSpec::new().read_path(self.rev_path.clone()))
            .await?;
        match result.data.get(&self.rev_path) {
            None => Ok(None),
            Some(buf) => Ok(Some(RevNum::from_raw(buf.as_decimal()?))),
        }
    }

    /// The current (newest) revision number.
    pub async fn current_rev_num(&self) -> Result<RevNum, DocError> {
        self.read_rev_path().await?.ok_or_else(|| {
            DocError::Wtf(format!(
                "{} log of {} has no revision counter",
                P::NAME,
                self.file.doc_path()
            ))
        })
    }

    /// Writes the empty-document change at revision 0 if the log is new.
    ///
    /// Safe against racing openers: the write is conditional on the counter
    /// still being absent, and losing that race means someone else
    /// initialized the same log.
    pub async fn init_if_missing(&self) -> Result<(), DocError> {
        if self.read_rev_path().await?.is_some() {
            return Ok(());
        }
        let genesis: Change<P> = Change {
            rev_num: RevNum::ZERO,
            delta: P::genesis(),
            timestamp: Some(Timestamp::now()),
            author_id: None,
        };
        let spec = TransactionSpec::new()
            .check_path_absent(self.rev_path.clone())
            .write_path(
                self.change_path(RevNum::ZERO)?,
                self.encode_buffer(&P::encode_change(self.codec, &genesis)),
            )
            .write_path(self.rev_path.clone(), FrozenBuffer::from_decimal(0));
        match self.file.transact(spec).await {
            Ok(_) => {
                debug!(payload = P::NAME, doc = self.file.doc_path(), "log initialized");
                Ok(())
            }
            // Another opener initialized first; their genesis is as good as
            // ours.
            Err(FileError::PrerequisiteFailed(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Repairs the revision counter after an unclean shutdown.
    ///
    /// The counter is authoritative only up to the highest *contiguous*
    /// stored change; anything beyond a gap was never acknowledged (acks
    /// happen after the compare-and-swap) and is discarded.
    pub async fn recover(&self) -> Result<(), DocError> {
        let listed = self
            .file
            .transact(TransactionSpec::new().list_path_prefix(self.revs_root.clone()))
            .await?;
        let mut revs: Vec<u64> = listed
            .paths
            .iter()
            .filter_map(|path| {
                self.revs_root
                    .child_component_of(path)
                    .and_then(|c| c.parse().ok())
            })
            .collect();
        revs.sort_unstable();
        revs.dedup();
        let mut contiguous: Option<u64> = None;
        for rev in &revs {
            match contiguous {
                None if *rev == 0 => contiguous = Some(0),
                Some(prev) if *rev == prev + 1 => contiguous = Some(*rev),
                _ => break,
            }
        }
        let stored = self.read_rev_path().await?;
        let Some(top) = contiguous else {
            if stored.is_some() {
                return Err(DocError::Wtf(format!(
                    "{} log of {} has a counter but no revision 0",
                    P::NAME,
                    self.file.doc_path()
                )));
            }
            return Ok(());
        };
        let max = revs.last().copied().unwrap_or(top);
        let mut spec = TransactionSpec::new();
        let mut dirty = false;
        if max > top {
            warn!(
                payload = P::NAME,
                doc = self.file.doc_path(),
                kept = top,
                discarded = max - top,
                "discarding unacknowledged changes beyond a log gap"
            );
            spec = spec.delete_path_range(self.revs_root.clone(), top + 1, max + 1);
            dirty = true;
        }
        if stored != Some(RevNum::from_raw(top)) {
            spec = spec.write_path(self.rev_path.clone(), FrozenBuffer::from_decimal(top));
            dirty = true;
        }
        if dirty {
            self.file.transact(spec).await?;
            *self.cache.write().await = None;
        }
        Ok(())
    }

    /// Reads one change directly from the log.
    pub async fn get_change(&self, rev: RevNum) -> Result<Change<P>, DocError> {
        let path = self.change_path(rev)?;
        let result = self
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await?;
        match result.data.get(&path) {
            Some(buf) => Ok(P::decode_change(self.codec, &Self::decode_buffer(buf)?)?),
            None => {
                let current = self.current_rev_num().await?;
                if rev > current {
                    Err(DocError::RevisionTooHigh {
                        requested: rev,
                        current,
                    })
                } else {
                    Err(DocError::Wtf(format!(
                        "{} log of {} is missing change {rev}",
                        P::NAME,
                        self.file.doc_path()
                    )))
                }
            }
        }
    }

    /// Reads the contiguous change range `from..=to`.
    async fn read_changes(&self, from: RevNum, to: RevNum) -> Result<Vec<Change<P>>, DocError> {
        let mut changes = Vec::new();
        let mut next = from.value();
        while next <= to.value() {
            let chunk_end = (next + READ_CHUNK - 1).min(to.value());
            let mut spec = TransactionSpec::new();
            for rev in next..=chunk_end {
                spec = spec.read_path(self.change_path(RevNum::from_raw(rev))?);
            }
            let result = self.file.transact(spec).await?;
            for rev in next..=chunk_end {
                let path = self.change_path(RevNum::from_raw(rev))?;
                let buf = result.data.get(&path).ok_or_else(|| {
                    DocError::Wtf(format!(
                        "{} log of {} is missing change r{rev}",
                        P::NAME,
                        self.file.doc_path()
                    ))
                })?;
                changes.push(P::decode_change(self.codec, &Self::decode_buffer(buf)?)?);
            }
            next = chunk_end + 1;
        }
        Ok(changes)
    }

    async fn compose_range(&self, from: RevNum, to: RevNum) -> Result<P, DocError> {
        let mut composed = P::empty();
        for change in self.read_changes(from, to).await? {
            composed = composed.compose(&change.delta, false);
        }
        Ok(composed)
    }

    /// The snapshot at `rev`, or the current snapshot when omitted.
    ///
    /// Snapshots are derived: the nearest of (in-memory cache, stored
    /// snapshot, genesis) is composed forward through the log.
    pub async fn get_snapshot(&self, rev: Option<RevNum>) -> Result<Snapshot<P>, DocError> {
        let current = self.current_rev_num().await?;
        let target = rev.unwrap_or(current);
        if target > current {
            return Err(DocError::RevisionTooHigh {
                requested: target,
                current,
            });
        }
        let cached = self.cache.read().await.clone();
        let mut snap = match cached {
            Some(cached) if cached.rev_num <= target => cached,
            _ => match self.best_stored_snapshot(target).await {
                Some(stored) => stored,
                None => {
                    let genesis = self.get_change(RevNum::ZERO).await?;
                    Snapshot {
                        rev_num: RevNum::ZERO,
                        contents: genesis.delta,
                    }
                }
            },
        };
        if snap.rev_num < target {
            for change in self.read_changes(snap.rev_num.next(), target).await? {
                snap = snap.compose(&change)?;
            }
        }
        if target == current {
            self.offer_cache(&snap).await;
        }
        Ok(snap)
    }

    /// The best stored snapshot at or below `target`, if any decodes.
    async fn best_stored_snapshot(&self, target: RevNum) -> Option<Snapshot<P>> {
        let listed = self
            .file
            .transact(TransactionSpec::new().list_path_prefix(self.snap_root.clone()))
            .await
            .ok()?;
        let best = listed
            .paths
            .iter()
            .filter_map(|path| {
                self.snap_root
                    .child_component_of(path)
                    .and_then(|c| c.parse::<u64>().ok())
            })
            .filter(|rev| *rev <= target.value())
            .max()?;
        let path = self.snap_root.join_index(best);
        let result = self
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await
            .ok()?;
        let buf = result.data.get(&path)?;
        let decoded = Self::decode_buffer(buf)
            .ok()
            .and_then(|value| P::decode_snapshot(self.codec, &value).ok());
        if decoded.is_none() {
            warn!(
                payload = P::NAME,
                doc = self.file.doc_path(),
                rev = best,
                "ignoring undecodable stored snapshot"
            );
        }
        decoded
    }

    /// Long-poll for a change after `base`.
    ///
    /// Returns the single next change when only one exists, or the composed
    /// catch-up range stamped at the current revision. When `base` *is* the
    /// current revision, blocks until an append moves the counter or the
    /// timeout elapses (`timedOut`). Never returns a stale revision.
    pub async fn get_change_after(
        &self,
        base: RevNum,
        timeout: Option<Duration>,
    ) -> Result<Change<P>, DocError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let current = self.current_rev_num().await?;
            if base > current {
                return Err(DocError::RevisionTooHigh {
                    requested: base,
                    current,
                });
            }
            if base < current {
                let mut changes = self.read_changes(base.next(), current).await?;
                if changes.len() == 1 {
                    // Sole caller of the metadata-preserving path.
                    return changes.pop().ok_or_else(|| {
                        DocError::Wtf("non-empty change list lost its element".into())
                    });
                }
                let mut composed = P::empty();
                for change in &changes {
                    composed = composed.compose(&change.delta, false);
                }
                return Ok(Change::bare(current, composed));
            }
            let mut spec = TransactionSpec::new().when_path_not(
                self.rev_path.clone(),
                FrozenBuffer::from_decimal(current.value()).hash(),
            );
            if let Some(deadline) = deadline {
                let remaining = deadline
                    .checked_duration_since(tokio::time::Instant::now())
                    .ok_or(DocError::TimedOut)?;
                spec = spec.timeout(remaining);
            }
            match self.file.transact(spec).await {
                Ok(_) => {}
                Err(FileError::TimedOut) => return Err(DocError::TimedOut),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The OT append protocol.
    ///
    /// `change` carries the client's base-plus-one revision and the delta it
    /// believes transforms its base snapshot into its intended state. The
    /// returned change is the *correction*: composed onto the client's
    /// intended state it yields the server's actual new state. An empty
    /// correction means the client's state is already exact.
    ///
    /// The submitted change must be a valid log entry: non-empty and
    /// incremental. An empty delta and a document-form delta (a whole
    /// replacement smuggled in as an update) are both `badValue`.
    pub async fn update(&self, change: Change<P>) -> Result<Change<P>, DocError> {
        let Some(r_base) = change.rev_num.prev() else {
            return Err(DocError::BadValue(
                "updates cannot target revision 0".into(),
            ));
        };
        change.validate_for_append()?;
        for attempt in 1..=UPDATE_RETRY_LIMIT {
            let current = self.current_rev_num().await?;
            if r_base > current {
                return Err(DocError::RevisionTooHigh {
                    requested: change.rev_num,
                    current,
                });
            }
            if r_base == current {
                let appended = Change {
                    rev_num: current.next(),
                    delta: change.delta.clone(),
                    timestamp: change.timestamp,
                    author_id: change.author_id.clone(),
                };
                if self.try_append(current, &appended).await? {
                    return Ok(Change::identity(appended.rev_num));
                }
            } else {
                // The log moved past the client's base: rebase the client
                // delta over everything it has not seen. The committed
                // changes win insert races against the uncommitted one.
                let d_server = self.compose_range(r_base.next(), current).await?;
                let rebased = d_server.transform(&change.delta, false);
                let correction = change.delta.transform(&d_server, true);
                if rebased.is_empty() {
                    return Ok(Change::bare(current, correction));
                }
                let appended = Change {
                    rev_num: current.next(),
                    delta: rebased,
                    timestamp: change.timestamp,
                    author_id: change.author_id.clone(),
                };
                if self.try_append(current, &appended).await? {
                    return Ok(Change::bare(appended.rev_num, correction));
                }
            }
            debug!(
                payload = P::NAME,
                doc = self.file.doc_path(),
                attempt,
                "lost the append race; rebasing and retrying"
            );
        }
        Err(DocError::TooMuchContention {
            retries: UPDATE_RETRY_LIMIT,
        })
    }

    /// One compare-and-swap append attempt. `false` means the race was lost.
    async fn try_append(&self, observed: RevNum, appended: &Change<P>) -> Result<bool, DocError> {
        let spec = TransactionSpec::new()
            .check_path_is(
                self.rev_path.clone(),
                FrozenBuffer::from_decimal(observed.value()).hash(),
            )
            .write_path(
                self.change_path(appended.rev_num)?,
                self.encode_buffer(&P::encode_change(self.codec, appended)),
            )
            .write_path(
                self.rev_path.clone(),
                FrozenBuffer::from_decimal(appended.rev_num.value()),
            );
        match self.file.transact(spec).await {
            Ok(_) => {
                self.advance_cache(appended).await;
                Ok(true)
            }
            Err(FileError::PrerequisiteFailed(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn advance_cache(&self, appended: &Change<P>) {
        let stored = {
            let mut cache = self.cache.write().await;
            if let Some(current) = cache.as_ref() {
                if current.rev_num.next() == appended.rev_num {
                    if let Ok(next) = current.compose(appended) {
                        *cache = Some(next);
                    } else {
                        *cache = None;
                    }
                } else if current.rev_num >= appended.rev_num {
                    // A stale cache from a lost race; drop it.
                    *cache = None;
                }
            }
            cache.clone()
        };
        if let Some(snap) = stored {
            if snap.rev_num == appended.rev_num
                && snap.rev_num.value() % SNAPSHOT_CADENCE == 0
            {
                self.store_snapshot(&snap).await;
            }
        }
    }

    async fn offer_cache(&self, snap: &Snapshot<P>) {
        let mut cache = self.cache.write().await;
        let newer = cache
            .as_ref()
            .is_none_or(|current| current.rev_num < snap.rev_num);
        if newer {
            *cache = Some(snap.clone());
        }
    }

    /// Best-effort stored-snapshot write; failures only cost recovery time.
    async fn store_snapshot(&self, snap: &Snapshot<P>) {
        let path = self.snap_root.join_index(snap.rev_num.value());
        let spec = TransactionSpec::new().write_path(
            path,
            self.encode_buffer(&P::encode_snapshot(self.codec, snap)),
        );
        if let Err(err) = self.file.transact(spec).await {
            warn!(
                payload = P::NAME,
                doc = self.file.doc_path(),
                rev = snap.rev_num.value(),
                %err,
                "snapshot cache write failed"
            );
        }
    }
}
