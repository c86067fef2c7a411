// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end flows over the document control layer: append, concurrent
//! merge, long-poll, recovery, and schema validation, all against the
//! in-memory file backend.
//!
//! A fresh body is the newline-terminated empty document, so every edit
//! below retains or deletes around that trailing newline — the log only
//! accepts incremental changes.

use std::sync::Arc;
use std::time::Duration;

use scribe_delta::{AuthorId, BodyDelta, Payload, RevNum, SessionId};
use scribe_doc::{BodyControl, DocHost, ValidationStatus};
use scribe_file::{FrozenBuffer, MemoryFile, StoragePath, TransactionSpec, TransactionalFile};
use scribe_proto::Codec;

async fn open_host(name: &str) -> (Arc<dyn TransactionalFile>, Arc<DocHost>) {
    let file: Arc<dyn TransactionalFile> = Arc::new(MemoryFile::new(name));
    let host = DocHost::open(Arc::clone(&file), Codec::new()).await.unwrap();
    (file, host)
}

fn p(s: &str) -> StoragePath {
    StoragePath::new(s).unwrap()
}

fn sid(s: &str) -> SessionId {
    SessionId::new(s).unwrap()
}

fn author(s: &str) -> AuthorId {
    AuthorId::new(s).unwrap()
}

// ── happy path: first insert ────────────────────────────────────────────

#[tokio::test]
async fn first_update_lands_at_revision_one() {
    let (_file, host) = open_host("doc-a").await;
    let session = host
        .open_session(sid("sx"), author("alice"))
        .await
        .unwrap();
    let correction = session
        .body_update(RevNum::ZERO, BodyDelta::new().insert("hello").retain(1))
        .await
        .unwrap();
    assert_eq!(correction.rev_num.value(), 1);
    assert!(correction.delta.is_empty());
    let snap = session
        .body_get_snapshot(Some(RevNum::from_raw(1)))
        .await
        .unwrap();
    assert_eq!(snap.contents.document_text().unwrap(), "hello\n");
}

// ── concurrent inserts at the same offset ───────────────────────────────

#[tokio::test]
async fn concurrent_inserts_converge_with_committed_side_first() {
    let (_file, host) = open_host("doc-b").await;
    let x = host.open_session(sid("sx"), author("x")).await.unwrap();
    let y = host.open_session(sid("sy"), author("y")).await.unwrap();
    x.body_update(RevNum::ZERO, BodyDelta::new().insert("hello").retain(1))
        .await
        .unwrap();
    // X commits first from revision 1; Y submits against the same base.
    let base = RevNum::from_raw(1);
    x.body_update(base, BodyDelta::new().retain(5).insert(" world"))
        .await
        .unwrap();
    let correction = y
        .body_update(base, BodyDelta::new().retain(5).insert("!"))
        .await
        .unwrap();
    assert_eq!(correction.rev_num.value(), 3);
    assert!(!correction.delta.is_empty());
    let snap = y.body_get_snapshot(None).await.unwrap();
    assert_eq!(snap.contents.document_text().unwrap(), "hello world!\n");
    // The correction moves Y's expected state onto the server state.
    let y_expected = BodyDelta::document("hello!\n");
    let fixed = y_expected.compose(&correction.delta, true);
    assert_eq!(fixed.document_text().unwrap(), "hello world!\n");
}

// ── at most one writer per revision ─────────────────────────────────────

#[tokio::test]
async fn racing_updates_take_distinct_revisions() {
    let (_file, host) = open_host("doc-race").await;
    let a = host.open_session(sid("sa"), author("a")).await.unwrap();
    let b = host.open_session(sid("sb"), author("b")).await.unwrap();
    a.body_update(RevNum::ZERO, BodyDelta::new().insert("base").retain(1))
        .await
        .unwrap();
    let base = RevNum::from_raw(1);
    let (ra, rb) = tokio::join!(
        a.body_update(base, BodyDelta::new().retain(4).insert("A")),
        b.body_update(base, BodyDelta::new().retain(4).insert("B")),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    let mut revs = [ra.rev_num.value(), rb.rev_num.value()];
    revs.sort_unstable();
    assert_eq!(revs, [2, 3]);
    // Exactly one side needed no correction.
    assert_eq!(
        usize::from(ra.delta.is_empty()) + usize::from(rb.delta.is_empty()),
        1
    );
    let snap = a.body_get_snapshot(None).await.unwrap();
    let text = snap.contents.document_text().unwrap();
    assert!(text == "baseAB\n" || text == "baseBA\n", "got {text}");
}

// ── log monotonicity and snapshot composition ───────────────────────────

#[tokio::test]
async fn log_is_immutable_and_snapshots_compose() {
    let (_file, host) = open_host("doc-log").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    let edits = ["alpha", " beta", " gamma", " delta"];
    let mut rev = RevNum::ZERO;
    for text in edits {
        let snap = s.body_get_snapshot(None).await.unwrap();
        // Append just before the trailing newline.
        let at_end = snap.contents.result_len() - 1;
        let correction = s
            .body_update(
                rev,
                BodyDelta::new().retain(at_end).insert(text).retain(1),
            )
            .await
            .unwrap();
        rev = correction.rev_num;
    }
    let frozen: Vec<_> = {
        let mut changes = Vec::new();
        for n in 0..=rev.value() {
            changes.push(s.body_get_change(RevNum::from_raw(n)).await.unwrap());
        }
        changes
    };
    // Re-reading yields identical changes.
    for (n, frozen) in frozen.iter().enumerate() {
        let again = s
            .body_get_change(RevNum::from_raw(u64::try_from(n).unwrap()))
            .await
            .unwrap();
        assert_eq!(&again, frozen);
    }
    // Every snapshot is document-form and composes from its predecessor.
    for n in 1..=rev.value() {
        let prev = s
            .body_get_snapshot(Some(RevNum::from_raw(n - 1)))
            .await
            .unwrap();
        let here = s
            .body_get_snapshot(Some(RevNum::from_raw(n)))
            .await
            .unwrap();
        assert!(here.contents.is_document());
        let composed = prev.compose(&frozen[usize::try_from(n).unwrap()]).unwrap();
        assert_eq!(composed.contents, here.contents);
    }
}

// ── long-poll: timeout then wakeup ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn get_change_after_times_out_without_activity() {
    let (_file, host) = open_host("doc-poll").await;
    let current = host.body().current_rev_num().await.unwrap();
    let err = host
        .body()
        .get_change_after(current, Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert_eq!(err.wire_name(), "timedOut");
}

#[tokio::test]
async fn get_change_after_wakes_on_append() {
    let (_file, host) = open_host("doc-poll2").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    let current = host.body().current_rev_num().await.unwrap();
    let poller = {
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            host.body()
                .get_change_after(current, Some(Duration::from_secs(10)))
                .await
        })
    };
    tokio::task::yield_now().await;
    s.body_update(current, BodyDelta::new().insert("wake").retain(1))
        .await
        .unwrap();
    let change = poller.await.unwrap().unwrap();
    assert!(change.rev_num > current);
    let woken = BodyDelta::document("\n").compose(&change.delta, true);
    assert_eq!(woken.document_text().unwrap(), "wake\n");
}

#[tokio::test]
async fn get_change_after_composes_catch_up_ranges() {
    let (_file, host) = open_host("doc-catchup").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    s.body_update(RevNum::ZERO, BodyDelta::new().insert("one").retain(1))
        .await
        .unwrap();
    s.body_update(RevNum::from_raw(1), BodyDelta::new().retain(3).insert(" two"))
        .await
        .unwrap();
    s.body_update(RevNum::from_raw(2), BodyDelta::new().retain(7).insert(" three"))
        .await
        .unwrap();
    let caught_up = host
        .body()
        .get_change_after(RevNum::ZERO, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(caught_up.rev_num.value(), 3);
    let replayed = BodyDelta::document("\n").compose(&caught_up.delta, true);
    assert_eq!(replayed.document_text().unwrap(), "one two three\n");
}

// ── stale base catch-up inside update ───────────────────────────────────

#[tokio::test]
async fn update_from_stale_base_rebases_over_the_whole_range() {
    let (_file, host) = open_host("doc-stale").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    s.body_update(RevNum::ZERO, BodyDelta::new().insert("abc").retain(1))
        .await
        .unwrap();
    s.body_update(RevNum::from_raw(1), BodyDelta::new().retain(3).insert("def"))
        .await
        .unwrap();
    // A laggard still at revision 1 ("abc\n") prepends.
    let correction = s
        .body_update(RevNum::from_raw(1), BodyDelta::new().insert(">").retain(4))
        .await
        .unwrap();
    assert_eq!(correction.rev_num.value(), 3);
    let snap = s.body_get_snapshot(None).await.unwrap();
    assert_eq!(snap.contents.document_text().unwrap(), ">abcdef\n");
}

// ── recovery after an unclean shutdown ──────────────────────────────────

#[tokio::test]
async fn recovery_truncates_beyond_log_gaps() {
    let (file, host) = open_host("doc-recover").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    s.body_update(RevNum::ZERO, BodyDelta::new().insert("aa").retain(1))
        .await
        .unwrap();
    s.body_update(RevNum::from_raw(1), BodyDelta::new().retain(2).insert("bb"))
        .await
        .unwrap();
    drop(host);
    // Simulate a torn write surviving a crash: a change beyond a gap, and a
    // counter that never made it to storage.
    file.transact(
        TransactionSpec::new()
            .write_path(p("/revision/5/change"), FrozenBuffer::from_string("{}"))
            .write_path(p("/revision_number"), FrozenBuffer::from_decimal(5)),
    )
    .await
    .unwrap();
    let control = BodyControl::body(Arc::clone(&file), Codec::new()).unwrap();
    control.recover().await.unwrap();
    assert_eq!(control.current_rev_num().await.unwrap().value(), 2);
    // The orphan beyond the gap is gone.
    let read = file
        .transact(TransactionSpec::new().read_path(p("/revision/5/change")))
        .await
        .unwrap();
    assert!(read.data.is_empty());
    // The surviving log still serves snapshots.
    let snap = control.get_snapshot(None).await.unwrap();
    assert_eq!(snap.contents.document_text().unwrap(), "aabb\n");
}

// ── schema validation on open ───────────────────────────────────────────

#[tokio::test]
async fn schema_validation_statuses() {
    // Fresh file: stamped and usable.
    let (_file, host) = open_host("doc-schema").await;
    assert_eq!(host.validation_status(), ValidationStatus::Ok);
    // Migratable version.
    let file: Arc<dyn TransactionalFile> = Arc::new(MemoryFile::new("doc-schema-old"));
    file.create().await.unwrap();
    file.transact(
        TransactionSpec::new().write_path(p("/schema_version"), FrozenBuffer::from_string("0")),
    )
    .await
    .unwrap();
    let host = DocHost::open(Arc::clone(&file), Codec::new()).await.unwrap();
    assert_eq!(host.validation_status(), ValidationStatus::Migrate);
    // Unrecognized version: the open fails.
    let file: Arc<dyn TransactionalFile> = Arc::new(MemoryFile::new("doc-schema-bad"));
    file.create().await.unwrap();
    file.transact(
        TransactionSpec::new().write_path(p("/schema_version"), FrozenBuffer::from_string("99")),
    )
    .await
    .unwrap();
    assert!(DocHost::open(file, Codec::new()).await.is_err());
}

// ── bad updates are rejected at the boundary ────────────────────────────

#[tokio::test]
async fn invalid_updates_rejected() {
    let (_file, host) = open_host("doc-invalid").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    // Empty delta.
    let err = s
        .body_update(RevNum::ZERO, BodyDelta::new())
        .await
        .unwrap_err();
    assert_eq!(err.wire_name(), "badValue");
    // A whole document smuggled in as an update.
    let err = s
        .body_update(RevNum::ZERO, BodyDelta::document("replacement\n"))
        .await
        .unwrap_err();
    assert_eq!(err.wire_name(), "badValue");
    // Base beyond the current revision.
    let err = s
        .body_update(RevNum::from_raw(9), BodyDelta::new().insert("x").retain(1))
        .await
        .unwrap_err();
    assert_eq!(err.wire_name(), "revisionTooHigh");
}

// ── property log shares the machinery under its own prefix ──────────────

#[tokio::test]
async fn property_log_is_independent_of_the_body() {
    let (_file, host) = open_host("doc-prop").await;
    let s = host.open_session(sid("s"), author("a")).await.unwrap();
    s.body_update(RevNum::ZERO, BodyDelta::new().insert("text").retain(1))
        .await
        .unwrap();
    let correction = s
        .property_update(
            RevNum::ZERO,
            scribe_delta::PropertyDelta::new()
                .set("title", serde_json::json!("notes"))
                .delete("draft"),
        )
        .await
        .unwrap();
    assert_eq!(correction.rev_num.value(), 1);
    let props = s.property_get_snapshot(None).await.unwrap();
    assert_eq!(
        props.contents.get("title"),
        Some(&serde_json::json!("notes"))
    );
    // Counters advanced independently.
    assert_eq!(host.body().current_rev_num().await.unwrap().value(), 1);
    assert_eq!(host.property().current_rev_num().await.unwrap().value(), 1);
}
