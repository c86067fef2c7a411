// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The synchronization state machine.
//!
//! One machine drives one editor against one server session. Events are
//! queued FIFO and dispatched on a single cooperative loop; handlers never
//! block — asynchronous work is spawned, and its completion posts a
//! follow-up event. Transitions live in an explicit rule table keyed by
//! `(state, event)` with wildcard rows; the most specific row wins:
//! exact pair, then `(state, any)`, then `(any, event)`, then `(any, any)`.
//!
//! The push/pull rhythm: while `Idle` the machine keeps one long-poll
//! outstanding. A local edit opens a collection window (`PUSH_DELAY`);
//! when it fires, everything collected goes up in one `body_update`. The
//! returned correction is reconciled against whatever the user typed
//! during the round trip, so the editor never "jumps back".

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use scribe_delta::{BodyDelta, CaretDelta, CaretSnapshot, Change, Payload, Snapshot};
use scribe_proto::{names, ErrorInfo};

use crate::api::SessionClient;
use crate::budget::ErrorBudget;
use crate::editor::{EditorEvent, EditorPort, SYNC_SOURCE};

/// Collection window between a local edit and its push.
pub const PUSH_DELAY: Duration = Duration::from_millis(1000);
/// Pause between successful pulls.
pub const PULL_DELAY: Duration = Duration::from_millis(1000);
/// Pause before restarting after a connection-level error.
pub const RESTART_DELAY: Duration = Duration::from_millis(10_000);
/// Cadence of remote-caret pulls.
pub const CARET_REQUEST_DELAY: Duration = Duration::from_millis(250);
/// Back-off after a caret-channel error.
pub const CARET_ERROR_DELAY: Duration = Duration::from_millis(5000);

/// Machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not yet started, or reset for a restart.
    Detached,
    /// Initial snapshot requested.
    Starting,
    /// In sync; pulling remote changes.
    Idle,
    /// Local edits are accumulating toward a push.
    Collecting,
    /// A `body_update` is in flight.
    Merging,
    /// Backing off after an error; a restart is scheduled.
    ErrorWait,
    /// The error budget ran out. Terminal.
    UnrecoverableError,
}

/// Machine events.
#[derive(Debug)]
pub enum SyncEvent {
    /// Begin (or re-begin) synchronizing.
    Start,
    /// The initial snapshot arrived.
    GotSnapshot(Snapshot<BodyDelta>),
    /// A long-poll resolved with a remote change.
    GotChangeAfter(Change<BodyDelta>),
    /// The editor did something.
    GotEditorEvent(EditorEvent),
    /// Resume pulling.
    WantInput,
    /// The collection window elapsed; push now.
    WantToUpdate,
    /// A `body_update` resolved.
    GotUpdate {
        /// The delta that was sent.
        sent: BodyDelta,
        /// The correction the server answered with.
        correction: Change<BodyDelta>,
    },
    /// Remote carets changed.
    GotCarets(CaretSnapshot),
    /// An API call failed in a way its issuer could not absorb.
    ApiError {
        /// Method name, for logs.
        method: &'static str,
        /// The failure.
        error: ErrorInfo,
    },
    /// Stop the machine cleanly.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Start,
    GotSnapshot,
    GotChangeAfter,
    GotEditorEvent,
    WantInput,
    WantToUpdate,
    GotUpdate,
    GotCarets,
    ApiError,
    Shutdown,
}

impl SyncEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::GotSnapshot(_) => EventKind::GotSnapshot,
            Self::GotChangeAfter(_) => EventKind::GotChangeAfter,
            Self::GotEditorEvent(_) => EventKind::GotEditorEvent,
            Self::WantInput => EventKind::WantInput,
            Self::WantToUpdate => EventKind::WantToUpdate,
            Self::GotUpdate { .. } => EventKind::GotUpdate,
            Self::GotCarets(_) => EventKind::GotCarets,
            Self::ApiError { .. } => EventKind::ApiError,
            Self::Shutdown => EventKind::Shutdown,
        }
    }
}

/// Handle for feeding events into a running machine.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncHandle {
    /// Enqueues an event.
    pub fn send(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Enqueues an editor event.
    pub fn editor_event(&self, event: EditorEvent) {
        self.send(SyncEvent::GotEditorEvent(event));
    }

    /// Requests a clean stop.
    pub fn shutdown(&self) {
        self.send(SyncEvent::Shutdown);
    }
}

type Handler<E> = fn(&mut ClientSync<E>, SyncEvent);

struct Rule<E: EditorPort> {
    state: Option<SyncState>,
    event: Option<EventKind>,
    handler: Handler<E>,
}

impl<E: EditorPort> Rule<E> {
    /// Specificity rank; higher wins. Exact pair > (state, any) >
    /// (any, event) > (any, any).
    fn rank(&self, state: SyncState, kind: EventKind) -> Option<u8> {
        let state_hit = match self.state {
            Some(s) => s == state,
            None => true,
        };
        let event_hit = match self.event {
            Some(e) => e == kind,
            None => true,
        };
        if !(state_hit && event_hit) {
            return None;
        }
        Some(match (self.state.is_some(), self.event.is_some()) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        })
    }
}

/// The synchronization machine; see the module docs.
pub struct ClientSync<E: EditorPort> {
    session: SessionClient,
    editor: E,
    tx: mpsc::UnboundedSender<SyncEvent>,
    rx: mpsc::UnboundedReceiver<SyncEvent>,
    state: SyncState,
    state_tx: watch::Sender<SyncState>,
    /// Last server-acknowledged document.
    doc: Snapshot<BodyDelta>,
    /// Local edits not yet pushed.
    pending: BodyDelta,
    /// Remote-change events parked while an update is in flight.
    deferred: Vec<SyncEvent>,
    poll_active: bool,
    budget: ErrorBudget,
    timers: Vec<JoinHandle<()>>,
    caret_task: Option<JoinHandle<()>>,
}

impl<E: EditorPort> ClientSync<E> {
    /// A machine in `Detached`, ready for a `Start` event.
    pub fn new(session: SessionClient, editor: E) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SyncState::Detached);
        Self {
            session,
            editor,
            tx,
            rx,
            state: SyncState::Detached,
            state_tx,
            doc: Snapshot::genesis(),
            pending: BodyDelta::new(),
            deferred: Vec::new(),
            poll_active: false,
            budget: ErrorBudget::new(),
            timers: Vec::new(),
            caret_task: None,
        }
    }

    /// A handle for feeding events in (editor integration, embedder).
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            tx: self.tx.clone(),
        }
    }

    /// Observes state transitions (enable/disable UI, tests).
    pub fn state_watch(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Runs the event loop until `Shutdown`.
    pub async fn run(mut self) {
        let rules = Self::rules();
        while let Some(event) = self.rx.recv().await {
            if matches!(event, SyncEvent::Shutdown) {
                self.stop_everything();
                self.set_state(SyncState::Detached);
                break;
            }
            let kind = event.kind();
            let handler = Self::lookup(&rules, self.state, kind);
            trace!(state = ?self.state, event = ?kind, "dispatch");
            handler(&mut self, event);
        }
    }

    fn rules() -> Vec<Rule<E>> {
        use EventKind as Ev;
        use SyncState as St;
        let rule = |state, event, handler| Rule {
            state,
            event,
            handler,
        };
        vec![
            rule(Some(St::Detached), Some(Ev::Start), Self::on_start as Handler<E>),
            rule(Some(St::Starting), Some(Ev::GotSnapshot), Self::on_got_snapshot),
            rule(Some(St::Idle), Some(Ev::GotChangeAfter), Self::on_remote_change),
            rule(Some(St::Collecting), Some(Ev::GotChangeAfter), Self::on_remote_change),
            rule(Some(St::Merging), Some(Ev::GotChangeAfter), Self::on_defer_remote),
            rule(Some(St::Idle), Some(Ev::GotEditorEvent), Self::on_editor_event),
            rule(Some(St::Collecting), Some(Ev::GotEditorEvent), Self::on_editor_event),
            rule(Some(St::Merging), Some(Ev::GotEditorEvent), Self::on_editor_event),
            rule(Some(St::Collecting), Some(Ev::WantToUpdate), Self::on_want_to_update),
            rule(Some(St::Merging), Some(Ev::GotUpdate), Self::on_got_update),
            rule(Some(St::ErrorWait), Some(Ev::Start), Self::on_restart),
            rule(None, Some(Ev::WantInput), Self::on_want_input),
            rule(None, Some(Ev::GotCarets), Self::on_got_carets),
            rule(None, Some(Ev::ApiError), Self::on_api_error),
            // Terminal state swallows everything, including api errors.
            rule(Some(St::UnrecoverableError), None, Self::on_ignore),
            rule(None, None, Self::on_unhandled),
        ]
    }

    fn lookup(rules: &[Rule<E>], state: SyncState, kind: EventKind) -> Handler<E> {
        let mut best: Option<(u8, Handler<E>)> = None;
        for rule in rules {
            if let Some(rank) = rule.rank(state, kind) {
                if best.map_or(true, |(b, _)| rank > b) {
                    best = Some((rank, rule.handler));
                }
            }
        }
        best.map_or(Self::on_unhandled as Handler<E>, |(_, handler)| handler)
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn send(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Spawns a cancellable timer that posts `event` after `delay`.
    fn schedule(&mut self, delay: Duration, event: SyncEvent) {
        let tx = self.tx.clone();
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    fn stop_everything(&mut self) {
        self.cancel_timers();
        if let Some(task) = self.caret_task.take() {
            task.abort();
        }
        self.editor.set_enabled(false);
    }

    // ── handlers ────────────────────────────────────────────────────────

    fn on_start(&mut self, _event: SyncEvent) {
        self.set_state(SyncState::Starting);
        self.editor.set_enabled(false);
        let session = self.session.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match session.body_get_snapshot(None).await {
                Ok(snap) => SyncEvent::GotSnapshot(snap),
                Err(error) => SyncEvent::ApiError {
                    method: "body_getSnapshot",
                    error,
                },
            };
            let _ = tx.send(event);
        });
    }

    fn on_got_snapshot(&mut self, event: SyncEvent) {
        let SyncEvent::GotSnapshot(snap) = event else {
            return;
        };
        self.pending = BodyDelta::new();
        self.deferred.clear();
        self.poll_active = false;
        self.editor.load_document(&snap.contents);
        self.editor.set_enabled(true);
        self.doc = snap;
        self.set_state(SyncState::Idle);
        self.ensure_caret_task();
        self.send(SyncEvent::WantInput);
    }

    /// Arms the long-poll.
    ///
    /// This event arrives when polling should (re)start: entering idle,
    /// after a pull pause, or when the previous poll timed out — so the
    /// outstanding-poll flag resets here. A spurious double arm is
    /// harmless: the stale-revision check in the change handler drops the
    /// duplicate result.
    fn on_want_input(&mut self, _event: SyncEvent) {
        self.poll_active = false;
        if self.state != SyncState::Idle {
            return;
        }
        self.poll_active = true;
        let base = self.doc.rev_num;
        let session = self.session.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match session.body_get_change_after(base).await {
                Ok(change) => SyncEvent::GotChangeAfter(change),
                // An idle document is expected; just poll again.
                Err(error) if error.is(names::TIMED_OUT) => SyncEvent::WantInput,
                Err(error) => SyncEvent::ApiError {
                    method: "body_getChangeAfter",
                    error,
                },
            };
            let _ = tx.send(event);
        });
    }

    fn on_remote_change(&mut self, event: SyncEvent) {
        self.poll_active = false;
        let SyncEvent::GotChangeAfter(change) = event else {
            return;
        };
        if change.rev_num <= self.doc.rev_num {
            // A completion from before a restart; the snapshot already
            // covers it.
            self.schedule(PULL_DELAY, SyncEvent::WantInput);
            return;
        }
        let remote = change.delta;
        if self.pending.is_empty() {
            self.editor.apply_change(&remote, SYNC_SOURCE);
        } else {
            // Rebase the remote change over unpushed local edits, and the
            // local edits over the remote change, pairwise per the
            // transform contract so both sides land on the same text.
            let for_editor = self.pending.transform(&remote, false);
            let new_pending = remote.transform(&self.pending, true);
            self.editor.apply_change(&for_editor, SYNC_SOURCE);
            self.pending = new_pending;
        }
        self.doc = Snapshot {
            rev_num: change.rev_num,
            contents: self.doc.contents.compose(&remote, true),
        };
        self.schedule(PULL_DELAY, SyncEvent::WantInput);
    }

    fn on_defer_remote(&mut self, event: SyncEvent) {
        self.poll_active = false;
        self.deferred.push(event);
    }

    fn on_editor_event(&mut self, event: SyncEvent) {
        let SyncEvent::GotEditorEvent(editor_event) = event else {
            return;
        };
        match editor_event {
            EditorEvent::TextChange { delta, source } => {
                if source == SYNC_SOURCE {
                    // Our own application echoing back; never re-sent.
                    return;
                }
                self.pending = self.pending.compose(&delta, false);
                if self.state == SyncState::Idle {
                    self.set_state(SyncState::Collecting);
                    self.schedule(PUSH_DELAY, SyncEvent::WantToUpdate);
                }
            }
            EditorEvent::SelectionChange { index, length } => {
                let session = self.session.clone();
                let doc_rev = self.doc.rev_num;
                tokio::spawn(async move {
                    if let Err(err) = session.caret_update(doc_rev, index, length).await {
                        debug!(%err, "caret update failed");
                    }
                });
            }
        }
    }

    fn on_want_to_update(&mut self, _event: SyncEvent) {
        if self.pending.is_empty() {
            self.set_state(SyncState::Idle);
            self.send(SyncEvent::WantInput);
            return;
        }
        let mut sent = std::mem::replace(&mut self.pending, BodyDelta::new());
        // Editors drop trailing retains, so an edit near the top of the
        // document can arrive insert-only. Cover the rest of the base with
        // an explicit retain: the server requires incremental changes, not
        // whole-document replacements.
        let base_len = self.doc.contents.result_len();
        let consumed = sent.base_len();
        if consumed < base_len {
            sent = sent.retain(base_len - consumed);
        }
        self.set_state(SyncState::Merging);
        let base = self.doc.rev_num;
        let session = self.session.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match session.body_update(base, &sent).await {
                Ok(correction) => SyncEvent::GotUpdate { sent, correction },
                Err(error) => SyncEvent::ApiError {
                    method: "body_update",
                    error,
                },
            };
            let _ = tx.send(event);
        });
    }

    fn on_got_update(&mut self, event: SyncEvent) {
        let SyncEvent::GotUpdate { sent, correction } = event else {
            return;
        };
        let d_corr = correction.delta.clone();
        let d_more = std::mem::replace(&mut self.pending, BodyDelta::new());
        if d_corr.is_empty() {
            self.pending = d_more;
        } else {
            // Edits made during the round trip are reconciled with the
            // correction pairwise, so the editor does not jump back.
            let integrated = d_more.transform(&d_corr, false);
            self.editor.apply_change(&integrated, SYNC_SOURCE);
            self.pending = d_corr.transform(&d_more, true);
        }
        self.doc = Snapshot {
            rev_num: correction.rev_num,
            contents: self
                .doc
                .contents
                .compose(&sent, false)
                .compose(&d_corr, true),
        };
        for event in std::mem::take(&mut self.deferred) {
            self.send(event);
        }
        if self.pending.is_empty() {
            self.set_state(SyncState::Idle);
            self.schedule(PULL_DELAY, SyncEvent::WantInput);
        } else {
            self.set_state(SyncState::Collecting);
            self.schedule(PUSH_DELAY, SyncEvent::WantToUpdate);
        }
    }

    fn on_got_carets(&mut self, event: SyncEvent) {
        let SyncEvent::GotCarets(carets) = event else {
            return;
        };
        if matches!(
            self.state,
            SyncState::Idle | SyncState::Collecting | SyncState::Merging
        ) {
            self.editor.show_carets(&carets);
        }
    }

    fn on_api_error(&mut self, event: SyncEvent) {
        let SyncEvent::ApiError { method, error } = &event else {
            return;
        };
        warn!(method = *method, %error, "api error; editor disabled");
        self.poll_active = false;
        self.cancel_timers();
        self.editor.set_enabled(false);
        if self.budget.record(tokio::time::Instant::now()) {
            warn!("error budget exhausted; giving up on this client");
            self.stop_everything();
            self.set_state(SyncState::UnrecoverableError);
            return;
        }
        self.set_state(SyncState::ErrorWait);
        self.schedule(RESTART_DELAY, SyncEvent::Start);
    }

    fn on_restart(&mut self, _event: SyncEvent) {
        self.pending = BodyDelta::new();
        self.deferred.clear();
        self.set_state(SyncState::Detached);
        self.send(SyncEvent::Start);
    }

    fn on_ignore(&mut self, event: SyncEvent) {
        trace!(event = ?event.kind(), "ignored in terminal state");
    }

    fn on_unhandled(&mut self, event: SyncEvent) {
        debug!(state = ?self.state, event = ?event.kind(), "event not handled in this state");
    }

    /// Starts the caret tracking loop once.
    ///
    /// The loop seeds itself from `caret_getSnapshot`, then rides
    /// `caret_getChangeAfter`; a retention miss re-seeds, and channel
    /// errors back off without touching the error budget.
    fn ensure_caret_task(&mut self) {
        if self
            .caret_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let session = self.session.clone();
        let tx = self.tx.clone();
        self.caret_task = Some(tokio::spawn(async move {
            let mut view: Option<Snapshot<CaretDelta>> = None;
            loop {
                tokio::time::sleep(CARET_REQUEST_DELAY).await;
                match &view {
                    None => match session.caret_get_snapshot(None).await {
                        Ok(snap) => {
                            view = Some(snap.clone().into_snapshot());
                            let _ = tx.send(SyncEvent::GotCarets(snap));
                        }
                        Err(err) => {
                            debug!(%err, "caret seed failed; backing off");
                            tokio::time::sleep(CARET_ERROR_DELAY).await;
                        }
                    },
                    Some(current) => {
                        match session.caret_get_change_after(current.rev_num).await {
                            Ok(change) => {
                                let next = Snapshot {
                                    rev_num: change.rev_num,
                                    contents: current.contents.compose(&change.delta, true),
                                };
                                match CaretSnapshot::from_snapshot(&next) {
                                    Ok(snap) => {
                                        view = Some(next);
                                        let _ = tx.send(SyncEvent::GotCarets(snap));
                                    }
                                    Err(err) => {
                                        debug!(%err, "caret stream diverged; re-seeding");
                                        view = None;
                                    }
                                }
                            }
                            Err(err) if err.is(names::REVISION_NOT_AVAILABLE) => {
                                view = None;
                            }
                            Err(err) if err.is(names::TIMED_OUT) => {}
                            Err(err) => {
                                debug!(%err, "caret pull failed; backing off");
                                tokio::time::sleep(CARET_ERROR_DELAY).await;
                            }
                        }
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::editor::EditorPort;
    use scribe_proto::Codec;

    struct NullEditor;
    impl EditorPort for NullEditor {
        fn load_document(&mut self, _contents: &BodyDelta) {}
        fn apply_change(&mut self, _delta: &BodyDelta, _source: &str) {}
        fn set_enabled(&mut self, _enabled: bool) {}
        fn show_carets(&mut self, _carets: &CaretSnapshot) {}
    }

    fn machine() -> ClientSync<NullEditor> {
        let (out, _rx) = mpsc::channel(8);
        let api = ApiClient::new(Codec::new(), out);
        ClientSync::new(SessionClient::for_target(api, "doc"), NullEditor)
    }

    // ── rule-table precedence ───────────────────────────────────────────

    #[test]
    fn exact_rule_beats_wildcards() {
        let rules = ClientSync::<NullEditor>::rules();
        // (Merging, GotChangeAfter) has an exact row distinct from the
        // Idle/Collecting integration row.
        let exact = ClientSync::<NullEditor>::lookup(
            &rules,
            SyncState::Merging,
            EventKind::GotChangeAfter,
        );
        assert!(std::ptr::fn_addr_eq(
            exact,
            ClientSync::<NullEditor>::on_defer_remote as Handler<NullEditor>
        ));
        // ApiError matches the (any, event) row from every ordinary state.
        let err = ClientSync::<NullEditor>::lookup(&rules, SyncState::Idle, EventKind::ApiError);
        assert!(std::ptr::fn_addr_eq(
            err,
            ClientSync::<NullEditor>::on_api_error as Handler<NullEditor>
        ));
        // ... but the terminal state's (state, any) row outranks it.
        let terminal = ClientSync::<NullEditor>::lookup(
            &rules,
            SyncState::UnrecoverableError,
            EventKind::ApiError,
        );
        assert!(std::ptr::fn_addr_eq(
            terminal,
            ClientSync::<NullEditor>::on_ignore as Handler<NullEditor>
        ));
        // Nothing matches → the (any, any) fallthrough.
        let fallthrough =
            ClientSync::<NullEditor>::lookup(&rules, SyncState::Detached, EventKind::GotUpdate);
        assert!(std::ptr::fn_addr_eq(
            fallthrough,
            ClientSync::<NullEditor>::on_unhandled as Handler<NullEditor>
        ));
    }

    // ── machine starts detached ─────────────────────────────────────────

    #[test]
    fn starts_detached() {
        let machine = machine();
        assert_eq!(*machine.state_watch().borrow(), SyncState::Detached);
    }
}
