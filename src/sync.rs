use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GradeError, GradeResult};
use crate::gateway::{FeedEvent, FeedReceiver, RemoteGradeGateway};
use crate::models::{GradeRecord, GradeSlot, RecordVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Explicit fetch-and-replace.
    #[default]
    Polling,
    /// Incremental state from the gateway's push feed.
    Streaming,
}

/// Grade records currently believed correct, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    records: HashMap<Uuid, GradeRecord>,
}

impl SyncSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = GradeRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.id, record))
                .collect(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&GradeRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ordered by creation time, ids breaking ties.
    pub fn records(&self) -> Vec<GradeRecord> {
        let mut values: Vec<GradeRecord> = self.records.values().cloned().collect();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        values
    }

    pub fn for_pair(&self, student_id: Uuid, subject_id: Uuid) -> Vec<GradeRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.student_id == student_id && record.subject_id == subject_id)
            .collect()
    }

    pub fn find_slot(&self, slot: &GradeSlot) -> Option<&GradeRecord> {
        self.records.values().find(|record| record.slot() == *slot)
    }

    fn upsert(&mut self, record: GradeRecord) -> Option<GradeRecord> {
        self.records.insert(record.id, record)
    }

    fn remove(&mut self, id: &Uuid) -> Option<GradeRecord> {
        self.records.remove(id)
    }
}

/// What presentation renders: the records plus the flags that drive
/// spinners and staleness banners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncView {
    pub records: Vec<GradeRecord>,
    pub loading: bool,
    pub is_streaming: bool,
    pub stale: bool,
}

/// A feed event after normalization, as it was applied to the snapshot.
#[derive(Debug, Clone)]
enum FeedChange {
    Upsert(GradeRecord),
    Remove(Uuid),
}

impl FeedChange {
    fn record_id(&self) -> Uuid {
        match self {
            FeedChange::Upsert(record) => record.id,
            FeedChange::Remove(id) => *id,
        }
    }

    fn apply_to(&self, snapshot: &mut SyncSnapshot) {
        match self {
            FeedChange::Upsert(record) => {
                snapshot.upsert(record.clone());
            }
            FeedChange::Remove(id) => {
                snapshot.remove(id);
            }
        }
    }
}

#[derive(Default)]
struct SourceState {
    snapshot: SyncSnapshot,
    loading: bool,
    stale: bool,
    /// Feed changes applied so far.
    feed_seq: u64,
    open_windows: usize,
    /// Changes applied while at least one window is open, tagged with their
    /// `feed_seq`. Empty whenever no window is open.
    journal: Vec<(u64, FeedChange)>,
}

impl SourceState {
    fn changes_since(&self, since: u64) -> impl Iterator<Item = &FeedChange> {
        self.journal
            .iter()
            .filter(move |(seq, _)| *seq > since)
            .map(|(_, change)| change)
    }
}

/// Opened before a gateway call whose answer lands in the snapshot. Feed
/// changes applied while it is open are journaled, so that answer can be
/// reconciled with everything the feed said in the meantime.
pub(crate) struct FeedWindow<'a> {
    source: &'a GradeSyncSource,
    since: u64,
}

impl Drop for FeedWindow<'_> {
    fn drop(&mut self) {
        let mut state = self.source.state();
        state.open_windows = state.open_windows.saturating_sub(1);
        if state.open_windows == 0 {
            state.journal.clear();
        }
    }
}

struct SourceInner {
    mode: SyncMode,
    gateway: Arc<dyn RemoteGradeGateway>,
    state: Mutex<SourceState>,
    view: watch::Sender<SyncView>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the snapshot. Every change to it goes through this type, and
/// every change is republished on the view channel.
#[derive(Clone)]
pub struct GradeSyncSource {
    inner: Arc<SourceInner>,
}

impl GradeSyncSource {
    pub fn new(gateway: Arc<dyn RemoteGradeGateway>, mode: SyncMode) -> Self {
        let (view, _) = watch::channel(SyncView {
            is_streaming: mode == SyncMode::Streaming,
            ..SyncView::default()
        });
        Self {
            inner: Arc::new(SourceInner {
                mode,
                gateway,
                state: Mutex::new(SourceState::default()),
                view,
                feed_task: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.inner.mode
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.mode == SyncMode::Streaming
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGradeGateway> {
        &self.inner.gateway
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.state().snapshot.clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<GradeRecord> {
        self.state().snapshot.get(id).cloned()
    }

    pub fn records(&self) -> Vec<GradeRecord> {
        self.state().snapshot.records()
    }

    pub fn loading(&self) -> bool {
        self.state().loading
    }

    pub fn is_stale(&self) -> bool {
        self.state().stale
    }

    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.inner.view.subscribe()
    }

    /// Loads the initial snapshot and, in streaming mode, attaches the feed.
    /// The feed is subscribed before the initial fetch so nothing written in
    /// between is missed.
    pub async fn start(&self) -> GradeResult<()> {
        match self.inner.mode {
            SyncMode::Polling => {
                self.fetch_all().await?;
            }
            SyncMode::Streaming => {
                if !self.inner.gateway.supports_feed() {
                    return Err(GradeError::StreamDegraded(
                        "gateway does not offer a push feed".to_string(),
                    ));
                }
                let feed = self.inner.gateway.subscribe().await?;
                self.fetch_all().await?;
                self.attach_feed(feed);
            }
        }
        Ok(())
    }

    /// Replaces the whole snapshot with the gateway's list. Feed changes
    /// applied while the list was in flight are newer than it and are
    /// replayed on top. On failure the previous snapshot stays in place.
    pub async fn fetch_all(&self) -> GradeResult<usize> {
        let window = self.open_window();
        self.update_state(|state| state.loading = true);

        match self.inner.gateway.list().await {
            Ok(variants) => {
                let mut snapshot = normalize_all(variants);
                let since = window.since;
                let (count, replayed) = self.update_state(|state| {
                    let mut replayed = 0usize;
                    for change in state.changes_since(since) {
                        change.apply_to(&mut snapshot);
                        replayed += 1;
                    }
                    let count = snapshot.len();
                    state.snapshot = snapshot;
                    state.loading = false;
                    (count, replayed)
                });
                debug!(count, replayed, mode = ?self.inner.mode, "grade snapshot replaced");
                Ok(count)
            }
            Err(error) => {
                self.update_state(|state| state.loading = false);
                warn!(error = %error, "grade fetch failed, keeping previous snapshot");
                Err(error.into())
            }
        }
    }

    /// Applies one feed event. Callers must deliver events in feed order.
    pub fn apply_event(&self, event: FeedEvent) {
        let change = match event {
            FeedEvent::Inserted(variant) | FeedEvent::Updated(variant) => {
                match normalize(variant) {
                    Some(record) => FeedChange::Upsert(record),
                    None => return,
                }
            }
            FeedEvent::Deleted(id) => FeedChange::Remove(id),
        };
        debug!(record_id = %change.record_id(), "feed change");
        self.update_state(|state| {
            state.feed_seq += 1;
            change.apply_to(&mut state.snapshot);
            if state.open_windows > 0 {
                let seq = state.feed_seq;
                state.journal.push((seq, change));
            }
        });
    }

    /// Stops the feed and drops the snapshot.
    pub fn shutdown(&self) {
        if let Some(task) = self.feed_slot().take() {
            task.abort();
        }
        self.update_state(|state| {
            state.snapshot = SyncSnapshot::default();
            state.loading = false;
            state.stale = false;
        });
        info!("grade sync source shut down");
    }

    pub(crate) fn open_window(&self) -> FeedWindow<'_> {
        let since = {
            let mut state = self.state();
            state.open_windows += 1;
            state.feed_seq
        };
        FeedWindow {
            source: self,
            since,
        }
    }

    /// Upserts `record` unless the feed changed the same id after `window`
    /// opened, in which case the feed's version is the newer one.
    pub(crate) fn upsert_unless_changed(
        &self,
        window: &FeedWindow<'_>,
        record: GradeRecord,
    ) -> bool {
        let since = window.since;
        self.update_state(|state| {
            let id = record.id;
            if state.changes_since(since).any(|change| change.record_id() == id) {
                return false;
            }
            state.snapshot.upsert(record);
            true
        })
    }

    pub(crate) fn upsert_local(&self, record: GradeRecord) -> Option<GradeRecord> {
        self.update_state(|state| state.snapshot.upsert(record))
    }

    pub(crate) fn upsert_many_local(&self, records: Vec<GradeRecord>) {
        self.update_state(|state| {
            for record in records {
                state.snapshot.upsert(record);
            }
        });
    }

    pub(crate) fn remove_local(&self, id: Uuid) -> Option<GradeRecord> {
        self.update_state(|state| state.snapshot.remove(&id))
    }

    pub(crate) fn remove_many_local(&self, ids: &[Uuid]) -> Vec<GradeRecord> {
        self.update_state(|state| {
            ids.iter()
                .filter_map(|id| state.snapshot.remove(id))
                .collect()
        })
    }

    pub(crate) fn mark_degraded(&self, reason: &str) {
        self.update_state(|state| state.stale = true);
        warn!(reason, "grade feed degraded, serving last known snapshot");
    }

    fn attach_feed(&self, feed: FeedReceiver) {
        self.update_state(|state| state.stale = false);
        let task = tokio::spawn(pump(Arc::downgrade(&self.inner), feed));
        if let Some(previous) = self.feed_slot().replace(task) {
            previous.abort();
        }
        info!("grade feed attached");
    }

    fn update_state<R>(&self, change: impl FnOnce(&mut SourceState) -> R) -> R {
        let (result, view) = {
            let mut state = self.state();
            let result = change(&mut state);
            let view = SyncView {
                records: state.snapshot.records(),
                loading: state.loading,
                is_streaming: self.is_streaming(),
                stale: state.stale,
            };
            (result, view)
        };
        self.inner.view.send_replace(view);
        result
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn feed_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .feed_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump(inner: Weak<SourceInner>, mut feed: FeedReceiver) {
    while let Some(message) = feed.recv().await {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let source = GradeSyncSource { inner: strong };
        match message {
            Ok(event) => source.apply_event(event),
            Err(error) => {
                source.mark_degraded(&error.to_string());
                return;
            }
        }
    }
    if let Some(strong) = inner.upgrade() {
        GradeSyncSource { inner: strong }.mark_degraded("feed closed");
    }
}

fn normalize(variant: RecordVariant) -> Option<GradeRecord> {
    match GradeRecord::try_from(variant) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!(error = %error, "dropping grade record that failed normalization");
            None
        }
    }
}

fn normalize_all(variants: Vec<RecordVariant>) -> SyncSnapshot {
    SyncSnapshot::from_records(variants.into_iter().filter_map(normalize))
}
