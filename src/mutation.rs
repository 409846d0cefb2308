use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GradeError, GradeResult};
use crate::gateway::BoxFuture;
use crate::models::{GradePatch, GradeRecord, NewGrade, RecordVariant};
use crate::sync::{GradeSyncSource, SyncMode};

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    Update(GradePatch),
    Delete,
}

impl MutationKind {
    pub fn label(&self) -> &'static str {
        match self {
            MutationKind::Update(_) => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// One mutation attempt plus the copy of the record it started from.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    pub record_id: Uuid,
    pub kind: MutationKind,
    pub rollback: Option<GradeRecord>,
}

impl MutationIntent {
    fn capture(source: &GradeSyncSource, record_id: Uuid, kind: MutationKind) -> Self {
        Self {
            record_id,
            kind,
            rollback: source.get(&record_id),
        }
    }

    fn roll_back(&self, source: &GradeSyncSource, error: &GradeError) {
        if let Some(record) = &self.rollback {
            source.upsert_local(record.clone());
        }
        warn!(
            record_id = %self.record_id,
            mutation = self.kind.label(),
            error = %error,
            "grade mutation rolled back"
        );
    }
}

/// Runs a gateway call under `timeout`, folding transport errors and hangs
/// into mutation failures.
pub(crate) async fn bounded_call<T>(
    timeout: Duration,
    record_id: Option<Uuid>,
    call: BoxFuture<'_, Result<T, GatewayError>>,
) -> GradeResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(GradeError::mutation_failed(record_id, error.to_string())),
        Err(_) => Err(GradeError::TimeoutFailed {
            record_id,
            after: timeout,
        }),
    }
}

#[derive(Clone)]
pub struct OptimisticMutationCoordinator {
    source: GradeSyncSource,
    timeout: Duration,
}

impl OptimisticMutationCoordinator {
    pub fn new(source: GradeSyncSource, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub async fn apply_update(
        &self,
        record_id: Uuid,
        patch: GradePatch,
    ) -> GradeResult<GradeRecord> {
        patch.validate()?;
        match self.source.mode() {
            SyncMode::Streaming => self.update_optimistic(record_id, patch).await,
            SyncMode::Polling => self.update_remote_first(record_id, patch).await,
        }
    }

    pub async fn apply_delete(&self, record_id: Uuid) -> GradeResult<bool> {
        match self.source.mode() {
            SyncMode::Streaming => self.delete_optimistic(record_id).await,
            SyncMode::Polling => self.delete_remote_first(record_id).await,
        }
    }

    /// Creation has no local id to show ahead of the store, so it is remote
    /// first in both modes. In streaming mode the returned record is shown
    /// right away unless the feed already reported a later state of it; the
    /// feed echo lands on the same id.
    pub async fn apply_create(&self, data: NewGrade) -> GradeResult<GradeRecord> {
        data.validate()?;
        let window = self.source.open_window();
        let gateway = self.source.gateway();
        let returned = bounded_call(self.timeout, None, gateway.create(&data)).await?;
        let Some(variant) = returned else {
            return Err(GradeError::mutation_failed(None, "store did not accept the new grade"));
        };
        let record = GradeRecord::try_from(variant).map_err(|error| {
            GradeError::mutation_failed(None, format!("store returned an invalid grade: {error}"))
        })?;
        info!(record_id = %record.id, "grade created");

        match self.source.mode() {
            SyncMode::Streaming => {
                if !self.source.upsert_unless_changed(&window, record.clone()) {
                    debug!(record_id = %record.id, "feed already moved past the created grade");
                }
            }
            SyncMode::Polling => {
                drop(window);
                self.refresh().await;
            }
        }
        Ok(record)
    }

    /// Writes `data` into its slot: updates the record already holding that
    /// trimester (or the recovery slot), creates one otherwise.
    pub async fn record_grade(&self, data: NewGrade) -> GradeResult<GradeRecord> {
        data.validate()?;
        let existing = self
            .source
            .snapshot()
            .find_slot(&data.slot())
            .map(|record| record.id);
        match existing {
            Some(record_id) => self.apply_update(record_id, GradePatch::from(&data)).await,
            None => self.apply_create(data).await,
        }
    }

    async fn update_optimistic(
        &self,
        record_id: Uuid,
        patch: GradePatch,
    ) -> GradeResult<GradeRecord> {
        let intent =
            MutationIntent::capture(&self.source, record_id, MutationKind::Update(patch.clone()));
        let Some(current) = intent.rollback.as_ref() else {
            return Err(GradeError::NotFound(record_id));
        };
        let optimistic = current.apply_patch(&patch);
        self.source.upsert_local(optimistic.clone());
        debug!(record_id = %record_id, "optimistic grade update applied");

        let gateway = self.source.gateway();
        let outcome = bounded_call(self.timeout, Some(record_id), gateway.update(record_id, &patch))
            .await
            .and_then(|returned| confirmed(record_id, returned));

        match outcome {
            Ok(Some(authoritative)) => {
                self.source.upsert_local(authoritative.clone());
                info!(record_id = %record_id, "grade update confirmed");
                Ok(authoritative)
            }
            Ok(None) => {
                info!(record_id = %record_id, "grade update confirmed");
                Ok(optimistic)
            }
            Err(error) => {
                intent.roll_back(&self.source, &error);
                Err(error)
            }
        }
    }

    async fn update_remote_first(
        &self,
        record_id: Uuid,
        patch: GradePatch,
    ) -> GradeResult<GradeRecord> {
        let gateway = self.source.gateway();
        let returned =
            bounded_call(self.timeout, Some(record_id), gateway.update(record_id, &patch)).await?;
        let record = match confirmed(record_id, returned)? {
            Some(record) => record,
            None => {
                let current = self.source.get(&record_id);
                current.map(|record| record.apply_patch(&patch)).ok_or_else(|| {
                    GradeError::mutation_failed(Some(record_id), "store returned an invalid grade")
                })?
            }
        };
        info!(record_id = %record_id, "grade update accepted");
        self.refresh().await;
        Ok(record)
    }

    async fn delete_optimistic(&self, record_id: Uuid) -> GradeResult<bool> {
        let intent = MutationIntent::capture(&self.source, record_id, MutationKind::Delete);
        self.source.remove_local(record_id);
        debug!(record_id = %record_id, "optimistic grade delete applied");

        let gateway = self.source.gateway();
        let outcome = bounded_call(self.timeout, Some(record_id), gateway.delete(record_id)).await;

        match outcome {
            Ok(true) => {
                info!(record_id = %record_id, "grade delete confirmed");
                Ok(true)
            }
            Ok(false) => {
                let error =
                    GradeError::mutation_failed(Some(record_id), "store refused the delete");
                intent.roll_back(&self.source, &error);
                Err(error)
            }
            Err(error) => {
                intent.roll_back(&self.source, &error);
                Err(error)
            }
        }
    }

    async fn delete_remote_first(&self, record_id: Uuid) -> GradeResult<bool> {
        let gateway = self.source.gateway();
        let deleted = bounded_call(self.timeout, Some(record_id), gateway.delete(record_id)).await?;
        if !deleted {
            return Err(GradeError::mutation_failed(Some(record_id), "store refused the delete"));
        }
        info!(record_id = %record_id, "grade delete accepted");
        self.refresh().await;
        Ok(true)
    }

    /// A failed refetch after an accepted write leaves the previous snapshot
    /// in place; the write itself still succeeded.
    async fn refresh(&self) {
        if let Err(error) = self.source.fetch_all().await {
            warn!(error = %error, "refetch after mutation failed");
        }
    }
}

/// `None` from the store is a rejection. A returned record that fails
/// normalization means the write went through but the copy is unusable, so
/// the caller keeps its own version.
fn confirmed(
    record_id: Uuid,
    returned: Option<RecordVariant>,
) -> GradeResult<Option<GradeRecord>> {
    let Some(variant) = returned else {
        return Err(GradeError::mutation_failed(
            Some(record_id),
            "store rejected the update",
        ));
    };
    match GradeRecord::try_from(variant) {
        Ok(record) => Ok(Some(record)),
        Err(error) => {
            warn!(record_id = %record_id, error = %error, "store returned an unusable grade copy");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::error::ValidationError;
    use crate::gateway::testing::{sample, ScriptedGateway};
    use crate::gateway::RemoteGradeGateway;
    use crate::models::RecordKind;

    async fn streaming_setup(
        records: &[GradeRecord],
    ) -> (Arc<ScriptedGateway>, GradeSyncSource, OptimisticMutationCoordinator) {
        let gateway = ScriptedGateway::streaming();
        gateway.seed(records);
        let source = GradeSyncSource::new(gateway.clone(), SyncMode::Streaming);
        source.start().await.expect("start");
        let coordinator =
            OptimisticMutationCoordinator::new(source.clone(), Duration::from_secs(2));
        (gateway, source, coordinator)
    }

    async fn polling_setup(
        records: &[GradeRecord],
    ) -> (Arc<ScriptedGateway>, GradeSyncSource, OptimisticMutationCoordinator) {
        let gateway = ScriptedGateway::polling();
        gateway.seed(records);
        let source = GradeSyncSource::new(gateway.clone(), SyncMode::Polling);
        source.start().await.expect("start");
        let coordinator =
            OptimisticMutationCoordinator::new(source.clone(), Duration::from_secs(2));
        (gateway, source, coordinator)
    }

    #[tokio::test]
    async fn out_of_range_patch_fails_before_any_call() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        let before = source.snapshot();

        let error = coordinator
            .apply_update(record.id, GradePatch::value(11.0))
            .await
            .expect_err("invalid patch");
        assert!(matches!(
            error,
            GradeError::Validation(ValidationError::InvalidGradeValue(_))
        ));
        assert_eq!(source.snapshot(), before);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streaming_update_is_visible_before_the_store_answers() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        let (entered, release) = gateway.hold_next();

        let pending = {
            let coordinator = coordinator.clone();
            let id = record.id;
            tokio::spawn(async move { coordinator.apply_update(id, GradePatch::value(8.5)).await })
        };
        entered.notified().await;
        assert_eq!(source.get(&record.id).map(|r| r.value), Some(8.5));

        release.notify_one();
        let updated = pending.await.expect("join").expect("update");
        assert_eq!(updated.value, 8.5);
        assert_eq!(gateway.stored(record.id).map(|r| r.value), Some(8.5));
    }

    #[tokio::test]
    async fn rejected_streaming_update_restores_snapshot() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        gateway.reject(record.id);
        let before = source.snapshot();

        let error = coordinator
            .apply_update(record.id, GradePatch::value(9.0))
            .await
            .expect_err("rejected");
        assert!(error.is_mutation_failure());
        assert_eq!(source.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_streaming_delete_restores_the_record() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        gateway.reject(record.id);
        let (entered, release) = gateway.hold_next();

        let pending = {
            let coordinator = coordinator.clone();
            let id = record.id;
            tokio::spawn(async move { coordinator.apply_delete(id).await })
        };
        entered.notified().await;
        assert!(!source.snapshot().contains(&record.id));

        release.notify_one();
        let error = pending.await.expect("join").expect_err("rejected");
        assert!(error.is_mutation_failure());
        assert_eq!(source.get(&record.id), Some(record));
    }

    #[tokio::test]
    async fn hung_update_times_out_and_rolls_back() {
        let record = sample(5.0, 1);
        let gateway = ScriptedGateway::streaming();
        gateway.seed(&[record.clone()]);
        let source = GradeSyncSource::new(gateway.clone(), SyncMode::Streaming);
        source.start().await.expect("start");
        let coordinator =
            OptimisticMutationCoordinator::new(source.clone(), Duration::from_millis(50));
        let before = source.snapshot();
        gateway.hang.store(true, Ordering::SeqCst);

        let error = coordinator
            .apply_update(record.id, GradePatch::value(9.0))
            .await
            .expect_err("timeout");
        assert!(matches!(error, GradeError::TimeoutFailed { .. }));
        assert!(error.is_mutation_failure());
        assert_eq!(source.snapshot(), before);
    }

    #[tokio::test]
    async fn streaming_update_of_unknown_record_is_not_found() {
        let (gateway, _source, coordinator) = streaming_setup(&[]).await;
        let error = coordinator
            .apply_update(Uuid::new_v4(), GradePatch::value(6.0))
            .await
            .expect_err("unknown");
        assert!(matches!(error, GradeError::NotFound(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn polling_update_refetches_after_success() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = polling_setup(&[record.clone()]).await;
        let lists_before = gateway.list_calls.load(Ordering::SeqCst);

        let updated = coordinator
            .apply_update(record.id, GradePatch::value(7.5))
            .await
            .expect("update");
        assert_eq!(updated.value, 7.5);
        assert_eq!(gateway.list_calls.load(Ordering::SeqCst), lists_before + 1);
        assert_eq!(source.get(&record.id).map(|r| r.value), Some(7.5));
    }

    #[tokio::test]
    async fn rejected_polling_update_leaves_snapshot_untouched() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = polling_setup(&[record.clone()]).await;
        gateway.reject(record.id);
        let before = source.snapshot();
        let lists_before = gateway.list_calls.load(Ordering::SeqCst);

        let error = coordinator
            .apply_update(record.id, GradePatch::value(7.5))
            .await
            .expect_err("rejected");
        assert!(error.is_mutation_failure());
        assert_eq!(source.snapshot(), before);
        assert_eq!(gateway.list_calls.load(Ordering::SeqCst), lists_before);
    }

    #[tokio::test]
    async fn polling_delete_refetches() {
        let record = sample(5.0, 1);
        let (_gateway, source, coordinator) = polling_setup(&[record.clone()]).await;

        assert!(coordinator.apply_delete(record.id).await.expect("delete"));
        assert!(source.snapshot().is_empty());
    }

    #[tokio::test]
    async fn created_record_is_not_duplicated_by_the_feed_echo() {
        let (_gateway, source, coordinator) = streaming_setup(&[]).await;
        let created = coordinator
            .apply_create(NewGrade {
                student_id: Uuid::new_v4(),
                subject_id: Uuid::new_v4(),
                trimester: 2,
                value: 6.0,
                comment: None,
                kind: RecordKind::Regular,
            })
            .await
            .expect("create");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.snapshot().len(), 1);
        assert_eq!(source.get(&created.id), Some(created));
    }

    #[tokio::test]
    async fn record_grade_updates_the_existing_slot() {
        let record = sample(4.0, 2);
        let (_gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;

        let written = coordinator
            .record_grade(NewGrade {
                student_id: record.student_id,
                subject_id: record.subject_id,
                trimester: 2,
                value: 6.5,
                comment: Some("retake".to_string()),
                kind: RecordKind::Regular,
            })
            .await
            .expect("record");
        assert_eq!(written.id, record.id);
        assert_eq!(source.snapshot().len(), 1);
        assert_eq!(
            source.get(&record.id).and_then(|r| r.comment),
            Some("retake".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_updates_keep_their_own_rollback() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        let (entered, release) = gateway.hold_next();

        let first = {
            let coordinator = coordinator.clone();
            let id = record.id;
            tokio::spawn(async move { coordinator.apply_update(id, GradePatch::value(6.0)).await })
        };
        entered.notified().await;
        gateway.reject(record.id);

        let error = coordinator
            .apply_update(record.id, GradePatch::value(9.0))
            .await
            .expect_err("second rejected");
        assert!(error.is_mutation_failure());
        assert_eq!(source.get(&record.id).map(|r| r.value), Some(6.0));

        release.notify_one();
        let result = pending_result(first).await;
        assert!(result.is_err());
        assert_eq!(source.get(&record.id), Some(record));
    }

    #[tokio::test]
    async fn hung_delete_times_out_and_restores_the_record() {
        let record = sample(5.0, 1);
        let gateway = ScriptedGateway::streaming();
        gateway.seed(&[record.clone()]);
        let source = GradeSyncSource::new(gateway.clone(), SyncMode::Streaming);
        source.start().await.expect("start");
        let coordinator =
            OptimisticMutationCoordinator::new(source.clone(), Duration::from_millis(50));
        gateway.hang_on(record.id);

        let error = coordinator
            .apply_delete(record.id)
            .await
            .expect_err("timeout");
        assert!(matches!(
            error,
            GradeError::TimeoutFailed { record_id: Some(id), .. } if id == record.id
        ));
        assert_eq!(source.get(&record.id), Some(record));
    }

    #[tokio::test]
    async fn refused_streaming_delete_restores_the_record() {
        let record = sample(5.0, 1);
        let (gateway, source, coordinator) = streaming_setup(&[record.clone()]).await;
        gateway.forget(record.id);

        let error = coordinator
            .apply_delete(record.id)
            .await
            .expect_err("refused");
        assert!(matches!(error, GradeError::MutationFailed { .. }));
        assert_eq!(source.get(&record.id), Some(record));
    }

    #[tokio::test]
    async fn create_does_not_resurrect_a_grade_the_feed_deleted() {
        let (gateway, source, coordinator) = streaming_setup(&[]).await;
        let (written, release) = gateway.hold_next_reply();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .apply_create(NewGrade {
                        student_id: Uuid::new_v4(),
                        subject_id: Uuid::new_v4(),
                        trimester: 1,
                        value: 6.0,
                        comment: None,
                        kind: RecordKind::Regular,
                    })
                    .await
            })
        };
        written.notified().await;
        let id = gateway.stored_ids()[0];
        assert!(gateway.delete(id).await.expect("delete"));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        release.notify_one();
        let created = pending.await.expect("join").expect("create");
        assert_eq!(created.id, id);
        assert!(source.snapshot().is_empty());
    }

    #[test]
    fn intent_keeps_the_starting_copy() {
        let record = sample(5.0, 1);
        let gateway = ScriptedGateway::streaming();
        let source = GradeSyncSource::new(gateway, SyncMode::Streaming);
        source.upsert_local(record.clone());

        let intent = MutationIntent::capture(&source, record.id, MutationKind::Delete);
        assert_eq!(intent.kind.label(), "delete");
        assert_eq!(intent.rollback, Some(record));
    }

    async fn pending_result(
        handle: tokio::task::JoinHandle<GradeResult<GradeRecord>>,
    ) -> GradeResult<GradeRecord> {
        handle.await.expect("join")
    }
}
