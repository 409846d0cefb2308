use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GradeError, GradeResult};
use crate::models::GradeRecord;
use crate::mutation::bounded_call;
use crate::sync::{GradeSyncSource, SyncMode};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub succeeded_ids: Vec<Uuid>,
    pub failed_ids: Vec<Uuid>,
}

impl BulkOutcome {
    pub fn failed_count(&self) -> usize {
        self.failed_ids.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_ids.is_empty()
    }

    /// The succeeded ids, or `PartialBulkFailure` naming the ids that stayed.
    pub fn into_result(self) -> GradeResult<Vec<Uuid>> {
        if self.failed_ids.is_empty() {
            Ok(self.succeeded_ids)
        } else {
            Err(GradeError::PartialBulkFailure {
                total: self.succeeded_ids.len() + self.failed_ids.len(),
                failed_ids: self.failed_ids,
            })
        }
    }
}

#[derive(Clone)]
pub struct BulkOperationCoordinator {
    source: GradeSyncSource,
    timeout: Duration,
}

impl BulkOperationCoordinator {
    pub fn new(source: GradeSyncSource, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Removes every id locally, then deletes them concurrently. Each id
    /// succeeds or fails on its own; only the failed ones come back.
    pub async fn bulk_delete(&self, ids: &[Uuid]) -> BulkOutcome {
        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return BulkOutcome::default();
        }

        let captured: HashMap<Uuid, GradeRecord> = self
            .source
            .remove_many_local(&ids)
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        let mut tasks = JoinSet::new();
        for id in ids.iter().copied() {
            let gateway = Arc::clone(self.source.gateway());
            let timeout = self.timeout;
            tasks.spawn(async move {
                let result = bounded_call(timeout, Some(id), gateway.delete(id)).await;
                (id, result)
            });
        }

        let mut deleted: HashSet<Uuid> = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(true))) => {
                    deleted.insert(id);
                }
                Ok((id, Ok(false))) => {
                    warn!(record_id = %id, "store refused bulk delete");
                }
                Ok((id, Err(error))) => {
                    warn!(record_id = %id, error = %error, "bulk delete failed");
                }
                Err(error) => {
                    warn!(error = %error, "bulk delete task aborted");
                }
            }
        }

        let (succeeded_ids, failed_ids): (Vec<Uuid>, Vec<Uuid>) =
            ids.iter().partition(|id| deleted.contains(*id));
        let outcome = BulkOutcome {
            succeeded_ids,
            failed_ids,
        };

        if outcome.is_complete() {
            info!(count = outcome.succeeded_ids.len(), "bulk delete finished");
        } else {
            warn!(
                succeeded = outcome.succeeded_ids.len(),
                failed = outcome.failed_count(),
                "bulk delete partially failed"
            );
            self.restore_failed(&outcome.failed_ids, captured).await;
        }
        outcome
    }

    /// Puts back exactly the ids whose delete failed. Polling refetches them
    /// from the store; streaming uses the captured copies, since an unchanged
    /// record produces no feed event.
    async fn restore_failed(
        &self,
        failed_ids: &[Uuid],
        mut captured: HashMap<Uuid, GradeRecord>,
    ) {
        let wanted: HashSet<Uuid> = failed_ids.iter().copied().collect();

        if self.source.mode() == SyncMode::Polling {
            match self.refetch(&wanted).await {
                Ok(records) => {
                    self.source.upsert_many_local(records);
                    return;
                }
                Err(error) => {
                    warn!(
                        error = %error,
                        "refetch of failed ids failed, restoring captured copies"
                    );
                }
            }
        }

        let records: Vec<GradeRecord> = failed_ids
            .iter()
            .filter_map(|id| captured.remove(id))
            .collect();
        self.source.upsert_many_local(records);
    }

    async fn refetch(&self, wanted: &HashSet<Uuid>) -> GradeResult<Vec<GradeRecord>> {
        let gateway = self.source.gateway();
        let variants = tokio::time::timeout(self.timeout, gateway.list())
            .await
            .map_err(|_| GradeError::TimeoutFailed {
                record_id: None,
                after: self.timeout,
            })??;
        Ok(variants
            .into_iter()
            .filter_map(|variant| GradeRecord::try_from(variant).ok())
            .filter(|record| wanted.contains(&record.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::gateway::testing::{sample, ScriptedGateway};

    async fn setup(
        mode: SyncMode,
        records: &[GradeRecord],
    ) -> (Arc<ScriptedGateway>, GradeSyncSource, BulkOperationCoordinator) {
        let gateway = match mode {
            SyncMode::Polling => ScriptedGateway::polling(),
            SyncMode::Streaming => ScriptedGateway::streaming(),
        };
        gateway.seed(records);
        let source = GradeSyncSource::new(gateway.clone(), mode);
        source.start().await.expect("start");
        let bulk = BulkOperationCoordinator::new(source.clone(), Duration::from_secs(2));
        (gateway, source, bulk)
    }

    #[tokio::test]
    async fn partial_failure_keeps_only_the_failed_record() {
        for mode in [SyncMode::Streaming, SyncMode::Polling] {
            let a = sample(5.0, 1);
            let b = sample(6.0, 2);
            let c = sample(7.0, 3);
            let (gateway, source, bulk) = setup(mode, &[a.clone(), b.clone(), c.clone()]).await;
            gateway.reject(b.id);

            let outcome = bulk.bulk_delete(&[a.id, b.id, c.id]).await;
            assert_eq!(outcome.succeeded_ids, vec![a.id, c.id]);
            assert_eq!(outcome.failed_ids, vec![b.id]);

            let snapshot = source.snapshot();
            assert!(!snapshot.contains(&a.id));
            assert!(!snapshot.contains(&c.id));
            assert_eq!(snapshot.get(&b.id), Some(&b));
            assert_eq!(snapshot.len(), 1);
        }
    }

    #[tokio::test]
    async fn partial_failure_surfaces_as_error_with_ids() {
        let a = sample(5.0, 1);
        let b = sample(6.0, 2);
        let (gateway, _source, bulk) = setup(SyncMode::Streaming, &[a.clone(), b.clone()]).await;
        gateway.reject(b.id);

        let error = bulk
            .bulk_delete(&[a.id, b.id])
            .await
            .into_result()
            .expect_err("partial");
        match error {
            GradeError::PartialBulkFailure { failed_ids, total } => {
                assert_eq!(failed_ids, vec![b.id]);
                assert_eq!(total, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn complete_bulk_delete_clears_everything() {
        let records = vec![sample(5.0, 1), sample(6.0, 2)];
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let (_gateway, source, bulk) = setup(SyncMode::Polling, &records).await;

        let outcome = bulk.bulk_delete(&ids).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.into_result().expect("complete"), ids);
        assert!(source.snapshot().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_deleted_once() {
        let record = sample(5.0, 1);
        let (gateway, _source, bulk) = setup(SyncMode::Streaming, &[record.clone()]).await;

        let outcome = bulk.bulk_delete(&[record.id, record.id]).await;
        assert_eq!(outcome.succeeded_ids, vec![record.id]);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn polling_restore_falls_back_to_captured_copies() {
        let a = sample(5.0, 1);
        let (gateway, source, bulk) = setup(SyncMode::Polling, &[a.clone()]).await;
        gateway.reject(a.id);
        gateway.fail_list.store(true, Ordering::SeqCst);

        let outcome = bulk.bulk_delete(&[a.id]).await;
        assert_eq!(outcome.failed_ids, vec![a.id]);
        assert_eq!(source.get(&a.id), Some(a));
    }

    #[tokio::test]
    async fn timed_out_id_is_reported_failed_and_restored() {
        let a = sample(5.0, 1);
        let b = sample(6.0, 2);
        let gateway = ScriptedGateway::streaming();
        gateway.seed(&[a.clone(), b.clone()]);
        let source = GradeSyncSource::new(gateway.clone(), SyncMode::Streaming);
        source.start().await.expect("start");
        let bulk = BulkOperationCoordinator::new(source.clone(), Duration::from_millis(50));
        gateway.hang_on(b.id);

        let outcome = bulk.bulk_delete(&[a.id, b.id]).await;
        assert_eq!(outcome.succeeded_ids, vec![a.id]);
        assert_eq!(outcome.failed_ids, vec![b.id]);
        assert_eq!(source.get(&b.id), Some(b));
        assert!(!source.snapshot().contains(&a.id));
    }

    #[tokio::test]
    async fn empty_request_does_nothing() {
        let (gateway, _source, bulk) = setup(SyncMode::Polling, &[sample(5.0, 1)]).await;
        assert_eq!(bulk.bulk_delete(&[]).await, BulkOutcome::default());
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }
}
