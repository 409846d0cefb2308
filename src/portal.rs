use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::bulk::{BulkOperationCoordinator, BulkOutcome};
use crate::config::EngineConfig;
use crate::error::GradeResult;
use crate::gateway::RemoteGradeGateway;
use crate::models::{GradePatch, GradeRecord, NewGrade};
use crate::mutation::OptimisticMutationCoordinator;
use crate::status::{class_overview, subject_situation, AcademicSituation};
use crate::sync::{GradeSyncSource, SyncSnapshot, SyncView};

/// Handle the presentation layer holds: current records and flags, plus the
/// mutation entry points whose results drive success and failure banners.
#[derive(Clone)]
pub struct GradeBoard {
    source: GradeSyncSource,
    mutations: OptimisticMutationCoordinator,
    bulk: BulkOperationCoordinator,
    config: EngineConfig,
}

impl GradeBoard {
    pub fn new(gateway: Arc<dyn RemoteGradeGateway>, config: EngineConfig) -> Self {
        let source = GradeSyncSource::new(gateway, config.mode);
        Self {
            mutations: OptimisticMutationCoordinator::new(source.clone(), config.mutation_timeout),
            bulk: BulkOperationCoordinator::new(source.clone(), config.mutation_timeout),
            source,
            config,
        }
    }

    pub async fn start(&self) -> GradeResult<()> {
        self.source.start().await
    }

    pub async fn refresh(&self) -> GradeResult<usize> {
        self.source.fetch_all().await
    }

    pub fn shutdown(&self) {
        self.source.shutdown();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn records(&self) -> Vec<GradeRecord> {
        self.source.records()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.source.snapshot()
    }

    pub fn loading(&self) -> bool {
        self.source.loading()
    }

    pub fn is_streaming(&self) -> bool {
        self.source.is_streaming()
    }

    pub fn is_stale(&self) -> bool {
        self.source.is_stale()
    }

    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.source.watch()
    }

    pub async fn update(&self, record_id: Uuid, patch: GradePatch) -> GradeResult<GradeRecord> {
        self.mutations.apply_update(record_id, patch).await
    }

    pub async fn delete(&self, record_id: Uuid) -> GradeResult<bool> {
        self.mutations.apply_delete(record_id).await
    }

    pub async fn create(&self, data: NewGrade) -> GradeResult<GradeRecord> {
        self.mutations.apply_create(data).await
    }

    pub async fn record_grade(&self, data: NewGrade) -> GradeResult<GradeRecord> {
        self.mutations.record_grade(data).await
    }

    pub async fn bulk_delete(&self, ids: &[Uuid]) -> BulkOutcome {
        self.bulk.bulk_delete(ids).await
    }

    pub fn situation(&self, student_id: Uuid, subject_id: Uuid) -> Option<AcademicSituation> {
        let records = self.source.snapshot().for_pair(student_id, subject_id);
        subject_situation(
            &records,
            self.config.approval_threshold,
            self.config.average_fallback,
        )
    }

    pub fn class_overview(&self) -> Vec<AcademicSituation> {
        class_overview(
            &self.source.records(),
            self.config.approval_threshold,
            self.config.average_fallback,
        )
    }
}
