use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::{
    broadcast, BoxFuture, FeedEvent, FeedReceiver, FeedSender, RemoteGradeGateway, Role,
};
use crate::models::{
    slot_trimester, GradePatch, LocalVariantRecord, NewGrade, RecordKind, RecordVariant,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalDataset {
    #[serde(default)]
    notas: Vec<LocalVariantRecord>,
}

/// File-backed grade dataset kept in the portal's local record shape. Every
/// accepted write is persisted and echoed to feed subscribers.
pub struct LocalGradeStore {
    path: PathBuf,
    role: Role,
    records: Mutex<Vec<LocalVariantRecord>>,
    subscribers: Mutex<Vec<FeedSender>>,
}

impl LocalGradeStore {
    pub fn init(path: impl Into<PathBuf>, role: Role) -> Result<Self, GatewayError> {
        let path = path.into();
        let dataset = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<LocalDataset>(&raw)?
        } else {
            LocalDataset::default()
        };
        info!(path = %path.display(), count = dataset.notas.len(), "local grade store opened");
        Ok(Self {
            path,
            role,
            records: Mutex::new(dataset.notas),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Flushes the dataset and closes every open feed.
    pub fn teardown(&self) -> Result<(), GatewayError> {
        persist(&self.path, &self.records())?;
        self.subscribers().clear();
        info!(path = %self.path.display(), "local grade store closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> MutexGuard<'_, Vec<LocalVariantRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<FeedSender>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `change` on a copy of the dataset and keeps the copy only once it
    /// is on disk. `None` from `change` leaves everything untouched.
    fn commit<R>(
        &self,
        change: impl FnOnce(&mut Vec<LocalVariantRecord>) -> Option<R>,
    ) -> Result<Option<R>, GatewayError> {
        let mut records = self.records();
        let mut next = records.clone();
        let Some(outcome) = change(&mut next) else {
            return Ok(None);
        };
        persist(&self.path, &next)?;
        *records = next;
        Ok(Some(outcome))
    }

    fn publish(&self, event: FeedEvent) {
        broadcast(&mut self.subscribers(), event);
    }
}

fn persist(path: &Path, records: &[LocalVariantRecord]) -> Result<(), GatewayError> {
    let dataset = LocalDataset {
        notas: records.to_vec(),
    };
    let encoded = serde_json::to_string_pretty(&dataset)?;
    std::fs::write(path, encoded)?;
    Ok(())
}

fn apply_local_patch(record: &mut LocalVariantRecord, patch: &GradePatch) {
    if let Some(value) = patch.value {
        record.nota = value;
    }
    if let Some(trimester) = patch.trimester {
        record.bimestre = Some(trimester);
    }
    if let Some(comment) = &patch.comment {
        record.observacao = Some(comment.clone());
    }
    if let Some(kind) = patch.kind {
        record.tipo = Some(kind.as_str().to_string());
    }
    if let (Some(bimestre), Some(tipo)) = (record.bimestre, record.tipo.as_deref()) {
        if let Ok(kind) = RecordKind::parse(tipo) {
            record.bimestre = Some(slot_trimester(bimestre, kind));
        }
    }
}

impl RemoteGradeGateway for LocalGradeStore {
    fn list(&self) -> BoxFuture<'_, Result<Vec<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            Ok(self
                .records()
                .iter()
                .cloned()
                .map(RecordVariant::Local)
                .collect())
        })
    }

    fn create<'a>(
        &'a self,
        data: &'a NewGrade,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() || data.validate().is_err() {
                return Ok(None);
            }
            let record = LocalVariantRecord {
                id: Uuid::new_v4().to_string(),
                aluno_id: data.student_id.to_string(),
                disciplina_id: data.subject_id.to_string(),
                bimestre: Some(data.slot().trimester),
                nota: data.value,
                observacao: data.comment.clone(),
                tipo: Some(data.kind.as_str().to_string()),
                created_at: Some(Utc::now()),
            };
            self.commit(|records| {
                records.push(record.clone());
                Some(())
            })?;
            debug!(record_id = %record.id, "local grade created");
            let variant = RecordVariant::Local(record);
            self.publish(FeedEvent::Inserted(variant.clone()));
            Ok(Some(variant))
        })
    }

    fn update<'a>(
        &'a self,
        id: Uuid,
        patch: &'a GradePatch,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() || patch.validate().is_err() {
                return Ok(None);
            }
            let key = id.to_string();
            let updated = self.commit(|records| {
                let record = records.iter_mut().find(|record| record.id == key)?;
                apply_local_patch(record, patch);
                Some(record.clone())
            })?;
            let Some(updated) = updated else {
                return Ok(None);
            };
            let variant = RecordVariant::Local(updated);
            self.publish(FeedEvent::Updated(variant.clone()));
            Ok(Some(variant))
        })
    }

    fn delete(&self, id: Uuid) -> BoxFuture<'_, Result<bool, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() {
                return Ok(false);
            }
            let key = id.to_string();
            let removed = self
                .commit(|records| {
                    let before = records.len();
                    records.retain(|record| record.id != key);
                    (records.len() != before).then_some(())
                })?
                .is_some();
            if removed {
                self.publish(FeedEvent::Deleted(id));
            }
            Ok(removed)
        })
    }

    fn supports_feed(&self) -> bool {
        true
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<FeedReceiver, GatewayError>> {
        Box::pin(async move {
            let (sender, receiver) = mpsc::unbounded_channel();
            self.subscribers().push(sender);
            Ok(receiver)
        })
    }
}
