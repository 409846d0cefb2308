use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{GradePatch, NewGrade, RecordVariant};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Push feed handed out by [`RemoteGradeGateway::subscribe`]. An `Err` item or
/// a closed channel means the feed is gone; dropping the receiver unsubscribes.
pub type FeedReceiver = mpsc::UnboundedReceiver<Result<FeedEvent, GatewayError>>;
pub type FeedSender = mpsc::UnboundedSender<Result<FeedEvent, GatewayError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Inserted(RecordVariant),
    Updated(RecordVariant),
    Deleted(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Teacher)
    }
}

/// Authoritative grade store. `create` and `update` answer `None` when the
/// store denied or rejected the write; that is never "no change".
pub trait RemoteGradeGateway: Send + Sync {
    fn list(&self) -> BoxFuture<'_, Result<Vec<RecordVariant>, GatewayError>>;

    fn create<'a>(
        &'a self,
        data: &'a NewGrade,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>>;

    fn update<'a>(
        &'a self,
        id: Uuid,
        patch: &'a GradePatch,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>>;

    fn delete(&self, id: Uuid) -> BoxFuture<'_, Result<bool, GatewayError>>;

    fn supports_feed(&self) -> bool {
        false
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<FeedReceiver, GatewayError>> {
        Box::pin(async { Err(GatewayError::Unsupported("push feed".to_string())) })
    }
}

/// Sends `event` to every live subscriber and forgets the closed ones.
pub(crate) fn broadcast(subscribers: &mut Vec<FeedSender>, event: FeedEvent) {
    subscribers.retain(|sender| sender.send(Ok(event.clone())).is_ok());
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{GradeRecord, RecordKind, RemoteVariantRecord};

    type Hold = Mutex<Option<(Arc<Notify>, Arc<Notify>)>>;

    /// In-memory gateway with knobs for rejecting, hanging and pausing calls.
    #[derive(Default)]
    pub(crate) struct ScriptedGateway {
        records: Mutex<HashMap<Uuid, GradeRecord>>,
        rejected: Mutex<HashSet<Uuid>>,
        hung: Mutex<HashSet<Uuid>>,
        subscribers: Mutex<Vec<FeedSender>>,
        hold: Hold,
        reply_hold: Hold,
        list_hold: Hold,
        pub calls: AtomicUsize,
        pub list_calls: AtomicUsize,
        pub fail_list: AtomicBool,
        pub hang: AtomicBool,
        pub streaming: bool,
    }

    impl ScriptedGateway {
        pub fn polling() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn streaming() -> Arc<Self> {
            Arc::new(Self {
                streaming: true,
                ..Self::default()
            })
        }

        pub fn seed(&self, records: &[GradeRecord]) {
            let mut stored = self.records.lock().unwrap();
            for record in records {
                stored.insert(record.id, record.clone());
            }
        }

        pub fn stored(&self, id: Uuid) -> Option<GradeRecord> {
            self.records.lock().unwrap().get(&id).cloned()
        }

        pub fn stored_ids(&self) -> Vec<Uuid> {
            self.records.lock().unwrap().keys().copied().collect()
        }

        /// Drops `id` from the store without telling any subscriber.
        pub fn forget(&self, id: Uuid) {
            self.records.lock().unwrap().remove(&id);
        }

        pub fn reject(&self, id: Uuid) {
            self.rejected.lock().unwrap().insert(id);
        }

        /// Makes every mutating call on `id` wait forever.
        pub fn hang_on(&self, id: Uuid) {
            self.hung.lock().unwrap().insert(id);
        }

        /// Pauses the next mutating call before it touches the store, until
        /// the returned `release` is notified; `entered` fires once the call
        /// is waiting.
        pub fn hold_next(&self) -> (Arc<Notify>, Arc<Notify>) {
            arm(&self.hold)
        }

        /// Like `hold_next`, but the pause comes after the write and its feed
        /// event, just before the reply.
        pub fn hold_next_reply(&self) -> (Arc<Notify>, Arc<Notify>) {
            arm(&self.reply_hold)
        }

        /// Pauses the next `list` after it has read the store.
        pub fn hold_next_list(&self) -> (Arc<Notify>, Arc<Notify>) {
            arm(&self.list_hold)
        }

        pub fn push(&self, event: FeedEvent) {
            broadcast(&mut self.subscribers.lock().unwrap(), event);
        }

        pub fn push_error(&self, message: &str) {
            for sender in self.subscribers.lock().unwrap().iter() {
                let _ = sender.send(Err(GatewayError::Backend(message.to_string())));
            }
        }

        pub fn disconnect(&self) {
            self.subscribers.lock().unwrap().clear();
        }

        async fn gate(&self, id: Option<Uuid>) {
            wait_on(&self.hold).await;
            let hung = id.is_some_and(|id| self.hung.lock().unwrap().contains(&id));
            if hung || self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }

        fn is_rejected(&self, id: &Uuid) -> bool {
            self.rejected.lock().unwrap().contains(id)
        }
    }

    fn arm(slot: &Hold) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *slot.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    async fn wait_on(slot: &Hold) {
        let hold = slot.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.notify_one();
            release.notified().await;
        }
    }

    pub(crate) fn remote(record: &GradeRecord) -> RecordVariant {
        RecordVariant::Remote(RemoteVariantRecord::from(record))
    }

    pub(crate) fn sample(value: f64, trimester: i32) -> GradeRecord {
        GradeRecord {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            trimester,
            value,
            comment: None,
            kind: RecordKind::Regular,
            created_at: Utc::now(),
        }
    }

    impl RemoteGradeGateway for ScriptedGateway {
        fn list(&self) -> BoxFuture<'_, Result<Vec<RecordVariant>, GatewayError>> {
            Box::pin(async move {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_list.load(Ordering::SeqCst) {
                    return Err(GatewayError::Backend("list unavailable".to_string()));
                }
                let listed: Vec<RecordVariant> =
                    self.records.lock().unwrap().values().map(remote).collect();
                wait_on(&self.list_hold).await;
                Ok(listed)
            })
        }

        fn create<'a>(
            &'a self,
            data: &'a NewGrade,
        ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate(None).await;
                let record = GradeRecord {
                    id: Uuid::new_v4(),
                    student_id: data.student_id,
                    subject_id: data.subject_id,
                    trimester: data.slot().trimester,
                    value: data.value,
                    comment: data.comment.clone(),
                    kind: data.kind,
                    created_at: Utc::now(),
                };
                self.records.lock().unwrap().insert(record.id, record.clone());
                self.push(FeedEvent::Inserted(remote(&record)));
                wait_on(&self.reply_hold).await;
                Ok(Some(remote(&record)))
            })
        }

        fn update<'a>(
            &'a self,
            id: Uuid,
            patch: &'a GradePatch,
        ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate(Some(id)).await;
                if self.is_rejected(&id) {
                    return Ok(None);
                }
                let updated = {
                    let mut stored = self.records.lock().unwrap();
                    let Some(current) = stored.get(&id).cloned() else {
                        return Ok(None);
                    };
                    let next = current.apply_patch(patch);
                    stored.insert(id, next.clone());
                    next
                };
                self.push(FeedEvent::Updated(remote(&updated)));
                Ok(Some(remote(&updated)))
            })
        }

        fn delete(&self, id: Uuid) -> BoxFuture<'_, Result<bool, GatewayError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate(Some(id)).await;
                if self.is_rejected(&id) {
                    return Err(GatewayError::Backend(format!("permission denied for {id}")));
                }
                let removed = self.records.lock().unwrap().remove(&id).is_some();
                if removed {
                    self.push(FeedEvent::Deleted(id));
                }
                Ok(removed)
            })
        }

        fn supports_feed(&self) -> bool {
            self.streaming
        }

        fn subscribe(&self) -> BoxFuture<'_, Result<FeedReceiver, GatewayError>> {
            Box::pin(async move {
                if !self.streaming {
                    return Err(GatewayError::Unsupported("push feed".to_string()));
                }
                let (sender, receiver) = mpsc::unbounded_channel();
                self.subscribers.lock().unwrap().push(sender);
                Ok(receiver)
            })
        }
    }
}
