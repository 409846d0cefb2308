//! Grade consistency and academic status engine for the school portal.
//!
//! [`GradeSyncSource`] keeps the local view of grade records in step with
//! the authoritative store, either by polling or by following its push feed.
//! The mutation and bulk coordinators write through it, optimistically when
//! streaming, and roll back whatever the store refuses. [`status`] derives
//! each student's situation in a subject from the raw records.

pub mod bulk;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod local_store;
pub mod models;
pub mod mutation;
pub mod portal;
pub mod report;
pub mod status;
pub mod sync;

pub use bulk::{BulkOperationCoordinator, BulkOutcome};
pub use config::EngineConfig;
pub use error::{GatewayError, GradeError, GradeResult, ValidationError};
pub use gateway::{FeedEvent, RemoteGradeGateway, Role};
pub use local_store::LocalGradeStore;
pub use models::{GradePatch, GradeRecord, NewGrade, RecordKind, RecordVariant};
pub use mutation::OptimisticMutationCoordinator;
pub use portal::GradeBoard;
pub use status::{AcademicSituation, AverageFallback, Situation};
pub use sync::{GradeSyncSource, SyncMode, SyncSnapshot, SyncView};
