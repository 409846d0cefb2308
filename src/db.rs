use anyhow::Context;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::{BoxFuture, FeedEvent, FeedReceiver, RemoteGradeGateway, Role};
use crate::models::{
    validate_trimester, validate_value, Directory, GradePatch, NewGrade, RecordKind,
    RecordVariant, RemoteVariantRecord, RECOVERY_TRIMESTER,
};

pub const GRADE_CHANNEL: &str = "grade_events";

const RECORD_COLUMNS: &str =
    "id, student_id, subject_id, trimester, value, comment, kind, created_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let students = vec![
        ("Avery Lee", "avery.lee@escola.example"),
        ("Jules Moreno", "jules.moreno@escola.example"),
        ("Kiara Patel", "kiara.patel@escola.example"),
    ];
    let mut student_ids = Vec::new();
    for (name, email) in students {
        student_ids.push(upsert_student(pool, name, email).await?);
    }

    let math = upsert_subject(pool, "Matemática").await?;
    let portuguese = upsert_subject(pool, "Português").await?;

    let grades = vec![
        ("seed-001", student_ids[0], math, 1, 8.0, RecordKind::Regular, None),
        ("seed-002", student_ids[0], math, 2, 7.5, RecordKind::Regular, None),
        ("seed-003", student_ids[0], math, 3, 9.0, RecordKind::Regular, None),
        ("seed-004", student_ids[1], math, 1, 5.0, RecordKind::Regular, None),
        ("seed-005", student_ids[1], math, 2, 6.0, RecordKind::Regular, None),
        (
            "seed-006",
            student_ids[1],
            math,
            RECOVERY_TRIMESTER,
            7.2,
            RecordKind::Recovery,
            Some("Recovery exam"),
        ),
        ("seed-007", student_ids[2], portuguese, 1, 4.5, RecordKind::Regular, None),
        ("seed-008", student_ids[2], portuguese, 2, 6.0, RecordKind::Regular, None),
        (
            "seed-009",
            student_ids[2],
            portuguese,
            RECOVERY_TRIMESTER,
            6.0,
            RecordKind::Recovery,
            Some("Recovery exam"),
        ),
        ("seed-010", student_ids[2], math, 1, 6.0, RecordKind::Regular, None),
        ("seed-011", student_ids[2], math, 2, 6.5, RecordKind::Regular, Some("Missed homework")),
    ];

    let mut inserted = 0usize;
    for (source_key, student_id, subject_id, trimester, value, kind, comment) in grades {
        let grade = NewGrade {
            student_id,
            subject_id,
            trimester,
            value,
            comment: comment.map(str::to_string),
            kind,
        };
        if insert_grade(pool, &grade, source_key).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_name: String,
        student_email: String,
        subject: String,
        trimester: Option<i32>,
        value: f64,
        kind: Option<String>,
        comment: Option<String>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("unreadable csv row at line {line}"))?;
        let kind = match row.kind.as_deref() {
            Some(kind) if !kind.trim().is_empty() => RecordKind::parse(kind)?,
            _ => RecordKind::Regular,
        };
        let trimester = match (row.trimester, kind) {
            (Some(trimester), _) => trimester,
            (None, RecordKind::Recovery) => RECOVERY_TRIMESTER,
            (None, RecordKind::Regular) => {
                anyhow::bail!("line {line}: regular grades need a trimester")
            }
        };
        validate_value(row.value).with_context(|| format!("line {line}"))?;
        validate_trimester(trimester).with_context(|| format!("line {line}"))?;

        let student_id = upsert_student(pool, &row.student_name, &row.student_email).await?;
        let subject_id = upsert_subject(pool, &row.subject).await?;
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        let grade = NewGrade {
            student_id,
            subject_id,
            trimester,
            value: row.value,
            comment: row.comment.filter(|text| !text.trim().is_empty()),
            kind,
        };

        if insert_grade(pool, &grade, &source_key).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn fetch_directory(pool: &PgPool) -> anyhow::Result<Directory> {
    let mut directory = Directory::default();

    for row in sqlx::query("SELECT id, full_name FROM grades.students")
        .fetch_all(pool)
        .await?
    {
        directory
            .students
            .insert(row.get("id"), row.get("full_name"));
    }

    for row in sqlx::query("SELECT id, name FROM grades.subjects")
        .fetch_all(pool)
        .await?
    {
        directory.subjects.insert(row.get("id"), row.get("name"));
    }

    Ok(directory)
}

async fn upsert_student(pool: &PgPool, name: &str, email: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO grades.students (id, full_name, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(email)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_subject(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO grades.subjects (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE
        SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn insert_grade(pool: &PgPool, grade: &NewGrade, source_key: &str) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO grades.grade_records
        (id, student_id, subject_id, trimester, value, comment, kind, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(grade.student_id)
    .bind(grade.subject_id)
    .bind(grade.slot().trimester)
    .bind(grade.value)
    .bind(&grade.comment)
    .bind(grade.kind.as_str())
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn row_to_remote(row: &PgRow) -> RemoteVariantRecord {
    RemoteVariantRecord {
        id: row.get("id"),
        student_id: row.get("student_id"),
        subject_id: row.get("subject_id"),
        trimester: row.get("trimester"),
        value: row.get("value"),
        comment: row.get("comment"),
        kind: row.get("kind"),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One `grade_events` payload as written by `grades.notify_grade_change`.
/// Only the id travels; the row is read back by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GradeChange {
    pub op: ChangeOp,
    pub id: Uuid,
}

pub fn parse_notification(payload: &str) -> Result<GradeChange, GatewayError> {
    Ok(serde_json::from_str(payload)?)
}

async fn fetch_record(pool: &PgPool, id: Uuid) -> Result<Option<RecordVariant>, GatewayError> {
    let query = format!("SELECT {RECORD_COLUMNS} FROM grades.grade_records WHERE id = $1");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    Ok(row.map(|row| RecordVariant::Remote(row_to_remote(&row))))
}

/// Turns a change notice into a feed event. `None` means the row is already
/// gone; its DELETE notice follows on the same channel.
async fn resolve_change(
    pool: &PgPool,
    change: GradeChange,
) -> Result<Option<FeedEvent>, GatewayError> {
    let event = match change.op {
        ChangeOp::Delete => Some(FeedEvent::Deleted(change.id)),
        ChangeOp::Insert => fetch_record(pool, change.id).await?.map(FeedEvent::Inserted),
        ChangeOp::Update => fetch_record(pool, change.id).await?.map(FeedEvent::Updated),
    };
    Ok(event)
}

/// Postgres-backed gateway. Writes are refused up front for roles that may
/// not edit grades.
#[derive(Clone)]
pub struct PgGradeGateway {
    pool: PgPool,
    role: Role,
}

impl PgGradeGateway {
    pub fn new(pool: PgPool, role: Role) -> Self {
        Self { pool, role }
    }
}

impl RemoteGradeGateway for PgGradeGateway {
    fn list(&self) -> BoxFuture<'_, Result<Vec<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            let query = format!("SELECT {RECORD_COLUMNS} FROM grades.grade_records");
            let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
            Ok(rows
                .iter()
                .map(|row| RecordVariant::Remote(row_to_remote(row)))
                .collect())
        })
    }

    fn create<'a>(
        &'a self,
        data: &'a NewGrade,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() {
                debug!(role = ?self.role, "grade create refused");
                return Ok(None);
            }
            let query = format!(
                "INSERT INTO grades.grade_records \
                 (id, student_id, subject_id, trimester, value, comment, kind) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT DO NOTHING \
                 RETURNING {RECORD_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(Uuid::new_v4())
                .bind(data.student_id)
                .bind(data.subject_id)
                .bind(data.slot().trimester)
                .bind(data.value)
                .bind(&data.comment)
                .bind(data.kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|row| RecordVariant::Remote(row_to_remote(&row))))
        })
    }

    fn update<'a>(
        &'a self,
        id: Uuid,
        patch: &'a GradePatch,
    ) -> BoxFuture<'a, Result<Option<RecordVariant>, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() {
                debug!(role = ?self.role, record_id = %id, "grade update refused");
                return Ok(None);
            }
            let query = format!(
                "UPDATE grades.grade_records \
                 SET value = COALESCE($2, value), \
                     trimester = CASE WHEN COALESCE($5, kind) = 'recovery' THEN 0 \
                                      ELSE COALESCE($3, trimester) END, \
                     comment = COALESCE($4, comment), \
                     kind = COALESCE($5, kind) \
                 WHERE id = $1 \
                 RETURNING {RECORD_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(id)
                .bind(patch.value)
                .bind(patch.trimester)
                .bind(&patch.comment)
                .bind(patch.kind.map(|kind| kind.as_str()))
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|row| RecordVariant::Remote(row_to_remote(&row))))
        })
    }

    fn delete(&self, id: Uuid) -> BoxFuture<'_, Result<bool, GatewayError>> {
        Box::pin(async move {
            if !self.role.can_write() {
                debug!(role = ?self.role, record_id = %id, "grade delete refused");
                return Ok(false);
            }
            let result = sqlx::query("DELETE FROM grades.grade_records WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn supports_feed(&self) -> bool {
        true
    }

    /// Listens on `grade_events`. A lost listener connection, or a failed
    /// read of a changed row, ends the feed with an error instead of
    /// reconnecting, so consumers see the gap.
    fn subscribe(&self) -> BoxFuture<'_, Result<FeedReceiver, GatewayError>> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(GRADE_CHANNEL).await?;
            let (sender, receiver) = mpsc::unbounded_channel();
            let pool = self.pool.clone();
            info!(channel = GRADE_CHANNEL, "listening for grade changes");

            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        _ = sender.closed() => break,
                        received = listener.try_recv() => received,
                    };
                    match received {
                        Ok(Some(notification)) => {
                            let change = match parse_notification(notification.payload()) {
                                Ok(change) => change,
                                Err(error) => {
                                    warn!(error = %error, "ignoring malformed grade notification");
                                    continue;
                                }
                            };
                            match resolve_change(&pool, change).await {
                                Ok(Some(event)) => {
                                    if sender.send(Ok(event)).is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {
                                    debug!(record_id = %change.id, "changed grade already deleted");
                                }
                                Err(error) => {
                                    let _ = sender.send(Err(error));
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            let _ = sender.send(Err(GatewayError::Backend(
                                "grade listener connection lost".to_string(),
                            )));
                            break;
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error.into()));
                            break;
                        }
                    }
                }
                debug!("grade listener stopped");
            });

            Ok(receiver)
        })
    }
}
