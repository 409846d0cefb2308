use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub const MIN_GRADE: f64 = 0.0;
pub const MAX_GRADE: f64 = 10.0;
/// Trimester sentinel carried by recovery exams.
pub const RECOVERY_TRIMESTER: i32 = 0;
pub const MAX_TRIMESTER: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Regular,
    Recovery,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Regular => "regular",
            RecordKind::Recovery => "recovery",
        }
    }

    /// Accepts both the canonical names and the portal's local spellings.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "regular" | "normal" => Ok(RecordKind::Regular),
            "recovery" | "recuperacao" => Ok(RecordKind::Recovery),
            other => Err(ValidationError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub subject_id: Uuid,
    pub trimester: i32,
    pub value: f64,
    pub comment: Option<String>,
    pub kind: RecordKind,
    pub created_at: DateTime<Utc>,
}

impl GradeRecord {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_value(self.value)?;
        validate_trimester(self.trimester)
    }

    pub fn apply_patch(&self, patch: &GradePatch) -> GradeRecord {
        let mut next = self.clone();
        if let Some(value) = patch.value {
            next.value = value;
        }
        if let Some(trimester) = patch.trimester {
            next.trimester = trimester;
        }
        if let Some(comment) = &patch.comment {
            next.comment = Some(comment.clone());
        }
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        next.trimester = slot_trimester(next.trimester, next.kind);
        next
    }

    pub fn slot(&self) -> GradeSlot {
        GradeSlot::new(self.student_id, self.subject_id, self.trimester, self.kind)
    }
}

pub fn validate_value(value: f64) -> Result<(), ValidationError> {
    if (MIN_GRADE..=MAX_GRADE).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidGradeValue(value))
    }
}

/// Trimester a record of `kind` is stored under. Recovery exams always sit on
/// the sentinel, whatever trimester they were entered with.
pub fn slot_trimester(trimester: i32, kind: RecordKind) -> i32 {
    match kind {
        RecordKind::Recovery => RECOVERY_TRIMESTER,
        RecordKind::Regular => trimester,
    }
}

pub fn validate_trimester(trimester: i32) -> Result<(), ValidationError> {
    if (RECOVERY_TRIMESTER..=MAX_TRIMESTER).contains(&trimester) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTrimester(trimester))
    }
}

/// Natural key of a grade: one per trimester, at most one recovery record
/// per (student, subject).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GradeSlot {
    pub student_id: Uuid,
    pub subject_id: Uuid,
    pub trimester: i32,
    pub kind: RecordKind,
}

impl GradeSlot {
    pub fn new(student_id: Uuid, subject_id: Uuid, trimester: i32, kind: RecordKind) -> Self {
        Self {
            student_id,
            subject_id,
            trimester: slot_trimester(trimester, kind),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradePatch {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub trimester: Option<i32>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub kind: Option<RecordKind>,
}

impl GradePatch {
    pub fn value(value: f64) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(value) = self.value {
            validate_value(value)?;
        }
        if let Some(trimester) = self.trimester {
            validate_trimester(trimester)?;
        }
        Ok(())
    }
}

impl From<&NewGrade> for GradePatch {
    fn from(value: &NewGrade) -> Self {
        Self {
            value: Some(value.value),
            trimester: Some(value.trimester),
            comment: value.comment.clone(),
            kind: Some(value.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrade {
    pub student_id: Uuid,
    pub subject_id: Uuid,
    pub trimester: i32,
    pub value: f64,
    #[serde(default)]
    pub comment: Option<String>,
    pub kind: RecordKind,
}

impl NewGrade {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_value(self.value)?;
        validate_trimester(self.trimester)
    }

    pub fn slot(&self) -> GradeSlot {
        GradeSlot::new(self.student_id, self.subject_id, self.trimester, self.kind)
    }
}

/// Shape kept by the portal's local dataset: Portuguese field names, string
/// ids, trimester and kind frequently absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVariantRecord {
    pub id: String,
    pub aluno_id: String,
    pub disciplina_id: String,
    #[serde(default)]
    pub bimestre: Option<i32>,
    pub nota: f64,
    #[serde(default)]
    pub observacao: Option<String>,
    #[serde(default)]
    pub tipo: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Shape returned by the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVariantRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub subject_id: Uuid,
    #[serde(default)]
    pub trimester: Option<i32>,
    pub value: f64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordVariant {
    Local(LocalVariantRecord),
    Remote(RemoteVariantRecord),
}

impl TryFrom<RecordVariant> for GradeRecord {
    type Error = ValidationError;

    fn try_from(value: RecordVariant) -> Result<Self, Self::Error> {
        match value {
            RecordVariant::Local(local) => GradeRecord::try_from(local),
            RecordVariant::Remote(remote) => GradeRecord::try_from(remote),
        }
    }
}

impl TryFrom<LocalVariantRecord> for GradeRecord {
    type Error = ValidationError;

    fn try_from(value: LocalVariantRecord) -> Result<Self, Self::Error> {
        let kind = match value.tipo.as_deref() {
            Some(tipo) => RecordKind::parse(tipo)?,
            None => RecordKind::Regular,
        };
        let trimester = match (value.bimestre, kind) {
            (Some(bimestre), _) => slot_trimester(bimestre, kind),
            (None, RecordKind::Recovery) => RECOVERY_TRIMESTER,
            (None, RecordKind::Regular) => return Err(ValidationError::MissingField("bimestre")),
        };
        let record = GradeRecord {
            id: parse_id(&value.id)?,
            student_id: parse_id(&value.aluno_id)?,
            subject_id: parse_id(&value.disciplina_id)?,
            trimester,
            value: value.nota,
            comment: value.observacao.filter(|text| !text.trim().is_empty()),
            kind,
            created_at: value.created_at.unwrap_or_default(),
        };
        record.validate()?;
        Ok(record)
    }
}

impl TryFrom<RemoteVariantRecord> for GradeRecord {
    type Error = ValidationError;

    fn try_from(value: RemoteVariantRecord) -> Result<Self, Self::Error> {
        let kind = match value.kind.as_deref() {
            Some(kind) => RecordKind::parse(kind)?,
            None => RecordKind::Regular,
        };
        let trimester = match (value.trimester, kind) {
            (Some(trimester), _) => slot_trimester(trimester, kind),
            (None, RecordKind::Recovery) => RECOVERY_TRIMESTER,
            (None, RecordKind::Regular) => return Err(ValidationError::MissingField("trimester")),
        };
        let record = GradeRecord {
            id: value.id,
            student_id: value.student_id,
            subject_id: value.subject_id,
            trimester,
            value: value.value,
            comment: value.comment,
            kind,
            created_at: value.created_at,
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<&GradeRecord> for LocalVariantRecord {
    fn from(value: &GradeRecord) -> Self {
        Self {
            id: value.id.to_string(),
            aluno_id: value.student_id.to_string(),
            disciplina_id: value.subject_id.to_string(),
            bimestre: Some(value.trimester),
            nota: value.value,
            observacao: value.comment.clone(),
            tipo: Some(value.kind.as_str().to_string()),
            created_at: Some(value.created_at),
        }
    }
}

impl From<&GradeRecord> for RemoteVariantRecord {
    fn from(value: &GradeRecord) -> Self {
        Self {
            id: value.id,
            student_id: value.student_id,
            subject_id: value.subject_id,
            trimester: Some(value.trimester),
            value: value.value,
            comment: value.comment.clone(),
            kind: Some(value.kind.as_str().to_string()),
            created_at: value.created_at,
        }
    }
}

fn parse_id(value: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(value.trim()).map_err(|_| ValidationError::InvalidId(value.to_string()))
}

/// Display names for students and subjects, used by reports.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub students: HashMap<Uuid, String>,
    pub subjects: HashMap<Uuid, String>,
}

impl Directory {
    pub fn student_name(&self, id: &Uuid) -> String {
        self.students
            .get(id)
            .cloned()
            .unwrap_or_else(|| short_id(id))
    }

    pub fn subject_name(&self, id: &Uuid) -> String {
        self.subjects
            .get(id)
            .cloned()
            .unwrap_or_else(|| short_id(id))
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string().chars().take(8).collect()
}
