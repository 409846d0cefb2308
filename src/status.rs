use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GradeRecord, RecordKind};

pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Situation {
    #[serde(rename = "aprovado")]
    Approved,
    #[serde(rename = "em_recuperacao", alias = "recuperacao")]
    InRecovery,
    #[serde(rename = "aprovado_recuperacao")]
    ApprovedAfterRecovery,
    #[serde(rename = "reprovado_final")]
    FailedFinal,
}

impl Situation {
    pub fn label(&self) -> &'static str {
        match self {
            Situation::Approved => "approved",
            Situation::InRecovery => "in recovery",
            Situation::ApprovedAfterRecovery => "approved after recovery",
            Situation::FailedFinal => "failed (final)",
        }
    }

    pub fn is_passing(&self) -> bool {
        matches!(self, Situation::Approved | Situation::ApprovedAfterRecovery)
    }
}

/// What the subject average falls back to when a pair has no regular
/// records at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AverageFallback {
    /// Average every record present, recovery included.
    #[default]
    AllRecords,
    /// No regular grades means an average of 0.
    RegularOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecoveryResolution {
    pub effective_average: f64,
    pub situacao: Situation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcademicSituation {
    pub student_id: Uuid,
    pub subject_id: Uuid,
    pub media_final: f64,
    pub nota_recuperacao: Option<f64>,
    pub effective_average: f64,
    pub situacao: Situation,
    pub grade_count: usize,
}

impl AcademicSituation {
    /// Below the threshold with no recovery yet, or with an insufficient one.
    pub fn in_recovery(&self) -> bool {
        matches!(self.situacao, Situation::InRecovery | Situation::FailedFinal)
    }
}

pub fn compute_subject_average(records: &[GradeRecord]) -> f64 {
    compute_subject_average_with(records, AverageFallback::AllRecords)
}

pub fn compute_subject_average_with(records: &[GradeRecord], fallback: AverageFallback) -> f64 {
    let regular: Vec<f64> = records
        .iter()
        .filter(|record| record.kind == RecordKind::Regular)
        .map(|record| record.value)
        .collect();

    if !regular.is_empty() {
        return mean(&regular);
    }

    match fallback {
        AverageFallback::AllRecords => {
            let all: Vec<f64> = records.iter().map(|record| record.value).collect();
            mean(&all)
        }
        AverageFallback::RegularOnly => 0.0,
    }
}

pub fn classify(average: f64, threshold: f64) -> Situation {
    if average >= threshold {
        Situation::Approved
    } else {
        Situation::InRecovery
    }
}

pub fn resolve_with_recovery(
    average: f64,
    recovery: Option<f64>,
    threshold: f64,
) -> RecoveryResolution {
    match recovery {
        None => RecoveryResolution {
            effective_average: average,
            situacao: classify(average, threshold),
        },
        Some(recovery) => {
            let effective_average = average.max(recovery);
            let situacao = if effective_average >= threshold {
                Situation::ApprovedAfterRecovery
            } else {
                Situation::FailedFinal
            };
            RecoveryResolution {
                effective_average,
                situacao,
            }
        }
    }
}

/// Situation of one (student, subject) pair. `records` is expected to hold
/// only that pair's grades; the ids are taken from the first record.
pub fn subject_situation(
    records: &[GradeRecord],
    threshold: f64,
    fallback: AverageFallback,
) -> Option<AcademicSituation> {
    let first = records.first()?;
    let media_final = compute_subject_average_with(records, fallback);
    let nota_recuperacao = records
        .iter()
        .filter(|record| record.kind == RecordKind::Recovery)
        .max_by_key(|record| record.created_at)
        .map(|record| record.value);
    let resolution = resolve_with_recovery(media_final, nota_recuperacao, threshold);

    Some(AcademicSituation {
        student_id: first.student_id,
        subject_id: first.subject_id,
        media_final,
        nota_recuperacao,
        effective_average: resolution.effective_average,
        situacao: resolution.situacao,
        grade_count: records.len(),
    })
}

/// Every (student, subject) pair in `records`, failing pairs first, then by
/// ascending effective average.
pub fn class_overview(
    records: &[GradeRecord],
    threshold: f64,
    fallback: AverageFallback,
) -> Vec<AcademicSituation> {
    let mut groups: HashMap<(Uuid, Uuid), Vec<GradeRecord>> = HashMap::new();
    for record in records {
        groups
            .entry((record.student_id, record.subject_id))
            .or_default()
            .push(record.clone());
    }

    let mut values: Vec<AcademicSituation> = groups
        .into_values()
        .filter_map(|group| subject_situation(&group, threshold, fallback))
        .collect();
    values.sort_by(|a, b| {
        a.situacao
            .is_passing()
            .cmp(&b.situacao.is_passing())
            .then(
                a.effective_average
                    .partial_cmp(&b.effective_average)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.student_id.cmp(&b.student_id))
            .then(a.subject_id.cmp(&b.subject_id))
    });
    values
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
