use std::fmt::Write;

use serde::Serialize;

use crate::models::Directory;
use crate::status::{AcademicSituation, Situation};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SituationSummary {
    pub situacao: Situation,
    pub count: usize,
    pub avg_effective: f64,
}

pub fn summarize_by_situation(overview: &[AcademicSituation]) -> Vec<SituationSummary> {
    let mut map: std::collections::HashMap<Situation, (usize, f64)> =
        std::collections::HashMap::new();

    for situation in overview {
        let entry = map.entry(situation.situacao).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += situation.effective_average;
    }

    let mut summaries: Vec<SituationSummary> = map
        .into_iter()
        .map(|(situacao, (count, total))| SituationSummary {
            situacao,
            count,
            avg_effective: if count == 0 {
                0.0
            } else {
                total / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.situacao.label().cmp(b.situacao.label()))
    });
    summaries
}

pub fn build_report(
    scope: Option<&str>,
    threshold: f64,
    overview: &[AcademicSituation],
    directory: &Directory,
) -> String {
    let summaries = summarize_by_situation(overview);

    let mut output = String::new();
    let scope_label = scope.unwrap_or("all classes");

    let _ = writeln!(output, "# Recovery Report");
    let _ = writeln!(
        output,
        "Generated for {} (approval threshold {:.1})",
        scope_label, threshold
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Situation Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No grades recorded yet.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} subjects (avg final {:.1})",
                summary.situacao.label(),
                summary.count,
                summary.avg_effective
            );
        }
    }

    let pending: Vec<&AcademicSituation> = overview
        .iter()
        .filter(|situation| situation.situacao == Situation::InRecovery)
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Awaiting Recovery");

    if pending.is_empty() {
        let _ = writeln!(output, "No student is waiting on a recovery exam.");
    } else {
        for situation in pending {
            let _ = writeln!(
                output,
                "- {} in {}: average {:.1} across {} grades",
                directory.student_name(&situation.student_id),
                directory.subject_name(&situation.subject_id),
                situation.media_final,
                situation.grade_count
            );
        }
    }

    let resolved: Vec<&AcademicSituation> = overview
        .iter()
        .filter(|situation| situation.nota_recuperacao.is_some())
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recovery Results");

    if resolved.is_empty() {
        let _ = writeln!(output, "No recovery exams graded yet.");
    } else {
        for situation in resolved {
            let _ = writeln!(
                output,
                "- {} in {}: average {:.1}, recovery {:.1}, final {:.1} ({})",
                directory.student_name(&situation.student_id),
                directory.subject_name(&situation.subject_id),
                situation.media_final,
                situation.nota_recuperacao.unwrap_or_default(),
                situation.effective_average,
                situation.situacao.label()
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn situation(
        situacao: Situation,
        media_final: f64,
        nota_recuperacao: Option<f64>,
    ) -> AcademicSituation {
        AcademicSituation {
            student_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            media_final,
            nota_recuperacao,
            effective_average: nota_recuperacao.map_or(media_final, |r| r.max(media_final)),
            situacao,
            grade_count: 3,
        }
    }

    #[test]
    fn summaries_count_each_situation() {
        let overview = vec![
            situation(Situation::InRecovery, 5.0, None),
            situation(Situation::InRecovery, 6.0, None),
            situation(Situation::Approved, 8.0, None),
        ];

        let summaries = summarize_by_situation(&overview);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].situacao, Situation::InRecovery);
        assert_eq!(summaries[0].count, 2);
        assert!((summaries[0].avg_effective - 5.5).abs() < 1e-9);
    }

    #[test]
    fn report_lists_pending_and_resolved_recoveries() {
        let pending = situation(Situation::InRecovery, 5.5, None);
        let resolved = situation(Situation::ApprovedAfterRecovery, 5.5, Some(7.2));
        let mut directory = Directory::default();
        directory
            .students
            .insert(pending.student_id, "Jules Moreno".to_string());
        directory
            .subjects
            .insert(resolved.subject_id, "Matemática".to_string());

        let report = build_report(Some("7A"), 7.0, &[pending, resolved], &directory);
        assert!(report.contains("Generated for 7A (approval threshold 7.0)"));
        assert!(report.contains("- Jules Moreno in "));
        assert!(report.contains(
            "in Matemática: average 5.5, recovery 7.2, final 7.2 (approved after recovery)"
        ));
    }

    #[test]
    fn empty_overview_still_renders_sections() {
        let report = build_report(None, 7.0, &[], &Directory::default());
        assert!(report.contains("all classes"));
        assert!(report.contains("No grades recorded yet."));
        assert!(report.contains("No recovery exams graded yet."));
    }
}
