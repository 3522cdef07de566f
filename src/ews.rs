use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::PiiCipher;
use crate::db;
use crate::models::{
    ActorSummary, AssignmentRollup, Course, CourseSummary, EwsResult, PredictionWebhook,
    RiskStatus, StudentActivity,
};
use crate::parse;
use crate::prediction;
use crate::stats;

/// Students are surfaced when their z-score falls below this line. This filter
/// is deliberately independent of the percent-based status label.
const WARNING_Z: f64 = -1.0;

/// Status comes from the raw predicted percent, not the z-score.
fn classify_status(predicted_percent: f64) -> RiskStatus {
    if predicted_percent <= 69.0 {
        RiskStatus::Danger
    } else if predicted_percent <= 79.0 {
        RiskStatus::Warning
    } else {
        RiskStatus::Success
    }
}

/// Rebuilds every course and actor summary, then fires a best-effort
/// prediction refresh per course. A failed course is logged and skipped;
/// sibling courses are unaffected.
pub async fn update_ews_data(pool: &PgPool, config: &Config) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    info!(count = courses.len(), "updating early warning summaries");

    for course in &courses {
        if let Err(err) = build_course_summary(pool, course).await {
            warn!(course_id = %course.course_id, error = %err, "course summary build failed");
        }
        if let Err(err) = build_actor_summaries(pool, course).await {
            warn!(course_id = %course.course_id, error = %err, "actor summary build failed");
        }
    }

    for course in &courses {
        prediction::spawn_refresh(config, course.course_id.clone());
    }
    Ok(())
}

fn percent_seen_by_student(activity: &[StudentActivity]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for row in activity {
        let entry = counts.entry(row.student_id_enc.clone()).or_insert((0, 0));
        entry.0 += row.seen.len();
        entry.1 += row.seen.len() + row.unseen.len();
    }
    counts
        .into_iter()
        .map(|(student, (seen, total))| {
            let percent = if total == 0 {
                0.0
            } else {
                seen as f64 / total as f64 * 100.0
            };
            (student, percent)
        })
        .collect()
}

/// The student's valid percents summed over the course's full assignment
/// count: assignments never attempted weigh the average down as zeros.
fn actor_course_percent(valid_percents: &[f64], total_assignments: usize) -> f64 {
    if total_assignments == 0 {
        return 0.0;
    }
    valid_percents.iter().sum::<f64>() / total_assignments as f64
}

async fn build_course_summary(pool: &PgPool, course: &Course) -> Result<()> {
    let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;
    let score_sets = db::fetch_assignment_score_sets_for_course(pool, &course.course_id).await?;
    let time_on_task = db::fetch_time_on_task_for_course(pool, &course.course_id).await?;
    let review_totals = db::fetch_review_time_totals_for_course(pool, &course.course_id).await?;
    let interaction_days = db::fetch_interaction_days_for_course(pool, &course.course_id).await?;
    let activity = db::fetch_student_activity_for_course(pool, &course.course_id).await?;
    let student_counts = db::count_score_records_by_assignment(pool, &course.course_id).await?;

    let avg_score_by_assignment: HashMap<&str, f64> = score_sets
        .iter()
        .filter_map(|set| {
            stats::mean(&set.scores).map(|avg| (set.assignment_id.as_str(), avg))
        })
        .collect();

    let mut task_seconds_by_assignment: HashMap<&str, i64> = HashMap::new();
    for row in &time_on_task {
        *task_seconds_by_assignment
            .entry(row.assignment_id.as_str())
            .or_insert(0) += row.total_seconds;
    }

    let mut review_minutes_by_assignment: HashMap<&str, f64> = HashMap::new();
    let mut review_students_by_assignment: HashMap<&str, std::collections::HashSet<&str>> =
        HashMap::new();
    for row in &review_totals {
        *review_minutes_by_assignment
            .entry(row.assignment_id.as_str())
            .or_insert(0.0) += row.total_minutes;
        review_students_by_assignment
            .entry(row.assignment_id.as_str())
            .or_default()
            .insert(row.student_id_enc.as_str());
    }

    // Rollups start zeroed; each average fills in independently of the others.
    let rollups: Vec<AssignmentRollup> = assignments
        .iter()
        .map(|assignment| {
            let id = assignment.assignment_id.as_str();
            let students_with_scores = student_counts.get(id).copied().unwrap_or(0).max(0);
            let avg_time_on_task_minutes = if students_with_scores > 0 {
                task_seconds_by_assignment.get(id).copied().unwrap_or(0) as f64
                    / students_with_scores as f64
                    / 60.0
            } else {
                0.0
            };
            let review_students = review_students_by_assignment
                .get(id)
                .map(|s| s.len())
                .unwrap_or(0);
            let avg_time_in_review_minutes = if review_students > 0 {
                review_minutes_by_assignment.get(id).copied().unwrap_or(0.0)
                    / review_students as f64
            } else {
                0.0
            };

            AssignmentRollup {
                assignment_id: assignment.assignment_id.clone(),
                name: assignment.name.clone(),
                avg_unweighted_score: avg_score_by_assignment.get(id).copied().unwrap_or(0.0),
                avg_time_on_task_minutes,
                avg_time_in_review_minutes,
            }
        })
        .collect();

    let valid_assignment_avgs: Vec<f64> = avg_score_by_assignment.values().copied().collect();
    let avg_course_percent = stats::mean(&valid_assignment_avgs).unwrap_or(0.0);

    let day_values: Vec<f64> = interaction_days.iter().map(|d| d.days as f64).collect();
    let avg_interaction_days = stats::mean(&day_values).unwrap_or(0.0);

    let seen_values: Vec<f64> = percent_seen_by_student(&activity).into_values().collect();
    let avg_percent_seen = stats::mean(&seen_values).unwrap_or(0.0);

    // A zero average keeps the initialized status; nothing promotes a course
    // to success/warning/danger yet.
    // TODO: add a promotion rule once course-level thresholds are defined.
    let status = RiskStatus::InsufficientData;

    db::upsert_course_summary(
        pool,
        &CourseSummary {
            course_id: course.course_id.clone(),
            assignments: rollups,
            avg_course_percent,
            avg_interaction_days,
            avg_percent_seen,
            status,
            last_updated: Utc::now(),
        },
    )
    .await
}

async fn build_actor_summaries(pool: &PgPool, course: &Course) -> Result<()> {
    let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;
    let records = db::fetch_assignment_scores_for_course(pool, &course.course_id).await?;
    let activity = db::fetch_student_activity_for_course(pool, &course.course_id).await?;
    let interaction_days = db::fetch_interaction_days_for_course(pool, &course.course_id).await?;
    let review_totals = db::fetch_review_time_totals_for_course(pool, &course.course_id).await?;
    let enrollments = db::fetch_enrollments_for_course(pool, &course.course_id).await?;

    let seen_by_student = percent_seen_by_student(&activity);
    let days_by_student: HashMap<&str, i32> = interaction_days
        .iter()
        .map(|d| (d.student_id_enc.as_str(), d.days))
        .collect();

    let mut records_by_key: HashMap<(&str, &str), &crate::models::AssignmentScoreRecord> =
        HashMap::new();
    for record in &records {
        records_by_key.insert(
            (record.student_id_enc.as_str(), record.assignment_id.as_str()),
            record,
        );
    }

    let mut review_by_key: HashMap<(&str, &str), f64> = HashMap::new();
    for row in &review_totals {
        *review_by_key
            .entry((row.student_id_enc.as_str(), row.assignment_id.as_str()))
            .or_insert(0.0) += row.total_minutes;
    }

    for enrollment in &enrollments {
        let student = enrollment.student_id_enc.as_str();

        let valid_percents: Vec<f64> = assignments
            .iter()
            .filter_map(|a| records_by_key.get(&(student, a.assignment_id.as_str())))
            .filter_map(|r| parse::parse_percent(&r.percent_correct))
            .collect();
        let course_percent = actor_course_percent(&valid_percents, assignments.len());

        let rollups: Vec<AssignmentRollup> = assignments
            .iter()
            .map(|assignment| {
                let record = records_by_key.get(&(student, assignment.assignment_id.as_str()));
                let score = record
                    .and_then(|r| parse::parse_percent(&r.percent_correct))
                    .unwrap_or(0.0);
                let task_seconds: u32 = record
                    .map(|r| {
                        r.questions
                            .iter()
                            .filter_map(|q| parse::clock_to_seconds(&q.time_on_task))
                            .sum()
                    })
                    .unwrap_or(0);
                AssignmentRollup {
                    assignment_id: assignment.assignment_id.clone(),
                    name: assignment.name.clone(),
                    avg_unweighted_score: score,
                    avg_time_on_task_minutes: task_seconds as f64 / 60.0,
                    avg_time_in_review_minutes: review_by_key
                        .get(&(student, assignment.assignment_id.as_str()))
                        .copied()
                        .unwrap_or(0.0),
                }
            })
            .collect();

        db::upsert_actor_summary(
            pool,
            &ActorSummary {
                course_id: course.course_id.clone(),
                actor_id_enc: enrollment.student_id_enc.clone(),
                assignments: rollups,
                percent_seen: seen_by_student.get(student).copied().unwrap_or(0.0),
                interaction_days: days_by_student.get(student).copied().unwrap_or(0),
                course_percent,
                latest_predicted_percent: None,
                last_updated: Utc::now(),
            },
        )
        .await?;
    }
    Ok(())
}

struct RiskRow {
    actor_id: String,
    estimated_final: f64,
    z_score: f64,
    status: RiskStatus,
}

/// Distribution stats plus the at-risk subset. The z filter decides who is
/// returned; the percent thresholds decide what their label says.
fn at_risk_rows(predicted: &[(String, f64)]) -> (Vec<RiskRow>, f64, f64) {
    let values: Vec<f64> = predicted.iter().map(|(_, p)| *p).collect();
    let (Some(avg), Some(std_dev)) = (stats::mean(&values), stats::std_dev_population(&values))
    else {
        return (Vec::new(), 0.0, 0.0);
    };

    let mut rows: Vec<RiskRow> = predicted
        .iter()
        .filter_map(|(actor_id, percent)| {
            let z = stats::z_score(*percent, avg, std_dev)?;
            if z >= WARNING_Z {
                return None;
            }
            Some(RiskRow {
                actor_id: actor_id.clone(),
                estimated_final: *percent,
                z_score: z,
                status: classify_status(*percent),
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        a.z_score
            .partial_cmp(&b.z_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    (rows, avg, std_dev)
}

/// At-risk students for one course, most at-risk first. In privacy mode the
/// name stays encrypted; student ids are opaque either way.
pub async fn get_ews_results(
    pool: &PgPool,
    cipher: &PiiCipher,
    course_id: &str,
    privacy_mode: bool,
) -> Result<Vec<EwsResult>> {
    let predicted = db::fetch_predicted_actors(pool, course_id).await?;
    let (rows, course_avg, course_std_dev) = at_risk_rows(&predicted);

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        let name = match db::fetch_email_by_student(pool, course_id, &row.actor_id).await? {
            Some(email_enc) if !privacy_mode => cipher.decrypt(&email_enc).unwrap_or(email_enc),
            Some(email_enc) => email_enc,
            None => row.actor_id.clone(),
        };

        results.push(EwsResult {
            student_id: row.actor_id,
            name,
            estimated_final: row.estimated_final,
            course_avg_diff: row.estimated_final - course_avg,
            z_score: row.z_score,
            status: row.status,
            course_avg,
            course_std_dev,
        });
    }
    Ok(results)
}

/// Applies a prediction webhook payload. Not an upsert: actors whose summary
/// rows do not exist yet are skipped, because the summary build is the step
/// that creates them.
pub async fn update_ews_predictions(
    pool: &PgPool,
    course_id: &str,
    predictions: &HashMap<String, f64>,
) -> Result<usize> {
    let mut applied = 0usize;
    for (actor_id, percent) in predictions {
        if db::set_actor_prediction(pool, course_id, actor_id, *percent).await? {
            applied += 1;
        } else {
            debug!(actor_id = %actor_id, "no actor summary for prediction; skipped");
        }
    }
    info!(
        course_id = %course_id,
        applied,
        received = predictions.len(),
        "prediction update complete"
    );
    Ok(applied)
}

pub async fn ingest_prediction_webhook(pool: &PgPool, payload: &PredictionWebhook) -> Result<usize> {
    if payload.state != "success" {
        warn!(
            course_id = %payload.course_id,
            state = %payload.state,
            "prediction host reported a failed refresh"
        );
        return Ok(0);
    }
    update_ews_predictions(pool, &payload.course_id, &payload.predictions).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_thresholds_use_raw_percent() {
        assert_eq!(classify_status(40.0), RiskStatus::Danger);
        assert_eq!(classify_status(69.0), RiskStatus::Danger);
        assert_eq!(classify_status(69.1), RiskStatus::Warning);
        assert_eq!(classify_status(79.0), RiskStatus::Warning);
        assert_eq!(classify_status(79.1), RiskStatus::Success);
        assert_eq!(classify_status(90.0), RiskStatus::Success);
    }

    #[test]
    fn z_filter_and_status_stay_independent() {
        let predicted = vec![
            ("s-high".to_string(), 90.0),
            ("s-mid".to_string(), 80.0),
            ("s-low".to_string(), 40.0),
        ];

        let (rows, avg, std_dev) = at_risk_rows(&predicted);
        assert!((avg - 70.0).abs() < 1e-9);
        assert!((std_dev - 21.602).abs() < 1e-3);

        // only the student at 40 crosses the z line
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actor_id, "s-low");
        assert!((rows[0].z_score - (-1.3887)).abs() < 1e-3);
        assert_eq!(rows[0].status, RiskStatus::Danger);
    }

    #[test]
    fn identical_predictions_surface_nobody() {
        let predicted = vec![
            ("s1".to_string(), 75.0),
            ("s2".to_string(), 75.0),
            ("s3".to_string(), 75.0),
        ];
        let (rows, _, std_dev) = at_risk_rows(&predicted);
        assert_eq!(std_dev, 0.0);
        assert!(rows.is_empty());
    }

    #[test]
    fn empty_predictions_are_an_empty_result() {
        let (rows, avg, std_dev) = at_risk_rows(&[]);
        assert!(rows.is_empty());
        assert_eq!(avg, 0.0);
        assert_eq!(std_dev, 0.0);
    }

    #[test]
    fn missing_assignments_count_as_zero_in_course_percent() {
        // two attempted of four assignments
        assert!((actor_course_percent(&[80.0, 90.0], 4) - 42.5).abs() < 1e-9);
        assert_eq!(actor_course_percent(&[], 4), 0.0);
        assert_eq!(actor_course_percent(&[80.0], 0), 0.0);
    }

    #[test]
    fn percent_seen_spans_assignments() {
        let activity = vec![
            StudentActivity {
                course_id: "c1".to_string(),
                assignment_id: "a1".to_string(),
                student_id_enc: "s1".to_string(),
                seen: vec!["101".to_string(), "102".to_string()],
                unseen: vec!["103".to_string()],
            },
            StudentActivity {
                course_id: "c1".to_string(),
                assignment_id: "a2".to_string(),
                student_id_enc: "s1".to_string(),
                seen: vec!["201".to_string()],
                unseen: vec!["202".to_string()],
            },
        ];

        let seen = percent_seen_by_student(&activity);
        assert!((seen["s1"] - 60.0).abs() < 1e-9);
    }
}
