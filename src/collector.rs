use std::collections::HashMap;

use anyhow::Result;
use futures::future::join_all;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::PiiCipher;
use crate::db;
use crate::models::{
    Assignment, AssignmentScoreRecord, Course, Enrollment, FrameworkQuestionAlignment,
    FrameworkRef, QuestionScore, ReviewInterval, ReviewTimeRecord,
};
use crate::parse;
use crate::source_api::{
    value_to_id, ApiFramework, ApiReviewEvent, ApiSubmissionWindow, ScoreTable, SourceClient,
};

/// Runs the collection stages in their load-bearing order: question-id
/// discovery precedes score collection, scores precede timestamp patching,
/// enrollments precede the review-history join. A stage-fatal error aborts the
/// stages after it; per-item failures never do.
pub async fn run_collectors(pool: &PgPool, config: &Config, cipher: &PiiCipher) -> Result<()> {
    update_course_data(pool, config).await?;
    collect_all_assignments(pool, config).await?;
    collect_enrollments(pool, config, cipher).await?;
    collect_assignment_scores(pool, config, cipher).await?;
    collect_submission_timestamps(pool, config, cipher).await?;
    collect_framework_data(pool, config).await?;
    collect_review_time_data(pool, config, cipher).await?;
    Ok(())
}

// ---- stage 1: course metadata ----

async fn update_course_data(pool: &PgPool, config: &Config) -> Result<()> {
    let mut courses = db::fetch_known_courses(pool).await?;
    if let Some(lock) = &config.dev_course_lock {
        courses.retain(|c| &c.course_id == lock);
    }
    info!(count = courses.len(), "refreshing course metadata");

    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = refresh_course(pool, config, course).await {
            warn!(course_id = %course.course_id, error = %err, "course metadata refresh failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn refresh_course(pool: &PgPool, config: &Config, course: &Course) -> Result<()> {
    let client = SourceClient::for_course(config, &course.course_id)?;
    let summary = client.get_course_mini_summary(&course.course_id).await?;

    let updated = Course {
        course_id: course.course_id.clone(),
        instructor_id: summary
            .user_id
            .as_ref()
            .map(value_to_id)
            .or_else(|| course.instructor_id.clone()),
        name: summary.name,
        start_date: summary
            .start_date
            .as_deref()
            .and_then(parse::parse_loose_date),
        end_date: summary
            .end_date
            .as_deref()
            .and_then(parse::parse_loose_date),
        textbook_url: summary.textbook_url.or_else(|| course.textbook_url.clone()),
        is_known: true,
    };
    db::update_course_metadata(pool, &updated).await
}

// ---- stage 2: assignments + question-id discovery ----

async fn collect_all_assignments(pool: &PgPool, config: &Config) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = collect_course_assignments(pool, config, course).await {
            warn!(course_id = %course.course_id, error = %err, "assignment collection failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_course_assignments(pool: &PgPool, config: &Config, course: &Course) -> Result<()> {
    let Some(instructor_id) = course.instructor_id.as_deref() else {
        debug!(course_id = %course.course_id, "skipping course with unknown instructor");
        return Ok(());
    };

    let client = SourceClient::for_instructor(config, instructor_id)?;
    let assignments = client.get_course_assignments(&course.course_id).await?;

    for api in assignments {
        let assignment_id = value_to_id(&api.id);
        // One score snapshot per assignment, solely to discover the question
        // set; the values are persisted by the scores stage.
        let question_ids = match client.get_assignment_scores(&assignment_id).await {
            Ok(table) => table
                .question_columns()
                .iter()
                .map(|c| c.key.clone())
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(assignment_id = %assignment_id, error = %err, "question discovery failed");
                continue;
            }
        };

        let window = api.primary_window();
        let assignment = Assignment {
            course_id: course.course_id.clone(),
            assignment_id: assignment_id.clone(),
            name: api.name.clone(),
            num_questions: if api.num_questions > 0 {
                api.num_questions as i32
            } else {
                question_ids.len() as i32
            },
            question_ids,
            due_date: window
                .and_then(|w| w.due.as_deref())
                .and_then(parse::parse_timestamp),
            final_submission_deadline: window
                .and_then(|w| w.final_submission_deadline.as_deref())
                .and_then(parse::parse_timestamp),
        };

        if let Err(err) = db::upsert_assignment(pool, &assignment).await {
            warn!(assignment_id = %assignment_id, error = %err, "assignment upsert failed");
        }
    }
    Ok(())
}

// ---- stage 3: enrollments ----

async fn collect_enrollments(pool: &PgPool, config: &Config, cipher: &PiiCipher) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = collect_course_enrollments(pool, config, cipher, course).await {
            warn!(course_id = %course.course_id, error = %err, "enrollment collection failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_course_enrollments(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
    course: &Course,
) -> Result<()> {
    let client = SourceClient::for_course(config, &course.course_id)?;
    let enrollments = client.get_course_enrollments(&course.course_id).await?;

    for api in enrollments {
        let enrollment = Enrollment {
            email_enc: cipher.encrypt(&api.email)?,
            course_id: course.course_id.clone(),
            student_id_enc: cipher.encrypt(&value_to_id(&api.id))?,
            created_at: api
                .enrollment_date
                .as_deref()
                .and_then(parse::parse_enrollment_date),
        };
        if let Err(err) = db::upsert_enrollment(pool, &enrollment).await {
            warn!(course_id = %course.course_id, error = %err, "enrollment upsert failed");
        }
    }
    Ok(())
}

// ---- stage 4: assignment scores ----

async fn collect_assignment_scores(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = collect_course_scores(pool, config, cipher, course).await {
            warn!(course_id = %course.course_id, error = %err, "score collection failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_course_scores(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
    course: &Course,
) -> Result<()> {
    let Some(instructor_id) = course.instructor_id.as_deref() else {
        return Ok(());
    };
    let client = SourceClient::for_instructor(config, instructor_id)?;
    let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;

    let client = &client;
    let tasks = assignments.iter().map(|assignment| async move {
        if let Err(err) = collect_one_assignment_scores(pool, client, cipher, assignment).await {
            warn!(
                assignment_id = %assignment.assignment_id,
                error = %err,
                "assignment score collection failed"
            );
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_one_assignment_scores(
    pool: &PgPool,
    client: &SourceClient,
    cipher: &PiiCipher,
    assignment: &Assignment,
) -> Result<()> {
    let table = client.get_assignment_scores(&assignment.assignment_id).await?;

    let max_scores: HashMap<String, String> = table
        .question_columns()
        .iter()
        .map(|c| (c.key.clone(), parse::max_score_from_label(&c.label)))
        .collect();

    // Per-question submission counts; a failed question leaves its counts at
    // zero rather than failing the assignment.
    let count_tasks = assignment.question_ids.iter().map(|question_id| async move {
        match client
            .get_auto_graded_submissions(&assignment.assignment_id, question_id)
            .await
        {
            Ok(counts) => Some((question_id.clone(), counts)),
            Err(err) => {
                warn!(
                    question_id = %question_id,
                    error = %err,
                    "auto-graded submission fetch failed"
                );
                None
            }
        }
    });

    let mut submission_counts: HashMap<(String, String), i64> = HashMap::new();
    for (question_id, counts) in join_all(count_tasks).await.into_iter().flatten() {
        for count in counts {
            submission_counts.insert(
                (question_id.clone(), value_to_id(&count.user_id)),
                count.submission_count,
            );
        }
    }

    let records = build_score_records(assignment, &table, &max_scores, &submission_counts, cipher)?;
    db::upsert_assignment_scores(pool, &records).await
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => parse::SENTINEL.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn build_score_records(
    assignment: &Assignment,
    table: &ScoreTable,
    max_scores: &HashMap<String, String>,
    submission_counts: &HashMap<(String, String), i64>,
    cipher: &PiiCipher,
) -> Result<Vec<AssignmentScoreRecord>> {
    let mut records = Vec::new();

    for row in &table.rows {
        let Some(user_id) = row.get("userId") else {
            continue;
        };
        let user_id = value_to_id(user_id);

        let questions = assignment
            .question_ids
            .iter()
            .map(|question_id| {
                let (score, time_on_task) = parse::parse_score_cell(&cell_text(row.get(question_id)));
                QuestionScore {
                    question_id: question_id.clone(),
                    score,
                    time_on_task,
                    first_submitted_at: None,
                    last_submitted_at: None,
                    max_score: max_scores
                        .get(question_id)
                        .cloned()
                        .unwrap_or_else(|| parse::SENTINEL.to_string()),
                    submission_count: submission_counts
                        .get(&(question_id.clone(), user_id.clone()))
                        .copied()
                        .unwrap_or(0),
                }
            })
            .collect();

        records.push(AssignmentScoreRecord {
            student_id_enc: cipher.encrypt(&user_id)?,
            assignment_id: assignment.assignment_id.clone(),
            course_id: assignment.course_id.clone(),
            percent_correct: parse::normalize_sentinel(&cell_text(row.get("percent_correct"))),
            total_points: parse::normalize_sentinel(&cell_text(row.get("total_points"))),
            questions,
        });
    }
    Ok(records)
}

// ---- stage 5: submission timestamps ----

async fn collect_submission_timestamps(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = collect_course_timestamps(pool, config, cipher, course).await {
            warn!(course_id = %course.course_id, error = %err, "timestamp collection failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_course_timestamps(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
    course: &Course,
) -> Result<()> {
    let Some(instructor_id) = course.instructor_id.as_deref() else {
        return Ok(());
    };
    let client = SourceClient::for_instructor(config, instructor_id)?;
    let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;

    let client = &client;
    let tasks = assignments.iter().map(|assignment| async move {
        if let Err(err) = patch_assignment_timestamps(pool, client, cipher, assignment).await {
            warn!(
                assignment_id = %assignment.assignment_id,
                error = %err,
                "timestamp patch failed"
            );
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn patch_assignment_timestamps(
    pool: &PgPool,
    client: &SourceClient,
    cipher: &PiiCipher,
    assignment: &Assignment,
) -> Result<()> {
    let stamps = client
        .get_submission_timestamps(&assignment.assignment_id)
        .await?;

    for (user_id, windows) in stamps {
        let student_id_enc = cipher.encrypt(&user_id)?;
        let Some(mut record) = db::fetch_assignment_score(
            pool,
            &student_id_enc,
            &assignment.assignment_id,
            &assignment.course_id,
        )
        .await?
        else {
            // The scores stage has not seen this student yet; nothing to patch.
            debug!(assignment_id = %assignment.assignment_id, "no score record for timestamps");
            continue;
        };

        if patch_question_timestamps(&mut record.questions, &windows) > 0 {
            db::update_score_questions(
                pool,
                &record.student_id_enc,
                &record.assignment_id,
                &record.course_id,
                &record.questions,
            )
            .await?;
        }
    }
    Ok(())
}

/// Patches first/last submission times into the matching question entries,
/// leaving all other entries untouched. Returns how many entries matched.
fn patch_question_timestamps(
    questions: &mut [QuestionScore],
    windows: &HashMap<String, ApiSubmissionWindow>,
) -> usize {
    let mut patched = 0;
    for question in questions.iter_mut() {
        if let Some(window) = windows.get(&question.question_id) {
            question.first_submitted_at = window
                .first_submitted_at
                .as_deref()
                .and_then(parse::parse_timestamp);
            question.last_submitted_at = window
                .last_submitted_at
                .as_deref()
                .and_then(parse::parse_timestamp);
            patched += 1;
        }
    }
    patched
}

// ---- stage 6: framework taxonomy ----

async fn collect_framework_data(pool: &PgPool, config: &Config) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    // The taxonomy is global, so any known instructor's credentials will do.
    let Some(instructor_id) = courses.iter().find_map(|c| c.instructor_id.clone()) else {
        info!("no known instructor available for framework collection");
        return Ok(());
    };

    let client = SourceClient::for_instructor(config, &instructor_id)?;
    let frameworks = client.get_frameworks().await?;

    let mut by_question: HashMap<String, (Vec<FrameworkRef>, Vec<FrameworkRef>)> = HashMap::new();
    for summary in frameworks {
        let framework_id = value_to_id(&summary.id);
        match client.get_framework(&framework_id).await {
            Ok(framework) => merge_framework_nodes(&mut by_question, &framework),
            Err(err) => {
                warn!(framework_id = %framework_id, error = %err, "framework fetch failed");
            }
        }
    }

    for course in &courses {
        let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;
        for assignment in assignments {
            for question_id in &assignment.question_ids {
                let Some((descriptors, levels)) = by_question.get(question_id) else {
                    continue;
                };
                let alignment = FrameworkQuestionAlignment {
                    course_id: course.course_id.clone(),
                    assignment_id: assignment.assignment_id.clone(),
                    question_id: question_id.clone(),
                    descriptors: descriptors.clone(),
                    levels: levels.clone(),
                };
                if let Err(err) = db::upsert_framework_alignment(pool, &alignment).await {
                    warn!(question_id = %question_id, error = %err, "alignment upsert failed");
                }
            }
        }
    }
    Ok(())
}

fn merge_framework_nodes(
    by_question: &mut HashMap<String, (Vec<FrameworkRef>, Vec<FrameworkRef>)>,
    framework: &ApiFramework,
) {
    for descriptor in &framework.descriptors {
        for question in &descriptor.question_ids {
            by_question
                .entry(value_to_id(question))
                .or_default()
                .0
                .push(FrameworkRef {
                    id: value_to_id(&descriptor.id),
                    text: descriptor.text.clone(),
                });
        }
    }
    for level in &framework.levels {
        for question in &level.question_ids {
            by_question
                .entry(value_to_id(question))
                .or_default()
                .1
                .push(FrameworkRef {
                    id: value_to_id(&level.id),
                    text: level.text.clone(),
                });
        }
    }
}

// ---- stage 7: review time ----

async fn collect_review_time_data(pool: &PgPool, config: &Config, cipher: &PiiCipher) -> Result<()> {
    let courses = db::fetch_known_courses(pool).await?;
    let tasks = courses.iter().map(|course| async move {
        if let Err(err) = collect_course_review_times(pool, config, cipher, course).await {
            warn!(course_id = %course.course_id, error = %err, "review time collection failed");
        }
    });
    join_all(tasks).await;
    Ok(())
}

async fn collect_course_review_times(
    pool: &PgPool,
    config: &Config,
    cipher: &PiiCipher,
    course: &Course,
) -> Result<()> {
    let Some(instructor_id) = course.instructor_id.as_deref() else {
        return Ok(());
    };
    let client = SourceClient::for_instructor(config, instructor_id)?;

    let by_email: HashMap<String, String> = db::fetch_enrollments_for_course(pool, &course.course_id)
        .await?
        .into_iter()
        .map(|e| (e.email_enc, e.student_id_enc))
        .collect();

    let assignments = db::fetch_assignments_for_course(pool, &course.course_id).await?;
    for assignment in assignments {
        let events = match client
            .get_assignment_review_history(&assignment.assignment_id)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                warn!(
                    assignment_id = %assignment.assignment_id,
                    error = %err,
                    "review history fetch failed"
                );
                continue;
            }
        };

        let (records, dropped) = group_review_events(
            &course.course_id,
            &assignment.assignment_id,
            events,
            &by_email,
            cipher,
        );
        if dropped > 0 {
            warn!(
                assignment_id = %assignment.assignment_id,
                dropped,
                "review records without a resolvable student were dropped"
            );
        }
        for record in records {
            if let Err(err) = db::upsert_review_time_record(pool, &record).await {
                warn!(
                    assignment_id = %assignment.assignment_id,
                    error = %err,
                    "review time upsert failed"
                );
            }
        }
    }
    Ok(())
}

/// Joins review-history rows to enrollments via encrypted email and groups the
/// surviving intervals per student. Rows with no resolvable student id (or an
/// unparsable interval) are dropped, never stored with a blank key.
fn group_review_events(
    course_id: &str,
    assignment_id: &str,
    events: Vec<ApiReviewEvent>,
    enrollments_by_email: &HashMap<String, String>,
    cipher: &PiiCipher,
) -> (Vec<ReviewTimeRecord>, usize) {
    let mut grouped: HashMap<String, Vec<ReviewInterval>> = HashMap::new();
    let mut dropped = 0usize;

    for event in events {
        let Ok(email_enc) = cipher.encrypt(&event.email) else {
            dropped += 1;
            continue;
        };
        let Some(student_id_enc) = enrollments_by_email.get(&email_enc) else {
            dropped += 1;
            continue;
        };
        let (Some(start), Some(end)) = (
            parse::parse_timestamp(&event.created_at),
            parse::parse_timestamp(&event.updated_at),
        ) else {
            dropped += 1;
            continue;
        };

        grouped
            .entry(student_id_enc.clone())
            .or_default()
            .push(ReviewInterval {
                question_id: value_to_id(&event.question_id),
                review_time_start: start,
                review_time_end: end,
            });
    }

    let records = grouped
        .into_iter()
        .map(|(student_id_enc, questions)| ReviewTimeRecord {
            course_id: course_id.to_string(),
            assignment_id: assignment_id.to_string(),
            student_id_enc,
            questions,
        })
        .collect();
    (records, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_assignment() -> Assignment {
        Assignment {
            course_id: "c1".to_string(),
            assignment_id: "a1".to_string(),
            name: "Week 1".to_string(),
            num_questions: 2,
            question_ids: vec!["101".to_string(), "102".to_string()],
            due_date: None,
            final_submission_deadline: None,
        }
    }

    #[test]
    fn score_records_parse_cells_and_encrypt_identity() {
        let cipher = PiiCipher::new("collector-test-key");
        let table: ScoreTable = serde_json::from_value(json!({
            "header": [
                {"key": "userId", "label": "User"},
                {"key": "percent_correct", "label": "Percent"},
                {"key": "total_points", "label": "Total"},
                {"key": "101", "label": "Question 1 (10)"},
                {"key": "102", "label": "Question 2"}
            ],
            "rows": [
                {"userId": 7, "percent_correct": "N/A", "total_points": "20", "101": "87 (3:45)", "102": "-"},
                {"userId": "8", "percent_correct": "91.5%", "total_points": "20", "101": "9"}
            ]
        }))
        .unwrap();

        let max_scores: HashMap<String, String> = table
            .question_columns()
            .iter()
            .map(|c| (c.key.clone(), parse::max_score_from_label(&c.label)))
            .collect();
        let mut counts = HashMap::new();
        counts.insert(("101".to_string(), "7".to_string()), 3i64);

        let records =
            build_score_records(&test_assignment(), &table, &max_scores, &counts, &cipher).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(cipher.decrypt(&first.student_id_enc).unwrap(), "7");
        assert_eq!(first.percent_correct, "-");
        assert_eq!(first.questions[0].score, "87");
        assert_eq!(first.questions[0].time_on_task, "3:45");
        assert_eq!(first.questions[0].max_score, "10");
        assert_eq!(first.questions[0].submission_count, 3);
        assert_eq!(first.questions[1].score, "-");
        assert_eq!(first.questions[1].time_on_task, "-");
        assert_eq!(first.questions[1].max_score, "-");

        let second = &records[1];
        assert_eq!(second.percent_correct, "91.5%");
        assert_eq!(second.questions[0].score, "9");
        assert_eq!(second.questions[0].time_on_task, "0");
        // missing cell is no data, not an error
        assert_eq!(second.questions[1].score, "-");
    }

    #[test]
    fn timestamp_patch_touches_only_matching_questions() {
        let mut questions = vec![
            QuestionScore {
                question_id: "101".to_string(),
                score: "87".to_string(),
                time_on_task: "3:45".to_string(),
                first_submitted_at: None,
                last_submitted_at: None,
                max_score: "10".to_string(),
                submission_count: 1,
            },
            QuestionScore {
                question_id: "102".to_string(),
                score: "-".to_string(),
                time_on_task: "-".to_string(),
                first_submitted_at: None,
                last_submitted_at: None,
                max_score: "-".to_string(),
                submission_count: 0,
            },
        ];

        let mut windows = HashMap::new();
        windows.insert(
            "101".to_string(),
            ApiSubmissionWindow {
                first_submitted_at: Some("2026-02-01T10:00:00Z".to_string()),
                last_submitted_at: Some("2026-02-01T10:30:00Z".to_string()),
            },
        );

        let patched = patch_question_timestamps(&mut questions, &windows);
        assert_eq!(patched, 1);
        assert!(questions[0].first_submitted_at.is_some());
        assert!(questions[0].last_submitted_at.is_some());
        assert!(questions[1].first_submitted_at.is_none());
        // the non-timestamp fields survive the patch
        assert_eq!(questions[0].score, "87");
    }

    #[test]
    fn review_events_without_enrollment_are_dropped() {
        let cipher = PiiCipher::new("collector-test-key");
        let mut by_email = HashMap::new();
        by_email.insert(
            cipher.encrypt("known@example.edu").unwrap(),
            "student-1-enc".to_string(),
        );

        let events = vec![
            ApiReviewEvent {
                email: "known@example.edu".to_string(),
                question_id: json!(101),
                created_at: "2026-02-01T10:00:00Z".to_string(),
                updated_at: "2026-02-01T10:05:00Z".to_string(),
            },
            ApiReviewEvent {
                email: "known@example.edu".to_string(),
                question_id: json!(102),
                created_at: "2026-02-01T11:00:00Z".to_string(),
                updated_at: "2026-02-01T11:02:00Z".to_string(),
            },
            ApiReviewEvent {
                email: "stranger@example.edu".to_string(),
                question_id: json!(101),
                created_at: "2026-02-01T10:00:00Z".to_string(),
                updated_at: "2026-02-01T10:05:00Z".to_string(),
            },
        ];

        let (records, dropped) = group_review_events("c1", "a1", events, &by_email, &cipher);
        assert_eq!(dropped, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].student_id_enc, "student-1-enc");
        assert_eq!(records[0].questions.len(), 2);
        assert!(records
            .iter()
            .all(|r| !r.student_id_enc.is_empty()));
    }
}
