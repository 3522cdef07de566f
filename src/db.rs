use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    ActorSummary, Assignment, AssignmentScoreRecord, CalcAssignmentScores, Course, CourseSummary,
    Enrollment, FrameworkQuestionAlignment, InteractionDays, QuestionScore, ReviewTimeRecord,
    ReviewTimeTotal, RiskStatus, StudentActivity, TextbookEvent, TimeOnTaskTotal,
};

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- courses ----

pub async fn fetch_known_courses(pool: &PgPool) -> Result<Vec<Course>> {
    let rows = sqlx::query(
        "SELECT course_id, instructor_id, name, start_date, end_date, textbook_url, is_known \
         FROM learning_analytics.courses WHERE is_known",
    )
    .fetch_all(pool)
    .await?;

    let mut courses = Vec::new();
    for row in rows {
        courses.push(Course {
            course_id: row.get("course_id"),
            instructor_id: row.get("instructor_id"),
            name: row.get("name"),
            start_date: row.get("start_date"),
            end_date: row.get("end_date"),
            textbook_url: row.get("textbook_url"),
            is_known: row.get("is_known"),
        });
    }
    Ok(courses)
}

pub async fn update_course_metadata(pool: &PgPool, course: &Course) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.courses
        (course_id, instructor_id, name, start_date, end_date, textbook_url, is_known, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (course_id) DO UPDATE
        SET instructor_id = EXCLUDED.instructor_id,
            name = EXCLUDED.name,
            start_date = EXCLUDED.start_date,
            end_date = EXCLUDED.end_date,
            textbook_url = EXCLUDED.textbook_url,
            updated_at = now()
        "#,
    )
    .bind(&course.course_id)
    .bind(&course.instructor_id)
    .bind(&course.name)
    .bind(course.start_date)
    .bind(course.end_date)
    .bind(&course.textbook_url)
    .bind(course.is_known)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- assignments ----

pub async fn upsert_assignment(pool: &PgPool, assignment: &Assignment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.assignments
        (course_id, assignment_id, name, num_questions, question_ids, due_date, final_submission_deadline)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (course_id, assignment_id) DO UPDATE
        SET name = EXCLUDED.name,
            num_questions = EXCLUDED.num_questions,
            question_ids = EXCLUDED.question_ids,
            due_date = EXCLUDED.due_date,
            final_submission_deadline = EXCLUDED.final_submission_deadline
        "#,
    )
    .bind(&assignment.course_id)
    .bind(&assignment.assignment_id)
    .bind(&assignment.name)
    .bind(assignment.num_questions)
    .bind(serde_json::to_value(&assignment.question_ids)?)
    .bind(assignment.due_date)
    .bind(assignment.final_submission_deadline)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_assignments_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<Assignment>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, name, num_questions, question_ids, due_date, \
         final_submission_deadline \
         FROM learning_analytics.assignments WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    let mut assignments = Vec::new();
    for row in rows {
        assignments.push(Assignment {
            course_id: row.get("course_id"),
            assignment_id: row.get("assignment_id"),
            name: row.get("name"),
            num_questions: row.get("num_questions"),
            question_ids: serde_json::from_value(row.get("question_ids"))
                .context("malformed question_ids document")?,
            due_date: row.get("due_date"),
            final_submission_deadline: row.get("final_submission_deadline"),
        });
    }
    Ok(assignments)
}

// ---- enrollments ----

pub async fn upsert_enrollment(pool: &PgPool, enrollment: &Enrollment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.enrollments (email_enc, course_id, student_id_enc, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email_enc, course_id) DO UPDATE
        SET student_id_enc = EXCLUDED.student_id_enc,
            created_at = EXCLUDED.created_at
        "#,
    )
    .bind(&enrollment.email_enc)
    .bind(&enrollment.course_id)
    .bind(&enrollment.student_id_enc)
    .bind(enrollment.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_enrollments_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<Enrollment>> {
    let rows = sqlx::query(
        "SELECT email_enc, course_id, student_id_enc, created_at \
         FROM learning_analytics.enrollments WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    let mut enrollments = Vec::new();
    for row in rows {
        enrollments.push(Enrollment {
            email_enc: row.get("email_enc"),
            course_id: row.get("course_id"),
            student_id_enc: row.get("student_id_enc"),
            created_at: row.get("created_at"),
        });
    }
    Ok(enrollments)
}

pub async fn fetch_email_by_student(
    pool: &PgPool,
    course_id: &str,
    student_id_enc: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT email_enc FROM learning_analytics.enrollments \
         WHERE course_id = $1 AND student_id_enc = $2",
    )
    .bind(course_id)
    .bind(student_id_enc)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("email_enc")))
}

// ---- assignment scores ----

fn map_score_record(row: &sqlx::postgres::PgRow) -> Result<AssignmentScoreRecord> {
    Ok(AssignmentScoreRecord {
        student_id_enc: row.get("student_id_enc"),
        assignment_id: row.get("assignment_id"),
        course_id: row.get("course_id"),
        percent_correct: row.get("percent_correct"),
        total_points: row.get("total_points"),
        questions: serde_json::from_value(row.get("questions"))
            .context("malformed questions document")?,
    })
}

pub async fn upsert_assignment_scores(
    pool: &PgPool,
    records: &[AssignmentScoreRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO learning_analytics.assignment_scores
            (student_id_enc, assignment_id, course_id, percent_correct, total_points, questions)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id_enc, assignment_id, course_id) DO UPDATE
            SET percent_correct = EXCLUDED.percent_correct,
                total_points = EXCLUDED.total_points,
                questions = EXCLUDED.questions
            "#,
        )
        .bind(&record.student_id_enc)
        .bind(&record.assignment_id)
        .bind(&record.course_id)
        .bind(&record.percent_correct)
        .bind(&record.total_points)
        .bind(serde_json::to_value(&record.questions)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn fetch_assignment_score(
    pool: &PgPool,
    student_id_enc: &str,
    assignment_id: &str,
    course_id: &str,
) -> Result<Option<AssignmentScoreRecord>> {
    let row = sqlx::query(
        "SELECT student_id_enc, assignment_id, course_id, percent_correct, total_points, questions \
         FROM learning_analytics.assignment_scores \
         WHERE student_id_enc = $1 AND assignment_id = $2 AND course_id = $3",
    )
    .bind(student_id_enc)
    .bind(assignment_id)
    .bind(course_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_score_record).transpose()
}

/// Writes back the patched question list for one score record; the record's
/// identity columns never change here.
pub async fn update_score_questions(
    pool: &PgPool,
    student_id_enc: &str,
    assignment_id: &str,
    course_id: &str,
    questions: &[QuestionScore],
) -> Result<()> {
    sqlx::query(
        "UPDATE learning_analytics.assignment_scores SET questions = $4 \
         WHERE student_id_enc = $1 AND assignment_id = $2 AND course_id = $3",
    )
    .bind(student_id_enc)
    .bind(assignment_id)
    .bind(course_id)
    .bind(serde_json::to_value(questions)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_all_assignment_scores(pool: &PgPool) -> Result<Vec<AssignmentScoreRecord>> {
    let rows = sqlx::query(
        "SELECT student_id_enc, assignment_id, course_id, percent_correct, total_points, questions \
         FROM learning_analytics.assignment_scores",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_score_record).collect()
}

pub async fn fetch_assignment_scores_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<AssignmentScoreRecord>> {
    let rows = sqlx::query(
        "SELECT student_id_enc, assignment_id, course_id, percent_correct, total_points, questions \
         FROM learning_analytics.assignment_scores WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_score_record).collect()
}

pub async fn count_score_records_by_assignment(
    pool: &PgPool,
    course_id: &str,
) -> Result<HashMap<String, i64>> {
    let rows = sqlx::query(
        "SELECT assignment_id, COUNT(*) AS students \
         FROM learning_analytics.assignment_scores WHERE course_id = $1 GROUP BY assignment_id",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("assignment_id"), row.get("students")))
        .collect())
}

// ---- review times ----

pub async fn upsert_review_time_record(pool: &PgPool, record: &ReviewTimeRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.review_times (course_id, assignment_id, student_id_enc, questions)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (course_id, assignment_id, student_id_enc) DO UPDATE
        SET questions = EXCLUDED.questions
        "#,
    )
    .bind(&record.course_id)
    .bind(&record.assignment_id)
    .bind(&record.student_id_enc)
    .bind(serde_json::to_value(&record.questions)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_all_review_times(pool: &PgPool) -> Result<Vec<ReviewTimeRecord>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, student_id_enc, questions \
         FROM learning_analytics.review_times",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::new();
    for row in rows {
        records.push(ReviewTimeRecord {
            course_id: row.get("course_id"),
            assignment_id: row.get("assignment_id"),
            student_id_enc: row.get("student_id_enc"),
            questions: serde_json::from_value(row.get("questions"))
                .context("malformed review intervals document")?,
        });
    }
    Ok(records)
}

// ---- framework alignments ----

pub async fn upsert_framework_alignment(
    pool: &PgPool,
    alignment: &FrameworkQuestionAlignment,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.framework_alignments
        (course_id, assignment_id, question_id, descriptors, levels)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (course_id, assignment_id, question_id) DO UPDATE
        SET descriptors = EXCLUDED.descriptors,
            levels = EXCLUDED.levels
        "#,
    )
    .bind(&alignment.course_id)
    .bind(&alignment.assignment_id)
    .bind(&alignment.question_id)
    .bind(serde_json::to_value(&alignment.descriptors)?)
    .bind(serde_json::to_value(&alignment.levels)?)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- textbook events ----

pub async fn insert_textbook_event(pool: &PgPool, event: &TextbookEvent) -> Result<bool> {
    let source_key = event
        .source_key
        .clone()
        .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

    let result = sqlx::query(
        r#"
        INSERT INTO learning_analytics.textbook_events
        (id, actor_id, textbook_id, occurred_at, seconds_active, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&event.actor_id)
    .bind(&event.textbook_id)
    .bind(event.occurred_at)
    .bind(event.seconds_active)
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_textbook_events(pool: &PgPool) -> Result<Vec<TextbookEvent>> {
    let rows = sqlx::query(
        "SELECT actor_id, textbook_id, occurred_at, seconds_active, source_key \
         FROM learning_analytics.textbook_events",
    )
    .fetch_all(pool)
    .await?;

    let mut events = Vec::new();
    for row in rows {
        events.push(TextbookEvent {
            actor_id: row.get("actor_id"),
            textbook_id: row.get("textbook_id"),
            occurred_at: row.get("occurred_at"),
            seconds_active: row.get("seconds_active"),
            source_key: row.get("source_key"),
        });
    }
    Ok(events)
}

// ---- derived collections ----

pub async fn replace_assignment_score_set(
    pool: &PgPool,
    course_id: &str,
    assignment_id: &str,
    scores: &[f64],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_assignment_scores (course_id, assignment_id, scores)
        VALUES ($1, $2, $3)
        ON CONFLICT (course_id, assignment_id) DO UPDATE SET scores = EXCLUDED.scores
        "#,
    )
    .bind(course_id)
    .bind(assignment_id)
    .bind(serde_json::to_value(scores)?)
    .execute(pool)
    .await?;
    Ok(())
}

fn map_score_set(row: &sqlx::postgres::PgRow) -> Result<CalcAssignmentScores> {
    Ok(CalcAssignmentScores {
        course_id: row.get("course_id"),
        assignment_id: row.get("assignment_id"),
        scores: serde_json::from_value(row.get("scores")).context("malformed score set")?,
    })
}

pub async fn fetch_assignment_score_sets(pool: &PgPool) -> Result<Vec<CalcAssignmentScores>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, scores FROM learning_analytics.calc_assignment_scores",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_score_set).collect()
}

pub async fn fetch_assignment_score_sets_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<CalcAssignmentScores>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, scores \
         FROM learning_analytics.calc_assignment_scores WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_score_set).collect()
}

pub async fn replace_grade_distribution(
    pool: &PgPool,
    course_id: &str,
    letters: &[String],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_grade_distribution (course_id, letters)
        VALUES ($1, $2)
        ON CONFLICT (course_id) DO UPDATE SET letters = EXCLUDED.letters
        "#,
    )
    .bind(course_id)
    .bind(serde_json::to_value(letters)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn replace_interaction_days(
    pool: &PgPool,
    course_id: &str,
    student_id_enc: &str,
    days: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_interaction_days (course_id, student_id_enc, days)
        VALUES ($1, $2, $3)
        ON CONFLICT (course_id, student_id_enc) DO UPDATE SET days = EXCLUDED.days
        "#,
    )
    .bind(course_id)
    .bind(student_id_enc)
    .bind(days)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_interaction_days_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<InteractionDays>> {
    let rows = sqlx::query(
        "SELECT course_id, student_id_enc, days \
         FROM learning_analytics.calc_interaction_days WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| InteractionDays {
            course_id: row.get("course_id"),
            student_id_enc: row.get("student_id_enc"),
            days: row.get("days"),
        })
        .collect())
}

pub async fn replace_submission_histogram(
    pool: &PgPool,
    course_id: &str,
    assignment_id: &str,
    histogram: &BTreeMap<NaiveDate, i64>,
) -> Result<()> {
    let document: BTreeMap<String, i64> = histogram
        .iter()
        .map(|(date, count)| (date.to_string(), *count))
        .collect();

    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_submissions_by_date (course_id, assignment_id, histogram)
        VALUES ($1, $2, $3)
        ON CONFLICT (course_id, assignment_id) DO UPDATE SET histogram = EXCLUDED.histogram
        "#,
    )
    .bind(course_id)
    .bind(assignment_id)
    .bind(serde_json::to_value(document)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn replace_student_activity(pool: &PgPool, activity: &StudentActivity) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_student_activity
        (course_id, assignment_id, student_id_enc, seen, unseen)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (course_id, assignment_id, student_id_enc) DO UPDATE
        SET seen = EXCLUDED.seen, unseen = EXCLUDED.unseen
        "#,
    )
    .bind(&activity.course_id)
    .bind(&activity.assignment_id)
    .bind(&activity.student_id_enc)
    .bind(serde_json::to_value(&activity.seen)?)
    .bind(serde_json::to_value(&activity.unseen)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_student_activity_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<StudentActivity>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, student_id_enc, seen, unseen \
         FROM learning_analytics.calc_student_activity WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    let mut activity = Vec::new();
    for row in rows {
        activity.push(StudentActivity {
            course_id: row.get("course_id"),
            assignment_id: row.get("assignment_id"),
            student_id_enc: row.get("student_id_enc"),
            seen: serde_json::from_value(row.get("seen")).context("malformed seen set")?,
            unseen: serde_json::from_value(row.get("unseen")).context("malformed unseen set")?,
        });
    }
    Ok(activity)
}

pub async fn replace_review_time_total(pool: &PgPool, total: &ReviewTimeTotal) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_review_time
        (student_id_enc, assignment_id, course_id, question_id, total_minutes)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (student_id_enc, assignment_id, course_id, question_id) DO UPDATE
        SET total_minutes = EXCLUDED.total_minutes
        "#,
    )
    .bind(&total.student_id_enc)
    .bind(&total.assignment_id)
    .bind(&total.course_id)
    .bind(&total.question_id)
    .bind(total.total_minutes)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_review_time_totals_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<ReviewTimeTotal>> {
    let rows = sqlx::query(
        "SELECT student_id_enc, assignment_id, course_id, question_id, total_minutes \
         FROM learning_analytics.calc_review_time WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ReviewTimeTotal {
            student_id_enc: row.get("student_id_enc"),
            assignment_id: row.get("assignment_id"),
            course_id: row.get("course_id"),
            question_id: row.get("question_id"),
            total_minutes: row.get("total_minutes"),
        })
        .collect())
}

pub async fn replace_time_on_task(pool: &PgPool, total: &TimeOnTaskTotal) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_time_on_task
        (course_id, assignment_id, question_id, total_seconds)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (course_id, assignment_id, question_id) DO UPDATE
        SET total_seconds = EXCLUDED.total_seconds
        "#,
    )
    .bind(&total.course_id)
    .bind(&total.assignment_id)
    .bind(&total.question_id)
    .bind(total.total_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_time_on_task_for_course(
    pool: &PgPool,
    course_id: &str,
) -> Result<Vec<TimeOnTaskTotal>> {
    let rows = sqlx::query(
        "SELECT course_id, assignment_id, question_id, total_seconds \
         FROM learning_analytics.calc_time_on_task WHERE course_id = $1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| TimeOnTaskTotal {
            course_id: row.get("course_id"),
            assignment_id: row.get("assignment_id"),
            question_id: row.get("question_id"),
            total_seconds: row.get("total_seconds"),
        })
        .collect())
}

pub async fn replace_textbook_activity_time(
    pool: &PgPool,
    actor_id: &str,
    textbook_id: &str,
    total_seconds: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_textbook_activity_time (actor_id, textbook_id, total_seconds)
        VALUES ($1, $2, $3)
        ON CONFLICT (actor_id, textbook_id) DO UPDATE SET total_seconds = EXCLUDED.total_seconds
        "#,
    )
    .bind(actor_id)
    .bind(textbook_id)
    .bind(total_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn replace_textbook_interactions_by_date(
    pool: &PgPool,
    actor_id: &str,
    textbook_id: &str,
    interaction_date: NaiveDate,
    interactions: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_textbook_interactions_by_date
        (actor_id, textbook_id, interaction_date, interactions)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (actor_id, textbook_id, interaction_date) DO UPDATE
        SET interactions = EXCLUDED.interactions
        "#,
    )
    .bind(actor_id)
    .bind(textbook_id)
    .bind(interaction_date)
    .bind(interactions)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_textbook_interactions_by_date(
    pool: &PgPool,
) -> Result<Vec<(String, String, NaiveDate, i64)>> {
    let rows = sqlx::query(
        "SELECT actor_id, textbook_id, interaction_date, interactions \
         FROM learning_analytics.calc_textbook_interactions_by_date",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            (
                row.get("actor_id"),
                row.get("textbook_id"),
                row.get("interaction_date"),
                row.get("interactions"),
            )
        })
        .collect())
}

pub async fn replace_textbook_total_interactions(
    pool: &PgPool,
    actor_id: &str,
    textbook_id: &str,
    total_interactions: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.calc_textbook_total_interactions
        (actor_id, textbook_id, total_interactions)
        VALUES ($1, $2, $3)
        ON CONFLICT (actor_id, textbook_id) DO UPDATE
        SET total_interactions = EXCLUDED.total_interactions
        "#,
    )
    .bind(actor_id)
    .bind(textbook_id)
    .bind(total_interactions)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- summaries ----

pub async fn upsert_course_summary(pool: &PgPool, summary: &CourseSummary) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.course_summaries
        (course_id, assignments, avg_course_percent, avg_interaction_days, avg_percent_seen, status, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (course_id) DO UPDATE
        SET assignments = EXCLUDED.assignments,
            avg_course_percent = EXCLUDED.avg_course_percent,
            avg_interaction_days = EXCLUDED.avg_interaction_days,
            avg_percent_seen = EXCLUDED.avg_percent_seen,
            status = EXCLUDED.status,
            last_updated = EXCLUDED.last_updated
        "#,
    )
    .bind(&summary.course_id)
    .bind(serde_json::to_value(&summary.assignments)?)
    .bind(summary.avg_course_percent)
    .bind(summary.avg_interaction_days)
    .bind(summary.avg_percent_seen)
    .bind(summary.status.as_str())
    .bind(summary.last_updated)
    .execute(pool)
    .await?;
    Ok(())
}

/// `latest_predicted_percent` is deliberately absent from the update set: it
/// belongs to the webhook path and must survive summary rebuilds.
pub async fn upsert_actor_summary(pool: &PgPool, summary: &ActorSummary) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO learning_analytics.actor_summaries
        (course_id, actor_id_enc, assignments, percent_seen, interaction_days, course_percent, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (course_id, actor_id_enc) DO UPDATE
        SET assignments = EXCLUDED.assignments,
            percent_seen = EXCLUDED.percent_seen,
            interaction_days = EXCLUDED.interaction_days,
            course_percent = EXCLUDED.course_percent,
            last_updated = EXCLUDED.last_updated
        "#,
    )
    .bind(&summary.course_id)
    .bind(&summary.actor_id_enc)
    .bind(serde_json::to_value(&summary.assignments)?)
    .bind(summary.percent_seen)
    .bind(summary.interaction_days)
    .bind(summary.course_percent)
    .bind(summary.last_updated)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_predicted_actors(pool: &PgPool, course_id: &str) -> Result<Vec<(String, f64)>> {
    let rows = sqlx::query(
        "SELECT actor_id_enc, latest_predicted_percent \
         FROM learning_analytics.actor_summaries \
         WHERE course_id = $1 AND latest_predicted_percent IS NOT NULL",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("actor_id_enc"), row.get("latest_predicted_percent")))
        .collect())
}

/// Non-upserting by design: an actor without an existing summary row is
/// skipped, and the caller learns that from the return value.
pub async fn set_actor_prediction(
    pool: &PgPool,
    course_id: &str,
    actor_id_enc: &str,
    predicted_percent: f64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE learning_analytics.actor_summaries \
         SET latest_predicted_percent = $3, last_updated = now() \
         WHERE course_id = $1 AND actor_id_enc = $2",
    )
    .bind(course_id)
    .bind(actor_id_enc)
    .bind(predicted_percent)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_course_summary_status(
    pool: &PgPool,
    course_id: &str,
) -> Result<Option<RiskStatus>> {
    let row =
        sqlx::query("SELECT status FROM learning_analytics.course_summaries WHERE course_id = $1")
            .bind(course_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| RiskStatus::parse(r.get("status"))))
}
