use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::PgPool;
use tracing::{error, info};

use crate::db;
use crate::models::{
    AssignmentScoreRecord, ReviewTimeRecord, ReviewTimeTotal, StudentActivity, TextbookEvent,
    TimeOnTaskTotal,
};
use crate::parse;
use crate::stats;

/// Runs every aggregation job in its fixed order and reports whether all of
/// them succeeded. A failed job is logged and the run continues; downstream
/// jobs and the summarizer treat missing rows as a valid empty state.
pub async fn run_processors(pool: &PgPool) -> bool {
    let mut all_ok = true;
    all_ok &= run_job("interaction-days", interaction_days(pool)).await;
    all_ok &= run_job("grade-distribution", grade_distribution(pool)).await;
    all_ok &= run_job("submissions-by-date", submissions_by_date(pool)).await;
    all_ok &= run_job("assignment-scores", assignment_scores(pool)).await;
    all_ok &= run_job("student-activity", student_activity(pool)).await;
    all_ok &= run_job("textbook-activity-time", textbook_activity_time(pool)).await;
    all_ok &= run_job(
        "textbook-interactions-by-date",
        textbook_interactions_by_date(pool),
    )
    .await;
    all_ok &= run_job(
        "textbook-total-interactions",
        textbook_total_interactions(pool),
    )
    .await;
    all_ok &= run_job("review-time", review_time(pool)).await;
    all_ok &= run_job("time-on-task", time_on_task(pool)).await;
    all_ok
}

async fn run_job<F>(name: &'static str, job: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match job.await {
        Ok(()) => {
            info!(job = name, "derivation job complete");
            true
        }
        Err(err) => {
            error!(job = name, error = %err, "derivation job failed");
            false
        }
    }
}

// ---- job 1: interaction days ----

fn interaction_day_sets(
    records: &[AssignmentScoreRecord],
) -> BTreeMap<(String, String), BTreeSet<NaiveDate>> {
    let mut sets: BTreeMap<(String, String), BTreeSet<NaiveDate>> = BTreeMap::new();
    for record in records {
        let entry = sets
            .entry((record.course_id.clone(), record.student_id_enc.clone()))
            .or_default();
        for question in &record.questions {
            if let Some(ts) = question.first_submitted_at {
                entry.insert(ts.date_naive());
            }
            if let Some(ts) = question.last_submitted_at {
                entry.insert(ts.date_naive());
            }
        }
    }
    sets
}

async fn interaction_days(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_assignment_scores(pool).await?;
    for ((course_id, student_id_enc), days) in interaction_day_sets(&records) {
        db::replace_interaction_days(pool, &course_id, &student_id_enc, days.len() as i32).await?;
    }
    Ok(())
}

// ---- job 2: grade distribution ----

fn letter_grade(percent: f64) -> &'static str {
    if percent >= 90.0 {
        "A"
    } else if percent >= 80.0 {
        "B"
    } else if percent >= 70.0 {
        "C"
    } else if percent >= 60.0 {
        "D"
    } else {
        "F"
    }
}

fn grade_letters(records: &[AssignmentScoreRecord]) -> BTreeMap<String, Vec<String>> {
    // Mean of valid percents per student; sentinel records contribute nothing.
    let mut sums: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();
    for record in records {
        if let Some(percent) = parse::parse_percent(&record.percent_correct) {
            let entry = sums
                .entry((record.course_id.clone(), record.student_id_enc.clone()))
                .or_insert((0.0, 0));
            entry.0 += percent;
            entry.1 += 1;
        }
    }

    let mut letters: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for ((course_id, _student), (sum, count)) in sums {
        letters
            .entry(course_id)
            .or_default()
            .push(letter_grade(sum / count as f64).to_string());
    }
    for list in letters.values_mut() {
        list.sort();
    }
    letters
}

async fn grade_distribution(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_assignment_scores(pool).await?;
    for (course_id, letters) in grade_letters(&records) {
        db::replace_grade_distribution(pool, &course_id, &letters).await?;
    }
    Ok(())
}

// ---- job 3: submissions by date ----

fn submission_histograms(
    records: &[AssignmentScoreRecord],
) -> BTreeMap<(String, String), BTreeMap<NaiveDate, i64>> {
    let mut histograms: BTreeMap<(String, String), BTreeMap<NaiveDate, i64>> = BTreeMap::new();
    for record in records {
        let entry = histograms
            .entry((record.course_id.clone(), record.assignment_id.clone()))
            .or_default();
        for question in &record.questions {
            if let Some(ts) = question.first_submitted_at {
                *entry.entry(ts.date_naive()).or_insert(0) += 1;
            }
        }
    }
    histograms
}

async fn submissions_by_date(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_assignment_scores(pool).await?;
    for ((course_id, assignment_id), histogram) in submission_histograms(&records) {
        db::replace_submission_histogram(pool, &course_id, &assignment_id, &histogram).await?;
    }
    Ok(())
}

// ---- job 4: per-assignment score sets ----

fn score_sets(records: &[AssignmentScoreRecord]) -> BTreeMap<(String, String), Vec<f64>> {
    let mut sets: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for record in records {
        let entry = sets
            .entry((record.course_id.clone(), record.assignment_id.clone()))
            .or_default();
        if let Some(percent) = parse::parse_percent(&record.percent_correct) {
            entry.push(percent);
        }
    }
    sets
}

async fn assignment_scores(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_assignment_scores(pool).await?;
    for ((course_id, assignment_id), scores) in score_sets(&records) {
        db::replace_assignment_score_set(pool, &course_id, &assignment_id, &scores).await?;
    }
    Ok(())
}

// ---- job 5: student activity (seen/unseen) ----

fn split_seen(
    question_ids: &[String],
    record: &AssignmentScoreRecord,
) -> (Vec<String>, Vec<String>) {
    let seen: Vec<String> = record
        .questions
        .iter()
        .filter(|q| q.score != parse::SENTINEL)
        .map(|q| q.question_id.clone())
        .collect();
    let seen_set: HashSet<&String> = seen.iter().collect();
    let unseen = question_ids
        .iter()
        .filter(|id| !seen_set.contains(id))
        .cloned()
        .collect();
    (seen, unseen)
}

// Reads the job-4 output to know which (course, assignment) pairs exist; on a
// fresh store this is empty and the job is a no-op rather than an error.
async fn student_activity(pool: &PgPool) -> Result<()> {
    let score_sets = db::fetch_assignment_score_sets(pool).await?;
    if score_sets.is_empty() {
        info!("no derived score sets yet; student activity has nothing to do");
        return Ok(());
    }

    let records = db::fetch_all_assignment_scores(pool).await?;
    let mut by_assignment: HashMap<(String, String), Vec<&AssignmentScoreRecord>> = HashMap::new();
    for record in &records {
        by_assignment
            .entry((record.course_id.clone(), record.assignment_id.clone()))
            .or_default()
            .push(record);
    }

    let mut question_sets: HashMap<(String, String), Vec<String>> = HashMap::new();
    let course_ids: BTreeSet<&str> = score_sets.iter().map(|s| s.course_id.as_str()).collect();
    for course_id in course_ids {
        for assignment in db::fetch_assignments_for_course(pool, course_id).await? {
            question_sets.insert(
                (assignment.course_id.clone(), assignment.assignment_id.clone()),
                assignment.question_ids,
            );
        }
    }

    for set in &score_sets {
        let key = (set.course_id.clone(), set.assignment_id.clone());
        let Some(question_ids) = question_sets.get(&key) else {
            continue;
        };
        let Some(assignment_records) = by_assignment.get(&key) else {
            continue;
        };
        for record in assignment_records {
            let (seen, unseen) = split_seen(question_ids, record);
            db::replace_student_activity(
                pool,
                &StudentActivity {
                    course_id: set.course_id.clone(),
                    assignment_id: set.assignment_id.clone(),
                    student_id_enc: record.student_id_enc.clone(),
                    seen,
                    unseen,
                },
            )
            .await?;
        }
    }
    Ok(())
}

// ---- jobs 6-8: textbook activity ----

fn activity_seconds(events: &[TextbookEvent]) -> BTreeMap<(String, String), i64> {
    let mut totals: BTreeMap<(String, String), i64> = BTreeMap::new();
    for event in events {
        *totals
            .entry((event.actor_id.clone(), event.textbook_id.clone()))
            .or_insert(0) += event.seconds_active;
    }
    totals
}

async fn textbook_activity_time(pool: &PgPool) -> Result<()> {
    let events = db::fetch_textbook_events(pool).await?;
    for ((actor_id, textbook_id), seconds) in activity_seconds(&events) {
        db::replace_textbook_activity_time(pool, &actor_id, &textbook_id, seconds).await?;
    }
    Ok(())
}

fn interactions_by_date(
    events: &[TextbookEvent],
) -> BTreeMap<(String, String, NaiveDate), i64> {
    let mut counts: BTreeMap<(String, String, NaiveDate), i64> = BTreeMap::new();
    for event in events {
        *counts
            .entry((
                event.actor_id.clone(),
                event.textbook_id.clone(),
                event.occurred_at.date_naive(),
            ))
            .or_insert(0) += 1;
    }
    counts
}

async fn textbook_interactions_by_date(pool: &PgPool) -> Result<()> {
    let events = db::fetch_textbook_events(pool).await?;
    for ((actor_id, textbook_id, date), count) in interactions_by_date(&events) {
        db::replace_textbook_interactions_by_date(pool, &actor_id, &textbook_id, date, count)
            .await?;
    }
    Ok(())
}

// Sums the job-7 table; empty input means nothing to write.
async fn textbook_total_interactions(pool: &PgPool) -> Result<()> {
    let rows = db::fetch_textbook_interactions_by_date(pool).await?;
    let mut totals: BTreeMap<(String, String), i64> = BTreeMap::new();
    for (actor_id, textbook_id, _date, interactions) in rows {
        *totals.entry((actor_id, textbook_id)).or_insert(0) += interactions;
    }
    for ((actor_id, textbook_id), total) in totals {
        db::replace_textbook_total_interactions(pool, &actor_id, &textbook_id, total).await?;
    }
    Ok(())
}

// ---- job 9: review time ----

/// One review interval flattened out of a ReviewTimeRecord.
struct ReviewEntry {
    student_id_enc: String,
    question_id: String,
    minutes: f64,
}

fn review_entries(records: &[ReviewTimeRecord]) -> BTreeMap<(String, String), Vec<ReviewEntry>> {
    let mut pools: BTreeMap<(String, String), Vec<ReviewEntry>> = BTreeMap::new();
    for record in records {
        let bucket = pools
            .entry((record.course_id.clone(), record.assignment_id.clone()))
            .or_default();
        for interval in &record.questions {
            let seconds = (interval.review_time_end - interval.review_time_start)
                .num_seconds()
                .max(0);
            bucket.push(ReviewEntry {
                student_id_enc: record.student_id_enc.clone(),
                question_id: interval.question_id.clone(),
                minutes: seconds as f64 / 60.0,
            });
        }
    }
    pools
}

/// Applies upper-only outlier removal across the assignment's interval
/// population, then totals the survivors per (student, question).
fn review_totals(entries: Vec<ReviewEntry>) -> BTreeMap<(String, String), f64> {
    let kept = stats::filter_outliers(entries, |e| e.minutes, true);
    let mut totals: BTreeMap<(String, String), f64> = BTreeMap::new();
    for entry in kept {
        *totals
            .entry((entry.student_id_enc, entry.question_id))
            .or_insert(0.0) += entry.minutes;
    }
    totals
}

async fn review_time(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_review_times(pool).await?;
    for ((course_id, assignment_id), entries) in review_entries(&records) {
        for ((student_id_enc, question_id), total_minutes) in review_totals(entries) {
            db::replace_review_time_total(
                pool,
                &ReviewTimeTotal {
                    student_id_enc,
                    assignment_id: assignment_id.clone(),
                    course_id: course_id.clone(),
                    question_id,
                    total_minutes,
                },
            )
            .await?;
        }
    }
    Ok(())
}

// ---- job 10: time on task ----

fn time_on_task_totals(
    records: &[AssignmentScoreRecord],
) -> BTreeMap<(String, String, String), i64> {
    let mut totals: BTreeMap<(String, String, String), i64> = BTreeMap::new();
    for record in records {
        for question in &record.questions {
            // the sentinel parses to None and stays out of the totals
            if let Some(seconds) = parse::clock_to_seconds(&question.time_on_task) {
                *totals
                    .entry((
                        record.course_id.clone(),
                        record.assignment_id.clone(),
                        question.question_id.clone(),
                    ))
                    .or_insert(0) += seconds as i64;
            }
        }
    }
    totals
}

async fn time_on_task(pool: &PgPool) -> Result<()> {
    let records = db::fetch_all_assignment_scores(pool).await?;
    for ((course_id, assignment_id, question_id), total_seconds) in time_on_task_totals(&records) {
        db::replace_time_on_task(
            pool,
            &TimeOnTaskTotal {
                course_id,
                assignment_id,
                question_id,
                total_seconds,
            },
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuestionScore;
    use chrono::{TimeZone, Utc};

    fn question(id: &str, score: &str, time: &str, submitted: Option<&str>) -> QuestionScore {
        QuestionScore {
            question_id: id.to_string(),
            score: score.to_string(),
            time_on_task: time.to_string(),
            first_submitted_at: submitted.and_then(parse::parse_timestamp),
            last_submitted_at: submitted.and_then(parse::parse_timestamp),
            max_score: "10".to_string(),
            submission_count: 1,
        }
    }

    fn record(
        course: &str,
        assignment: &str,
        student: &str,
        percent: &str,
        questions: Vec<QuestionScore>,
    ) -> AssignmentScoreRecord {
        AssignmentScoreRecord {
            student_id_enc: student.to_string(),
            assignment_id: assignment.to_string(),
            course_id: course.to_string(),
            percent_correct: percent.to_string(),
            total_points: "20".to_string(),
            questions,
        }
    }

    #[test]
    fn interaction_days_count_distinct_dates() {
        let records = vec![
            record(
                "c1",
                "a1",
                "s1",
                "80%",
                vec![
                    question("101", "8", "1:00", Some("2026-02-01T10:00:00Z")),
                    question("102", "9", "2:00", Some("2026-02-01T18:00:00Z")),
                ],
            ),
            record(
                "c1",
                "a2",
                "s1",
                "90%",
                vec![question("201", "9", "0:30", Some("2026-02-03T09:00:00Z"))],
            ),
        ];

        let sets = interaction_day_sets(&records);
        let days = &sets[&("c1".to_string(), "s1".to_string())];
        assert_eq!(days.len(), 2);
    }

    #[test]
    fn grade_letters_average_valid_percents_only() {
        let records = vec![
            record("c1", "a1", "s1", "95%", vec![]),
            record("c1", "a2", "s1", "85%", vec![]),
            record("c1", "a1", "s2", "N/A", vec![]),
            record("c1", "a1", "s3", "59.5%", vec![]),
        ];

        let letters = grade_letters(&records);
        // s2 has no valid score and contributes no letter
        assert_eq!(letters["c1"], vec!["A", "F"]);
    }

    #[test]
    fn letter_boundaries() {
        assert_eq!(letter_grade(90.0), "A");
        assert_eq!(letter_grade(89.99), "B");
        assert_eq!(letter_grade(70.0), "C");
        assert_eq!(letter_grade(60.0), "D");
        assert_eq!(letter_grade(59.99), "F");
    }

    #[test]
    fn score_sets_exclude_sentinels() {
        let records = vec![
            record("c1", "a1", "s1", "87.5% ", vec![]),
            record("c1", "a1", "s2", "N/A", vec![]),
            record("c1", "a1", "s3", "-", vec![]),
        ];
        let sets = score_sets(&records);
        assert_eq!(sets[&("c1".to_string(), "a1".to_string())], vec![87.5]);
    }

    #[test]
    fn seen_unseen_split_uses_score_sentinel() {
        let ids = vec!["101".to_string(), "102".to_string(), "103".to_string()];
        let r = record(
            "c1",
            "a1",
            "s1",
            "80%",
            vec![
                question("101", "8", "1:00", None),
                question("102", "-", "-", None),
                question("103", "0", "0:10", None),
            ],
        );
        let (seen, unseen) = split_seen(&ids, &r);
        assert_eq!(seen, vec!["101", "103"]);
        assert_eq!(unseen, vec!["102"]);
    }

    #[test]
    fn submission_histogram_counts_first_submissions() {
        let records = vec![record(
            "c1",
            "a1",
            "s1",
            "80%",
            vec![
                question("101", "8", "1:00", Some("2026-02-01T10:00:00Z")),
                question("102", "9", "1:00", Some("2026-02-01T11:00:00Z")),
                question("103", "7", "1:00", Some("2026-02-02T10:00:00Z")),
                question("104", "-", "-", None),
            ],
        )];

        let histograms = submission_histograms(&records);
        let histogram = &histograms[&("c1".to_string(), "a1".to_string())];
        let feb1 = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let feb2 = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        assert_eq!(histogram[&feb1], 2);
        assert_eq!(histogram[&feb2], 1);
        assert_eq!(histogram.len(), 2);
    }

    #[test]
    fn review_totals_drop_upper_outliers() {
        let entries = vec![
            ("s1", "q1", 1.0),
            ("s1", "q2", 2.0),
            ("s2", "q1", 3.0),
            ("s2", "q2", 4.0),
            ("s3", "q1", 100.0),
        ]
        .into_iter()
        .map(|(s, q, m)| ReviewEntry {
            student_id_enc: s.to_string(),
            question_id: q.to_string(),
            minutes: m,
        })
        .collect();

        let totals = review_totals(entries);
        assert!(!totals.contains_key(&("s3".to_string(), "q1".to_string())));
        assert_eq!(totals[&("s1".to_string(), "q1".to_string())], 1.0);
        assert_eq!(totals[&("s2".to_string(), "q2".to_string())], 4.0);
    }

    #[test]
    fn review_entries_flatten_intervals_to_minutes() {
        let records = vec![ReviewTimeRecord {
            course_id: "c1".to_string(),
            assignment_id: "a1".to_string(),
            student_id_enc: "s1".to_string(),
            questions: vec![crate::models::ReviewInterval {
                question_id: "q1".to_string(),
                review_time_start: Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap(),
                review_time_end: Utc.with_ymd_and_hms(2026, 2, 1, 10, 3, 0).unwrap(),
            }],
        }];

        let pools = review_entries(&records);
        let entries = &pools[&("c1".to_string(), "a1".to_string())];
        assert_eq!(entries.len(), 1);
        assert!((entries[0].minutes - 3.0).abs() < 1e-9);
    }

    #[test]
    fn time_on_task_sums_seconds_and_skips_sentinels() {
        let records = vec![
            record(
                "c1",
                "a1",
                "s1",
                "80%",
                vec![
                    question("101", "8", "3:45", None),
                    question("102", "-", "-", None),
                ],
            ),
            record(
                "c1",
                "a1",
                "s2",
                "90%",
                vec![question("101", "9", "1:15", None)],
            ),
        ];

        let totals = time_on_task_totals(&records);
        assert_eq!(
            totals[&("c1".to_string(), "a1".to_string(), "101".to_string())],
            300
        );
        assert!(!totals.contains_key(&("c1".to_string(), "a1".to_string(), "102".to_string())));
    }

    #[test]
    fn textbook_totals_group_by_actor_and_book() {
        let events = vec![
            TextbookEvent {
                actor_id: "u1".to_string(),
                textbook_id: "t1".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap(),
                seconds_active: 120,
                source_key: None,
            },
            TextbookEvent {
                actor_id: "u1".to_string(),
                textbook_id: "t1".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2026, 2, 1, 16, 0, 0).unwrap(),
                seconds_active: 60,
                source_key: None,
            },
            TextbookEvent {
                actor_id: "u1".to_string(),
                textbook_id: "t1".to_string(),
                occurred_at: Utc.with_ymd_and_hms(2026, 2, 2, 10, 0, 0).unwrap(),
                seconds_active: 30,
                source_key: None,
            },
        ];

        let seconds = activity_seconds(&events);
        assert_eq!(seconds[&("u1".to_string(), "t1".to_string())], 210);

        let by_date = interactions_by_date(&events);
        let feb1 = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        assert_eq!(
            by_date[&("u1".to_string(), "t1".to_string(), feb1)],
            2
        );
    }
}
