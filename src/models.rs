use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Course {
    pub course_id: String,
    pub instructor_id: Option<String>,
    pub name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub textbook_url: Option<String>,
    pub is_known: bool,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub course_id: String,
    pub assignment_id: String,
    pub name: String,
    pub num_questions: i32,
    /// Opaque tokens from the source platform; order matters and is preserved.
    pub question_ids: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub final_submission_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub email_enc: String,
    pub course_id: String,
    pub student_id_enc: String,
    pub created_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question_id: String,
    pub score: String,
    pub time_on_task: String,
    pub first_submitted_at: Option<DateTime<Utc>>,
    pub last_submitted_at: Option<DateTime<Utc>>,
    pub max_score: String,
    pub submission_count: i64,
}

#[derive(Debug, Clone)]
pub struct AssignmentScoreRecord {
    pub student_id_enc: String,
    pub assignment_id: String,
    pub course_id: String,
    pub percent_correct: String,
    pub total_points: String,
    pub questions: Vec<QuestionScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInterval {
    pub question_id: String,
    pub review_time_start: DateTime<Utc>,
    pub review_time_end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReviewTimeRecord {
    pub course_id: String,
    pub assignment_id: String,
    pub student_id_enc: String,
    pub questions: Vec<ReviewInterval>,
}

/// A descriptor or level reference within the competency framework taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameworkRef {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct FrameworkQuestionAlignment {
    pub course_id: String,
    pub assignment_id: String,
    pub question_id: String,
    pub descriptors: Vec<FrameworkRef>,
    pub levels: Vec<FrameworkRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextbookEvent {
    pub actor_id: String,
    pub textbook_id: String,
    pub occurred_at: DateTime<Utc>,
    pub seconds_active: i64,
    pub source_key: Option<String>,
}

// Derived rows read back by later jobs and the summarizer.

#[derive(Debug, Clone)]
pub struct CalcAssignmentScores {
    pub course_id: String,
    pub assignment_id: String,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct StudentActivity {
    pub course_id: String,
    pub assignment_id: String,
    pub student_id_enc: String,
    pub seen: Vec<String>,
    pub unseen: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewTimeTotal {
    pub student_id_enc: String,
    pub assignment_id: String,
    pub course_id: String,
    pub question_id: String,
    pub total_minutes: f64,
}

#[derive(Debug, Clone)]
pub struct TimeOnTaskTotal {
    pub course_id: String,
    pub assignment_id: String,
    pub question_id: String,
    pub total_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct InteractionDays {
    pub course_id: String,
    pub student_id_enc: String,
    pub days: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskStatus {
    Success,
    Warning,
    Danger,
    InsufficientData,
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Success => "success",
            RiskStatus::Warning => "warning",
            RiskStatus::Danger => "danger",
            RiskStatus::InsufficientData => "insufficient-data",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => RiskStatus::Success,
            "warning" => RiskStatus::Warning,
            "danger" => RiskStatus::Danger,
            _ => RiskStatus::InsufficientData,
        }
    }
}

/// Per-assignment rollup shared by course- and actor-grain summaries. At
/// actor grain the "averages" are the single student's own values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRollup {
    pub assignment_id: String,
    pub name: String,
    pub avg_unweighted_score: f64,
    pub avg_time_on_task_minutes: f64,
    pub avg_time_in_review_minutes: f64,
}

#[derive(Debug, Clone)]
pub struct CourseSummary {
    pub course_id: String,
    pub assignments: Vec<AssignmentRollup>,
    pub avg_course_percent: f64,
    pub avg_interaction_days: f64,
    pub avg_percent_seen: f64,
    pub status: RiskStatus,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActorSummary {
    pub course_id: String,
    pub actor_id_enc: String,
    pub assignments: Vec<AssignmentRollup>,
    pub percent_seen: f64,
    pub interaction_days: i32,
    pub course_percent: f64,
    pub latest_predicted_percent: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

/// One row of `get_ews_results`. `name` carries the enrollment email,
/// decrypted only outside privacy mode.
#[derive(Debug, Clone)]
pub struct EwsResult {
    pub student_id: String,
    pub name: String,
    pub estimated_final: f64,
    pub course_avg_diff: f64,
    pub z_score: f64,
    pub status: RiskStatus,
    pub course_avg: f64,
    pub course_std_dev: f64,
}

/// Webhook body posted by the prediction host after an async refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionWebhook {
    pub state: String,
    pub course_id: String,
    #[serde(default)]
    pub predictions: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RiskStatus::Success,
            RiskStatus::Warning,
            RiskStatus::Danger,
            RiskStatus::InsufficientData,
        ] {
            assert_eq!(RiskStatus::parse(status.as_str()), status);
        }
        assert_eq!(RiskStatus::parse("unknown"), RiskStatus::InsufficientData);
    }

    #[test]
    fn webhook_payload_tolerates_missing_predictions() {
        let payload: PredictionWebhook =
            serde_json::from_str(r#"{"state":"error","course_id":"c1"}"#).unwrap();
        assert_eq!(payload.state, "error");
        assert!(payload.predictions.is_empty());
    }
}
