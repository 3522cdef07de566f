use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;

/// Tokens are issued with ~30 minutes of validity; refresh a little early
/// rather than racing the expiry.
const TOKEN_TTL: Duration = Duration::from_secs(25 * 60);

#[derive(Debug, Error)]
pub enum SourceApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Token scope: the platform signs tokens for exactly one instructor or one
/// course at a time.
#[derive(Debug, Clone)]
enum Scope {
    Instructor(String),
    Course(String),
}

struct CachedToken {
    token: String,
    acquired_at: Instant,
}

/// Thin typed client for the course-platform API. One instance per scope;
/// the signed token is cached on the instance and renewed on staleness or a
/// single 401.
pub struct SourceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    scope: Scope,
    token: Mutex<Option<CachedToken>>,
}

impl SourceClient {
    pub fn for_instructor(config: &Config, instructor_id: &str) -> Result<Self, SourceApiError> {
        Self::new(config, Scope::Instructor(instructor_id.to_string()))
    }

    pub fn for_course(config: &Config, course_id: &str) -> Result<Self, SourceApiError> {
        Self::new(config, Scope::Course(course_id.to_string()))
    }

    fn new(config: &Config, scope: Scope) -> Result<Self, SourceApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceApiError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.source_api_url.trim_end_matches('/').to_string(),
            api_key: config.source_api_key.clone(),
            scope,
            token: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<String, SourceApiError> {
        let mut body = serde_json::json!({ "api_key": self.api_key });
        match &self.scope {
            Scope::Instructor(id) => body["instructor_id"] = Value::String(id.clone()),
            Scope::Course(id) => body["course_id"] = Value::String(id.clone()),
        }

        let response = self
            .http
            .post(format!("{}/auth/token", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SourceApiError::Auth(format!("{status}: {text}")));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceApiError::Parse(e.to_string()))?;
        Ok(parsed.token)
    }

    // The lock is never held across the login await; two racing refreshes just
    // both write a fresh token.
    async fn bearer_token(&self) -> Result<String, SourceApiError> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.acquired_at.elapsed() < TOKEN_TTL {
                    return Ok(cached.token.clone());
                }
            }
        }

        let token = self.login().await?;
        let mut guard = self.token.lock().await;
        *guard = Some(CachedToken {
            token: token.clone(),
            acquired_at: Instant::now(),
        });
        Ok(token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceApiError> {
        let mut retried = false;
        loop {
            let token = self.bearer_token().await?;
            let response = self
                .http
                .get(format!("{}{}", self.base_url, path))
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| SourceApiError::Network(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 401 && !retried {
                // One re-login attempt, not an unbounded retry loop.
                retried = true;
                self.token.lock().await.take();
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(SourceApiError::Api(status.as_u16(), text));
            }

            return response
                .json::<T>()
                .await
                .map_err(|e| SourceApiError::Parse(e.to_string()));
        }
    }

    pub async fn get_course_mini_summary(
        &self,
        course_id: &str,
    ) -> Result<CourseMiniSummary, SourceApiError> {
        self.get_json(&format!("/courses/{course_id}/mini-summary"))
            .await
    }

    pub async fn get_course_assignments(
        &self,
        course_id: &str,
    ) -> Result<Vec<ApiAssignment>, SourceApiError> {
        self.get_json(&format!("/courses/{course_id}/assignments"))
            .await
    }

    pub async fn get_course_enrollments(
        &self,
        course_id: &str,
    ) -> Result<Vec<ApiEnrollment>, SourceApiError> {
        self.get_json(&format!("/courses/{course_id}/enrollments"))
            .await
    }

    pub async fn get_assignment_scores(
        &self,
        assignment_id: &str,
    ) -> Result<ScoreTable, SourceApiError> {
        self.get_json(&format!("/assignments/{assignment_id}/scores"))
            .await
    }

    pub async fn get_auto_graded_submissions(
        &self,
        assignment_id: &str,
        question_id: &str,
    ) -> Result<Vec<ApiSubmissionCount>, SourceApiError> {
        self.get_json(&format!(
            "/assignments/{assignment_id}/questions/{question_id}/auto-graded-submissions"
        ))
        .await
    }

    pub async fn get_submission_timestamps(
        &self,
        assignment_id: &str,
    ) -> Result<HashMap<String, HashMap<String, ApiSubmissionWindow>>, SourceApiError> {
        self.get_json(&format!("/assignments/{assignment_id}/submission-timestamps"))
            .await
    }

    pub async fn get_assignment_review_history(
        &self,
        assignment_id: &str,
    ) -> Result<Vec<ApiReviewEvent>, SourceApiError> {
        self.get_json(&format!("/assignments/{assignment_id}/review-history"))
            .await
    }

    pub async fn get_frameworks(&self) -> Result<Vec<ApiFrameworkSummary>, SourceApiError> {
        self.get_json("/frameworks").await
    }

    pub async fn get_framework(&self, framework_id: &str) -> Result<ApiFramework, SourceApiError> {
        self.get_json(&format!("/frameworks/{framework_id}")).await
    }
}

/// Ids arrive as JSON numbers or strings depending on the endpoint; normalize
/// to a string token.
pub fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseMiniSummary {
    pub name: String,
    pub user_id: Option<Value>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub textbook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiAssignTo {
    #[serde(default)]
    pub groups: Vec<String>,
    pub due: Option<String>,
    pub final_submission_deadline: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiAssignment {
    pub id: Value,
    pub name: String,
    #[serde(default)]
    pub num_questions: i64,
    #[serde(default)]
    pub assign_tos: Vec<ApiAssignTo>,
}

impl ApiAssignment {
    /// The primary due window is the one assigned to the literal group
    /// `"Everybody"`.
    pub fn primary_window(&self) -> Option<&ApiAssignTo> {
        self.assign_tos
            .iter()
            .find(|a| a.groups.iter().any(|g| g == "Everybody"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnrollment {
    pub id: Value,
    pub name: Option<String>,
    pub email: String,
    pub enrollment_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreColumn {
    pub key: String,
    pub label: String,
}

/// Row-per-student score table. Rows carry `userId`, `percent_correct`,
/// `total_points`, plus one entry per question id; question columns are the
/// header keys outside the reserved set.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreTable {
    #[serde(default)]
    pub header: Vec<ScoreColumn>,
    #[serde(default)]
    pub rows: Vec<HashMap<String, Value>>,
}

pub const RESERVED_SCORE_COLUMNS: [&str; 4] = ["userId", "name", "percent_correct", "total_points"];

impl ScoreTable {
    pub fn question_columns(&self) -> Vec<&ScoreColumn> {
        self.header
            .iter()
            .filter(|c| !RESERVED_SCORE_COLUMNS.contains(&c.key.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSubmissionCount {
    pub user_id: Value,
    #[serde(default)]
    pub submission_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSubmissionWindow {
    pub first_submitted_at: Option<String>,
    pub last_submitted_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiReviewEvent {
    pub email: String,
    pub question_id: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFrameworkSummary {
    pub id: Value,
}

/// Descriptor or level node; `question_ids` lists the questions the node is
/// aligned to.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiFrameworkNode {
    pub id: Value,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub question_ids: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFramework {
    pub id: Value,
    #[serde(default)]
    pub levels: Vec<ApiFrameworkNode>,
    #[serde(default)]
    pub descriptors: Vec<ApiFrameworkNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_normalize_from_numbers_and_strings() {
        assert_eq!(value_to_id(&serde_json::json!(42)), "42");
        assert_eq!(value_to_id(&serde_json::json!("q-17")), "q-17");
    }

    #[test]
    fn primary_window_requires_everybody_group() {
        let assignment: ApiAssignment = serde_json::from_value(serde_json::json!({
            "id": 9,
            "name": "Week 3 Homework",
            "num_questions": 2,
            "assign_tos": [
                {"groups": ["Section A"], "due": "2026-02-01T00:00:00Z", "final_submission_deadline": null},
                {"groups": ["Everybody"], "due": "2026-02-08T00:00:00Z", "final_submission_deadline": "2026-02-15T00:00:00Z"}
            ]
        }))
        .unwrap();

        let window = assignment.primary_window().unwrap();
        assert_eq!(window.due.as_deref(), Some("2026-02-08T00:00:00Z"));

        let none: ApiAssignment = serde_json::from_value(serde_json::json!({
            "id": 10,
            "name": "Extra credit",
            "assign_tos": [{"groups": ["Section A"], "due": null, "final_submission_deadline": null}]
        }))
        .unwrap();
        assert!(none.primary_window().is_none());
    }

    #[test]
    fn question_columns_skip_reserved_keys() {
        let table: ScoreTable = serde_json::from_value(serde_json::json!({
            "header": [
                {"key": "userId", "label": "User"},
                {"key": "percent_correct", "label": "Percent"},
                {"key": "total_points", "label": "Total"},
                {"key": "101", "label": "Question 1 (10)"},
                {"key": "102", "label": "Question 2 (5)"}
            ],
            "rows": []
        }))
        .unwrap();

        let columns: Vec<&str> = table
            .question_columns()
            .iter()
            .map(|c| c.key.as_str())
            .collect();
        assert_eq!(columns, vec!["101", "102"]);
    }
}
