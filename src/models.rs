use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk bucket produced by the scorer for one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RiskBucket {
    Low,
    Moderate,
    High,
}

impl RiskBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBucket::Low => "low",
            RiskBucket::Moderate => "moderate",
            RiskBucket::High => "high",
        }
    }
}

/// Alert severity. Ordered so that merging an open alert can take the
/// maximum: once high, a later moderate reading never lowers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
        }
    }
}

impl From<RiskBucket> for Severity {
    fn from(bucket: RiskBucket) -> Self {
        match bucket {
            RiskBucket::Low => Severity::Low,
            RiskBucket::Moderate => Severity::Moderate,
            RiskBucket::High => Severity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AlertState {
    New,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::New => "new",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }

    /// Open alerts are the ones a mentor still owes a response on.
    pub fn is_open(&self) -> bool {
        matches!(self, AlertState::New | AlertState::Acknowledged)
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum StudentStatus {
    Active,
    AtRisk,
    Excellent,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::AtRisk => "at_risk",
            StudentStatus::Excellent => "excellent",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Student {
    pub id: Uuid,
    pub scholar_id: String,
    pub full_name: String,
    pub email: String,
    pub cohort: String,
    pub mentor_id: Option<Uuid>,
    pub status: StudentStatus,
    /// Cached copy of the most recent prediction's score.
    pub latest_risk_score: Option<i32>,
}

/// One immutable metrics snapshot for a student on a given date.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PerformanceRecord {
    pub student_id: Uuid,
    pub recorded_on: NaiveDate,
    pub attendance_rate: f64,
    pub avg_assignment_score: f64,
    pub engagement_score: f64,
}

/// A ranked contributor to a risk score, worst first in the stored list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub contribution: f64,
}

/// Output of one scorer invocation, append-only.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub id: Uuid,
    pub student_id: Uuid,
    pub score: i32,
    pub bucket: RiskBucket,
    pub factors: Vec<RiskFactor>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub student_id: Uuid,
    pub mentor_id: Option<Uuid>,
    pub severity: Severity,
    pub message: String,
    pub state: AlertState,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub escalation_count: i32,
    pub needs_admin_review: bool,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub state: Option<AlertState>,
    pub mentor_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct AlertStats {
    pub total: i64,
    pub new: i64,
    pub acknowledged: i64,
    pub resolved: i64,
    pub needs_admin_review: i64,
    pub avg_response_hours: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationKind {
    Created,
    Updated,
    Escalated,
    AdminReview,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Created => "created",
            NotificationKind::Updated => "updated",
            NotificationKind::Escalated => "escalated",
            NotificationKind::AdminReview => "admin_review",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub mentor_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub body: String,
    pub attempts: i32,
}
