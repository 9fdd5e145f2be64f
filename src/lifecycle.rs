//! Alert lifecycle manager: decides when a prediction opens an alert, tracks
//! mentor acknowledgement and resolution, and enforces the response SLA via
//! the escalation sweep.
//!
//! Every mutation is a compare-and-swap on the alert's version column, so a
//! prediction-driven merge and a sweep-driven escalation can interleave
//! without racing into divergent states. The decision logic is pure and takes
//! `now` explicitly; the async layer applies decisions with bounded retries.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ReassignPolicy};
use crate::error::AlertError;
use crate::models::{
    Alert, AlertState, NotificationKind, Prediction, Severity, Student, StudentStatus,
};
use crate::notify;

const OPEN_ALERT_INDEX: &str = "alerts_one_open_per_student";

/// What `create_or_update_alert` did with a prediction.
#[derive(Debug)]
pub enum AlertOutcome {
    /// Prediction was below the alerting threshold; nothing to do.
    Skipped,
    Created(Alert),
    Updated(Alert),
    /// An open alert existed but the prediction changed nothing.
    Unchanged(Alert),
}

// ---------------------------------------------------------------------------
// Pure decision layer
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AckDecision {
    Acknowledge(Alert),
    /// Acknowledging an acknowledged alert is a no-op, not an error.
    AlreadyAcknowledged,
}

pub fn decide_acknowledge(alert: &Alert, now: DateTime<Utc>) -> Result<AckDecision, AlertError> {
    match alert.state {
        AlertState::New => {
            let mut next = alert.clone();
            next.state = AlertState::Acknowledged;
            next.acknowledged_at = Some(now);
            Ok(AckDecision::Acknowledge(next))
        }
        AlertState::Acknowledged => Ok(AckDecision::AlreadyAcknowledged),
        AlertState::Resolved => Err(AlertError::InvalidTransition {
            from: alert.state,
            action: "acknowledge",
        }),
    }
}

pub fn decide_resolve(alert: &Alert, now: DateTime<Utc>) -> Result<Alert, AlertError> {
    if alert.state == AlertState::Resolved {
        return Err(AlertError::InvalidTransition {
            from: alert.state,
            action: "resolve",
        });
    }
    let mut next = alert.clone();
    next.state = AlertState::Resolved;
    next.resolved_at = Some(now);
    Ok(next)
}

/// Fold a new moderate/high prediction into an existing open alert. The SLA
/// clock stays anchored to the original creation, and severity only moves
/// upward: an open high alert is never downgraded by a later moderate
/// reading.
pub fn merge_into_open(existing: &Alert, prediction: &Prediction, message: String) -> Alert {
    let mut next = existing.clone();
    next.severity = existing.severity.max(Severity::from(prediction.bucket));
    next.message = message;
    next
}

pub fn escalation_due(alert: &Alert, sla_window: Duration, now: DateTime<Utc>) -> bool {
    if alert.state != AlertState::New {
        return false;
    }
    if now - alert.created_at <= sla_window {
        return false;
    }
    match alert.last_escalated_at {
        // Re-fires only once the previous escalation has aged out of the
        // window, which is what makes overlapping sweeps idempotent.
        Some(last) => now - last > sla_window,
        None => true,
    }
}

#[derive(Debug)]
pub enum EscalationDecision {
    /// Escalate: count incremented, window marker stamped. The mentor
    /// reassignment happens in the async layer.
    Escalate(Alert),
    /// Escalation cap reached: park the alert for the admin queue instead of
    /// escalating indefinitely.
    ParkForAdmin(Alert),
    Skip,
}

pub fn decide_escalation(
    alert: &Alert,
    sla_window: Duration,
    max_escalations: i32,
    now: DateTime<Utc>,
) -> EscalationDecision {
    if alert.needs_admin_review || !escalation_due(alert, sla_window, now) {
        return EscalationDecision::Skip;
    }
    let mut next = alert.clone();
    if alert.escalation_count >= max_escalations {
        next.needs_admin_review = true;
        next.last_escalated_at = Some(now);
        return EscalationDecision::ParkForAdmin(next);
    }
    next.escalation_count += 1;
    next.last_escalated_at = Some(now);
    EscalationDecision::Escalate(next)
}

fn alert_message(student: &Student, prediction: &Prediction) -> String {
    let factors: Vec<&str> = prediction
        .factors
        .iter()
        .take(3)
        .map(|f| f.name.as_str())
        .collect();
    format!(
        "{} ({}) flagged with {} dropout risk (score {}/10); drivers: {}",
        student.full_name,
        student.scholar_id,
        prediction.bucket.as_str(),
        prediction.score,
        factors.join(", ")
    )
}

// ---------------------------------------------------------------------------
// Bounded retry
// ---------------------------------------------------------------------------

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AlertError>> + Send + 'a>>;

fn backoff_delay(base: StdDuration, attempt: u32) -> StdDuration {
    let exp = base.saturating_mul(1u32 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    exp + StdDuration::from_millis(jitter)
}

/// Run one alert-store operation with bounded retries. CAS losses and store
/// outages are retried with jittered backoff; anything else surfaces
/// immediately. An exhausted retry budget is logged at error severity before
/// surfacing, since a dropped alert operation is a safety-relevant omission.
async fn with_retry<'a, T, F>(cfg: &Config, op: &'static str, mut f: F) -> Result<T, AlertError>
where
    F: FnMut() -> OpFuture<'a, T>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < cfg.retry_attempts => {
                attempt += 1;
                let delay = backoff_delay(cfg.retry_base_delay, attempt);
                debug!(op, attempt, ?delay, error = %err, "retrying alert operation");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    error!(op, attempts = attempt + 1, error = %err,
                        "alert operation failed after exhausting retries");
                }
                return Err(err);
            }
        }
    }
}

fn classify_insert_error(err: sqlx::Error) -> AlertError {
    // Losing the find-or-create race trips the partial unique index; the
    // retry turns it into a merge against the winner's row.
    if let sqlx::Error::Database(ref db) = err {
        if db.constraint() == Some(OPEN_ALERT_INDEX) {
            return AlertError::PersistenceConflict;
        }
    }
    AlertError::PersistenceUnavailable(err)
}

// ---------------------------------------------------------------------------
// Store operations (single attempt each; composed under with_retry)
// ---------------------------------------------------------------------------

async fn fetch_alert(pool: &PgPool, alert_id: Uuid) -> Result<Alert, AlertError> {
    sqlx::query_as::<_, Alert>(
        r#"
        SELECT id, student_id, mentor_id, severity, message, state, note,
               created_at, acknowledged_at, resolved_at, last_escalated_at,
               escalation_count, needs_admin_review, version
        FROM risk_alerts.alerts WHERE id = $1
        "#,
    )
    .bind(alert_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AlertError::AlertNotFound(alert_id))
}

async fn fetch_open_alert(pool: &PgPool, student_id: Uuid) -> Result<Option<Alert>, AlertError> {
    let alert = sqlx::query_as::<_, Alert>(
        r#"
        SELECT id, student_id, mentor_id, severity, message, state, note,
               created_at, acknowledged_at, resolved_at, last_escalated_at,
               escalation_count, needs_admin_review, version
        FROM risk_alerts.alerts
        WHERE student_id = $1 AND state IN ('new', 'acknowledged')
        "#,
    )
    .bind(student_id)
    .fetch_optional(pool)
    .await?;
    Ok(alert)
}

/// Apply a mutated alert with an optimistic version check. Zero rows touched
/// means a concurrent writer got there first.
async fn cas_update(pool: &PgPool, next: &Alert) -> Result<Alert, AlertError> {
    let result = sqlx::query(
        r#"
        UPDATE risk_alerts.alerts
        SET mentor_id = $3, severity = $4, message = $5, state = $6, note = $7,
            acknowledged_at = $8, resolved_at = $9, last_escalated_at = $10,
            escalation_count = $11, needs_admin_review = $12,
            version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(next.id)
    .bind(next.version)
    .bind(next.mentor_id)
    .bind(next.severity)
    .bind(&next.message)
    .bind(next.state)
    .bind(&next.note)
    .bind(next.acknowledged_at)
    .bind(next.resolved_at)
    .bind(next.last_escalated_at)
    .bind(next.escalation_count)
    .bind(next.needs_admin_review)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AlertError::PersistenceConflict);
    }
    let mut applied = next.clone();
    applied.version += 1;
    Ok(applied)
}

async fn insert_alert(pool: &PgPool, alert: &Alert) -> Result<(), AlertError> {
    sqlx::query(
        r#"
        INSERT INTO risk_alerts.alerts
        (id, student_id, mentor_id, severity, message, state, created_at,
         escalation_count, needs_admin_review, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, FALSE, 0)
        "#,
    )
    .bind(alert.id)
    .bind(alert.student_id)
    .bind(alert.mentor_id)
    .bind(alert.severity)
    .bind(&alert.message)
    .bind(alert.state)
    .bind(alert.created_at)
    .execute(pool)
    .await
    .map_err(classify_insert_error)?;
    Ok(())
}

/// Risk-derived student status is a cached projection; failing to refresh it
/// must not fail the alert operation that triggered it.
async fn set_student_status(pool: &PgPool, student_id: Uuid, status: StudentStatus) {
    let result = sqlx::query("UPDATE risk_alerts.students SET status = $2 WHERE id = $1")
        .bind(student_id)
        .bind(status)
        .execute(pool)
        .await;
    if let Err(err) = result {
        warn!(%student_id, status = status.as_str(), error = %err,
            "failed to refresh student status");
    }
}

/// Resolution only clears the at-risk flag; a manually set status survives.
async fn clear_at_risk_status(pool: &PgPool, student_id: Uuid) {
    let result = sqlx::query(
        "UPDATE risk_alerts.students SET status = 'active' WHERE id = $1 AND status = 'at_risk'",
    )
    .bind(student_id)
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!(%student_id, error = %err, "failed to clear at-risk status");
    }
}

/// Pick the next responder for an escalated alert, per the configured policy,
/// among active mentors of the student's cohort excluding the current one.
async fn next_mentor(
    pool: &PgPool,
    policy: ReassignPolicy,
    cohort: &str,
    current: Option<Uuid>,
) -> Result<Option<Uuid>, AlertError> {
    let query = match policy {
        ReassignPolicy::LeastLoaded => {
            r#"
            SELECT m.id FROM risk_alerts.mentors m
            LEFT JOIN risk_alerts.alerts a
              ON a.mentor_id = m.id AND a.state IN ('new', 'acknowledged')
            WHERE m.active AND m.cohort = $1 AND m.id IS DISTINCT FROM $2
            GROUP BY m.id
            ORDER BY COUNT(a.id), m.id
            LIMIT 1
            "#
        }
        ReassignPolicy::RoundRobin => {
            r#"
            SELECT m.id FROM risk_alerts.mentors m
            LEFT JOIN risk_alerts.alerts a ON a.mentor_id = m.id
            WHERE m.active AND m.cohort = $1 AND m.id IS DISTINCT FROM $2
            GROUP BY m.id
            ORDER BY MAX(a.last_escalated_at) ASC NULLS FIRST, m.id
            LIMIT 1
            "#
        }
    };

    let row = sqlx::query(query)
        .bind(cohort)
        .bind(current)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("id")))
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Entry point invoked after each scored prediction: find-or-create the
/// student's open alert, or fold the prediction into it.
pub async fn create_or_update_alert(
    pool: &PgPool,
    cfg: &Config,
    student: &Student,
    prediction: &Prediction,
) -> Result<AlertOutcome, AlertError> {
    if Severity::from(prediction.bucket) < Severity::Moderate {
        return Ok(AlertOutcome::Skipped);
    }
    let message = alert_message(student, prediction);

    let outcome = with_retry(cfg, "create_or_update", || {
        let message = message.clone();
        Box::pin(async move {
            match fetch_open_alert(pool, prediction.student_id).await? {
                None => {
                    let alert = Alert {
                        id: Uuid::new_v4(),
                        student_id: prediction.student_id,
                        mentor_id: student.mentor_id,
                        severity: Severity::from(prediction.bucket),
                        message,
                        state: AlertState::New,
                        note: None,
                        created_at: Utc::now(),
                        acknowledged_at: None,
                        resolved_at: None,
                        last_escalated_at: None,
                        escalation_count: 0,
                        needs_admin_review: false,
                        version: 0,
                    };
                    insert_alert(pool, &alert).await?;
                    Ok(AlertOutcome::Created(alert))
                }
                Some(existing) => {
                    let next = merge_into_open(&existing, prediction, message);
                    if next.severity == existing.severity && next.message == existing.message {
                        return Ok(AlertOutcome::Unchanged(existing));
                    }
                    let applied = cas_update(pool, &next).await?;
                    Ok(AlertOutcome::Updated(applied))
                }
            }
        }) as OpFuture<'_, AlertOutcome>
    })
    .await?;

    match &outcome {
        AlertOutcome::Created(alert) => {
            info!(alert_id = %alert.id, student = %student.scholar_id,
                severity = alert.severity.as_str(), "alert created");
            set_student_status(pool, student.id, StudentStatus::AtRisk).await;
            notify::enqueue(pool, alert, NotificationKind::Created, alert.message.clone()).await;
        }
        AlertOutcome::Updated(alert) => {
            info!(alert_id = %alert.id, student = %student.scholar_id,
                severity = alert.severity.as_str(), "open alert updated");
            notify::enqueue(pool, alert, NotificationKind::Updated, alert.message.clone()).await;
        }
        AlertOutcome::Unchanged(_) | AlertOutcome::Skipped => {}
    }

    Ok(outcome)
}

/// Mentor acknowledges an alert. Idempotent: acknowledging an acknowledged
/// alert succeeds without touching anything.
pub async fn acknowledge_alert(
    pool: &PgPool,
    cfg: &Config,
    alert_id: Uuid,
    note: Option<String>,
) -> Result<Alert, AlertError> {
    with_retry(cfg, "acknowledge", || {
        let note = note.clone();
        Box::pin(async move {
            let alert = fetch_alert(pool, alert_id).await?;
            match decide_acknowledge(&alert, Utc::now())? {
                AckDecision::AlreadyAcknowledged => Ok(alert),
                AckDecision::Acknowledge(mut next) => {
                    if note.is_some() {
                        next.note = note;
                    }
                    cas_update(pool, &next).await
                }
            }
        }) as OpFuture<'_, Alert>
    })
    .await
}

/// Mentor resolves an alert from either open state. Resolving a resolved
/// alert is an `InvalidTransition`.
pub async fn resolve_alert(
    pool: &PgPool,
    cfg: &Config,
    alert_id: Uuid,
    note: Option<String>,
) -> Result<Alert, AlertError> {
    let alert = with_retry(cfg, "resolve", || {
        let note = note.clone();
        Box::pin(async move {
            let alert = fetch_alert(pool, alert_id).await?;
            let mut next = decide_resolve(&alert, Utc::now())?;
            if note.is_some() {
                next.note = note;
            }
            cas_update(pool, &next).await
        }) as OpFuture<'_, Alert>
    })
    .await?;

    clear_at_risk_status(pool, alert.student_id).await;
    Ok(alert)
}

/// Outcome of one escalation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub escalated: usize,
    /// Alerts whose escalation failed even after retries. The next sweep
    /// picks them up again; a nonzero count still means this pass dropped
    /// work and the scheduler should say so.
    pub failed: usize,
}

/// One SLA pass over breached alerts. At-least-once and restartable: each
/// alert is independently guarded by its version check and the per-window
/// escalation marker, so overlapping or interrupted sweeps cannot double-
/// escalate.
pub async fn sweep_escalations(
    pool: &PgPool,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<SweepSummary, AlertError> {
    let breach_cutoff = now - cfg.sla_window;
    let candidates = sqlx::query_as::<_, Alert>(
        r#"
        SELECT id, student_id, mentor_id, severity, message, state, note,
               created_at, acknowledged_at, resolved_at, last_escalated_at,
               escalation_count, needs_admin_review, version
        FROM risk_alerts.alerts
        WHERE state = 'new' AND NOT needs_admin_review
          AND created_at < $1
          AND (last_escalated_at IS NULL OR last_escalated_at < $1)
        ORDER BY created_at
        "#,
    )
    .bind(breach_cutoff)
    .fetch_all(pool)
    .await?;

    let mut summary = SweepSummary::default();
    for candidate in candidates {
        match escalate_one(pool, cfg, candidate.id, now).await {
            Ok(true) => summary.escalated += 1,
            Ok(false) => {}
            Err(err) => {
                error!(alert_id = %candidate.id, error = %err, "escalation failed");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn escalate_one(
    pool: &PgPool,
    cfg: &Config,
    alert_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, AlertError> {
    with_retry(cfg, "escalate", || {
        Box::pin(async move {
            // Re-read under the version check: the mentor may have
            // acknowledged, or a competing sweep may have escalated, since
            // the candidate list was taken.
            let alert = fetch_alert(pool, alert_id).await?;
            match decide_escalation(&alert, cfg.sla_window, cfg.max_escalations, now) {
                EscalationDecision::Skip => Ok(false),
                EscalationDecision::ParkForAdmin(next) => {
                    let applied = cas_update(pool, &next).await?;
                    warn!(alert_id = %applied.id,
                        escalations = applied.escalation_count,
                        "escalation cap reached, parking alert for admin review");
                    notify::enqueue(
                        pool,
                        &applied,
                        NotificationKind::AdminReview,
                        format!(
                            "alert {} exceeded {} escalations without acknowledgement",
                            applied.id, cfg.max_escalations
                        ),
                    )
                    .await;
                    Ok(false)
                }
                EscalationDecision::Escalate(mut next) => {
                    let cohort: String = sqlx::query(
                        "SELECT cohort FROM risk_alerts.students WHERE id = $1",
                    )
                    .bind(next.student_id)
                    .fetch_one(pool)
                    .await?
                    .get("cohort");

                    if let Some(mentor_id) =
                        next_mentor(pool, cfg.reassign_policy, &cohort, alert.mentor_id).await?
                    {
                        next.mentor_id = Some(mentor_id);
                    }
                    let applied = cas_update(pool, &next).await?;
                    info!(alert_id = %applied.id,
                        escalation_count = applied.escalation_count,
                        mentor_id = ?applied.mentor_id,
                        "alert escalated past SLA");
                    notify::enqueue(
                        pool,
                        &applied,
                        NotificationKind::Escalated,
                        format!(
                            "unacknowledged past SLA (escalation {}): {}",
                            applied.escalation_count, applied.message
                        ),
                    )
                    .await;
                    Ok(true)
                }
            }
        }) as OpFuture<'_, bool>
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskBucket;

    fn base_alert(state: AlertState, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            mentor_id: Some(Uuid::new_v4()),
            severity: Severity::High,
            message: "initial message".to_string(),
            state,
            note: None,
            created_at,
            acknowledged_at: None,
            resolved_at: None,
            last_escalated_at: None,
            escalation_count: 0,
            needs_admin_review: false,
            version: 0,
        }
    }

    fn prediction_for(alert: &Alert, score: i32, bucket: RiskBucket) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            student_id: alert.student_id,
            score,
            bucket,
            factors: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn acknowledge_new_sets_timestamp() {
        let now = Utc::now();
        let alert = base_alert(AlertState::New, now - Duration::hours(1));
        match decide_acknowledge(&alert, now).unwrap() {
            AckDecision::Acknowledge(next) => {
                assert_eq!(next.state, AlertState::Acknowledged);
                assert_eq!(next.acknowledged_at, Some(now));
            }
            other => panic!("expected acknowledge, got {other:?}"),
        }
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let alert = base_alert(AlertState::Acknowledged, Utc::now());
        assert!(matches!(
            decide_acknowledge(&alert, Utc::now()).unwrap(),
            AckDecision::AlreadyAcknowledged
        ));
    }

    #[test]
    fn acknowledge_resolved_is_invalid() {
        let alert = base_alert(AlertState::Resolved, Utc::now());
        assert!(matches!(
            decide_acknowledge(&alert, Utc::now()),
            Err(AlertError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn resolve_works_from_both_open_states() {
        let now = Utc::now();
        for state in [AlertState::New, AlertState::Acknowledged] {
            let alert = base_alert(state, now - Duration::hours(2));
            let next = decide_resolve(&alert, now).unwrap();
            assert_eq!(next.state, AlertState::Resolved);
            assert_eq!(next.resolved_at, Some(now));
        }
    }

    #[test]
    fn resolve_resolved_is_invalid() {
        let alert = base_alert(AlertState::Resolved, Utc::now());
        assert!(matches!(
            decide_resolve(&alert, Utc::now()),
            Err(AlertError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn acknowledged_at_never_exceeds_resolved_at() {
        let t0 = Utc::now();
        let alert = base_alert(AlertState::New, t0);
        let acked = match decide_acknowledge(&alert, t0 + Duration::hours(1)).unwrap() {
            AckDecision::Acknowledge(next) => next,
            other => panic!("expected acknowledge, got {other:?}"),
        };
        let resolved = decide_resolve(&acked, t0 + Duration::hours(3)).unwrap();
        assert!(resolved.acknowledged_at.unwrap() <= resolved.resolved_at.unwrap());
    }

    #[test]
    fn merge_keeps_high_severity_sticky() {
        let mut alert = base_alert(AlertState::New, Utc::now());
        alert.severity = Severity::High;
        let prediction = prediction_for(&alert, 5, RiskBucket::Moderate);
        let merged = merge_into_open(&alert, &prediction, "updated".to_string());
        assert_eq!(merged.severity, Severity::High);
        assert_eq!(merged.message, "updated");
        assert_eq!(merged.created_at, alert.created_at);
    }

    #[test]
    fn merge_upgrades_moderate_to_high() {
        let mut alert = base_alert(AlertState::New, Utc::now());
        alert.severity = Severity::Moderate;
        let prediction = prediction_for(&alert, 9, RiskBucket::High);
        let merged = merge_into_open(&alert, &prediction, "worse".to_string());
        assert_eq!(merged.severity, Severity::High);
    }

    #[test]
    fn escalation_requires_sla_breach() {
        let now = Utc::now();
        let sla = Duration::hours(24);
        let fresh = base_alert(AlertState::New, now - Duration::hours(23));
        assert!(!escalation_due(&fresh, sla, now));

        let stale = base_alert(AlertState::New, now - Duration::hours(25));
        assert!(escalation_due(&stale, sla, now));
    }

    #[test]
    fn acknowledged_alert_is_never_escalated() {
        let now = Utc::now();
        let alert = base_alert(AlertState::Acknowledged, now - Duration::days(10));
        assert!(!escalation_due(&alert, Duration::hours(24), now));
        assert!(matches!(
            decide_escalation(&alert, Duration::hours(24), 3, now),
            EscalationDecision::Skip
        ));
    }

    #[test]
    fn escalation_is_idempotent_within_a_window() {
        let now = Utc::now();
        let sla = Duration::hours(24);
        let alert = base_alert(AlertState::New, now - Duration::hours(25));

        let first = match decide_escalation(&alert, sla, 3, now) {
            EscalationDecision::Escalate(next) => next,
            other => panic!("expected escalation, got {other:?}"),
        };
        assert_eq!(first.escalation_count, 1);
        assert_eq!(first.last_escalated_at, Some(now));

        // A second sweep inside the same window skips.
        assert!(matches!(
            decide_escalation(&first, sla, 3, now + Duration::minutes(30)),
            EscalationDecision::Skip
        ));

        // Once the window has aged out it fires again.
        let later = now + Duration::hours(25);
        match decide_escalation(&first, sla, 3, later) {
            EscalationDecision::Escalate(next) => assert_eq!(next.escalation_count, 2),
            other => panic!("expected second escalation, got {other:?}"),
        }
    }

    #[test]
    fn escalation_cap_parks_for_admin() {
        let now = Utc::now();
        let sla = Duration::hours(24);
        let mut alert = base_alert(AlertState::New, now - Duration::days(10));
        alert.escalation_count = 3;

        let parked = match decide_escalation(&alert, sla, 3, now) {
            EscalationDecision::ParkForAdmin(next) => next,
            other => panic!("expected park, got {other:?}"),
        };
        assert!(parked.needs_admin_review);
        assert_eq!(parked.escalation_count, 3);

        // Parked alerts are never touched again by the sweep.
        assert!(matches!(
            decide_escalation(&parked, sla, 3, now + Duration::days(2)),
            EscalationDecision::Skip
        ));
    }

    // The end-to-end scenario from the design: high prediction at T0, a
    // moderate follow-up an hour later, sweep at T0+25h, acknowledgement at
    // T0+26h.
    #[test]
    fn lifecycle_scenario_follows_the_sla_clock() {
        let t0 = Utc::now();
        let sla = Duration::hours(24);
        let mut alert = base_alert(AlertState::New, t0);
        alert.severity = Severity::High;

        // T0+1h: moderate reading merges, severity stays high, clock intact.
        let moderate = prediction_for(&alert, 5, RiskBucket::Moderate);
        alert = merge_into_open(&alert, &moderate, "moderate follow-up".to_string());
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.created_at, t0);

        // T0+25h: sweep escalates exactly once.
        let sweep_at = t0 + Duration::hours(25);
        alert = match decide_escalation(&alert, sla, 3, sweep_at) {
            EscalationDecision::Escalate(next) => next,
            other => panic!("expected escalation, got {other:?}"),
        };
        assert_eq!(alert.escalation_count, 1);

        // T0+26h: mentor acknowledges; no sweep ever fires again.
        let ack_at = t0 + Duration::hours(26);
        alert = match decide_acknowledge(&alert, ack_at).unwrap() {
            AckDecision::Acknowledge(next) => next,
            other => panic!("expected acknowledge, got {other:?}"),
        };
        assert!(matches!(
            decide_escalation(&alert, sla, 3, t0 + Duration::days(30)),
            EscalationDecision::Skip
        ));
    }

    // The conflict classification in classify_insert_error matches on the
    // index by name, so the constant and the schema must not drift apart.
    #[test]
    fn open_alert_index_matches_the_schema() {
        let schema = include_str!("../migrations/0001_schema.sql");
        let stanza = schema
            .split(';')
            .find(|stmt| stmt.contains(OPEN_ALERT_INDEX))
            .expect("schema must define the open-alert index");
        assert!(stanza.contains("CREATE UNIQUE INDEX"));
        assert!(stanza.contains("ON risk_alerts.alerts (student_id)"));
        assert!(stanza.contains("WHERE state IN ('new', 'acknowledged')"));
    }

    // Store-enforced invariants below need a live Postgres; each test skips
    // itself when DATABASE_URL is unset. Rows use fresh uuids so reruns
    // against a shared database stay isolated.

    use crate::models::RiskFactor;
    use sqlx::postgres::PgPoolOptions;

    async fn store_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("./migrations").run(&pool).await.ok()?;
        Some(pool)
    }

    fn store_config() -> Config {
        Config {
            database_url: String::new(),
            sla_window: Duration::hours(24),
            sweep_interval: StdDuration::from_secs(3600),
            max_escalations: 3,
            retry_attempts: 3,
            retry_base_delay: StdDuration::from_millis(10),
            max_delivery_attempts: 5,
            reassign_policy: ReassignPolicy::LeastLoaded,
            evaluation_window_days: 30,
        }
    }

    async fn insert_student(pool: &PgPool) -> Student {
        let student = Student {
            id: Uuid::new_v4(),
            scholar_id: format!("GS-TEST-{}", Uuid::new_v4()),
            full_name: "Avery Lee".to_string(),
            email: format!("{}@example.com", Uuid::new_v4()),
            cohort: format!("cohort-{}", Uuid::new_v4()),
            mentor_id: None,
            status: StudentStatus::Active,
            latest_risk_score: None,
        };
        sqlx::query(
            r#"
            INSERT INTO risk_alerts.students (id, scholar_id, full_name, email, cohort)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(student.id)
        .bind(&student.scholar_id)
        .bind(&student.full_name)
        .bind(&student.email)
        .bind(&student.cohort)
        .execute(pool)
        .await
        .unwrap();
        student
    }

    fn student_prediction(student: &Student, score: i32, bucket: RiskBucket) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            student_id: student.id,
            score,
            bucket,
            factors: vec![RiskFactor {
                name: "low_attendance".to_string(),
                contribution: 2.0,
            }],
            evaluated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_prediction_merges_into_the_open_alert() {
        let Some(pool) = store_pool().await else { return };
        let cfg = store_config();
        let student = insert_student(&pool).await;

        let high = student_prediction(&student, 9, RiskBucket::High);
        let created = match create_or_update_alert(&pool, &cfg, &student, &high)
            .await
            .unwrap()
        {
            AlertOutcome::Created(alert) => alert,
            other => panic!("expected created, got {other:?}"),
        };

        let moderate = student_prediction(&student, 5, RiskBucket::Moderate);
        let updated = match create_or_update_alert(&pool, &cfg, &student, &moderate)
            .await
            .unwrap()
        {
            AlertOutcome::Updated(alert) => alert,
            other => panic!("expected updated, got {other:?}"),
        };

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.severity, Severity::High);
        // Postgres stores microseconds; allow the truncation.
        let clock_drift = (updated.created_at - created.created_at)
            .num_microseconds()
            .unwrap()
            .abs();
        assert!(clock_drift <= 1, "SLA clock moved by {clock_drift}us");

        let open: i64 = sqlx::query(
            "SELECT COUNT(*) AS open FROM risk_alerts.alerts \
             WHERE student_id = $1 AND state IN ('new', 'acknowledged')",
        )
        .bind(student.id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("open");
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn losing_the_open_insert_race_is_a_conflict() {
        let Some(pool) = store_pool().await else { return };
        let student = insert_student(&pool).await;

        let mut first = base_alert(AlertState::New, Utc::now());
        first.student_id = student.id;
        first.mentor_id = None;
        insert_alert(&pool, &first).await.unwrap();

        let mut second = base_alert(AlertState::New, Utc::now());
        second.student_id = student.id;
        second.mentor_id = None;
        let err = insert_alert(&pool, &second).await.unwrap_err();
        assert!(
            matches!(err, AlertError::PersistenceConflict),
            "expected conflict, got {err:?}"
        );
    }

    #[tokio::test]
    async fn sweep_summary_counts_each_breach_once_per_window() {
        let Some(pool) = store_pool().await else { return };
        let cfg = store_config();
        let student = insert_student(&pool).await;

        let mut alert = base_alert(AlertState::New, Utc::now() - Duration::hours(30));
        alert.student_id = student.id;
        alert.mentor_id = None;
        insert_alert(&pool, &alert).await.unwrap();

        let now = Utc::now();
        let summary = sweep_escalations(&pool, &cfg, now).await.unwrap();
        // A shared database may hold other breached alerts, so assert on ours.
        assert!(summary.escalated >= 1);
        assert_eq!(summary.failed, 0);
        let after = fetch_alert(&pool, alert.id).await.unwrap();
        assert_eq!(after.escalation_count, 1);
        assert!(after.last_escalated_at.is_some());

        sweep_escalations(&pool, &cfg, now + Duration::minutes(5))
            .await
            .unwrap();
        let after_again = fetch_alert(&pool, alert.id).await.unwrap();
        assert_eq!(after_again.escalation_count, 1);
    }
}
