use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Alert, Notification, NotificationKind};

/// Delivery channel for outbox rows. The production channel is email/push;
/// the binary wires in [`LogDispatcher`].
pub trait Dispatcher {
    fn dispatch(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes each notice to the structured log.
pub struct LogDispatcher;

impl Dispatcher for LogDispatcher {
    fn dispatch(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            alert_id = %notification.alert_id,
            mentor_id = ?notification.mentor_id,
            kind = notification.kind.as_str(),
            "dispatching notification: {}",
            notification.body
        );
        Ok(())
    }
}

/// Best-effort enqueue, called after a committed state transition. A failure
/// here is logged and swallowed: notification is at-least-once via the
/// outbox, and must never undo the transition it follows.
pub async fn enqueue(pool: &PgPool, alert: &Alert, kind: NotificationKind, body: String) {
    if let Err(err) = try_enqueue(pool, alert, kind, &body).await {
        warn!(
            alert_id = %alert.id,
            kind = kind.as_str(),
            error = %err,
            "failed to enqueue notification"
        );
    }
}

async fn try_enqueue(
    pool: &PgPool,
    alert: &Alert,
    kind: NotificationKind,
    body: &str,
) -> sqlx::Result<()> {
    // Admin-review notices carry no mentor: the admin queue reads them by kind.
    let mentor_id = match kind {
        NotificationKind::AdminReview => None,
        _ => alert.mentor_id,
    };

    sqlx::query(
        r#"
        INSERT INTO risk_alerts.notifications
        (id, alert_id, mentor_id, kind, body, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(alert.id)
    .bind(mentor_id)
    .bind(kind)
    .bind(body)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Drain pending outbox rows through the dispatcher. At-least-once: a row is
/// only marked sent after a successful dispatch, and a row that keeps failing
/// is parked as failed once it exhausts its attempts.
pub async fn deliver_pending(
    pool: &PgPool,
    cfg: &Config,
    dispatcher: &dyn Dispatcher,
) -> anyhow::Result<usize> {
    let pending = sqlx::query_as::<_, Notification>(
        r#"
        SELECT id, alert_id, mentor_id, kind, body, attempts
        FROM risk_alerts.notifications
        WHERE state = 'pending'
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut delivered = 0usize;
    for notification in &pending {
        match dispatcher.dispatch(notification) {
            Ok(()) => {
                sqlx::query(
                    r#"
                    UPDATE risk_alerts.notifications
                    SET state = 'sent', sent_at = $2, attempts = attempts + 1
                    WHERE id = $1
                    "#,
                )
                .bind(notification.id)
                .bind(Utc::now())
                .execute(pool)
                .await?;
                delivered += 1;
            }
            Err(err) => {
                let exhausted = notification.attempts + 1 >= cfg.max_delivery_attempts;
                warn!(
                    notification_id = %notification.id,
                    attempts = notification.attempts + 1,
                    exhausted,
                    error = %err,
                    "notification delivery failed"
                );
                sqlx::query(
                    r#"
                    UPDATE risk_alerts.notifications
                    SET attempts = attempts + 1,
                        state = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE 'pending' END
                    WHERE id = $1
                    "#,
                )
                .bind(notification.id)
                .bind(cfg.max_delivery_attempts)
                .execute(pool)
                .await?;
            }
        }
    }

    Ok(delivered)
}
