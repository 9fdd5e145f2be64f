use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    Alert, AlertFilter, AlertStats, PerformanceRecord, Prediction, Student,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let mentors = vec![
        (
            Uuid::parse_str("7a6f0f0f-52cb-4b1d-9a2f-0d3c8e9b1a01")?,
            "Priya Ramanathan",
            "priya.ramanathan@groupscholar.com",
            "2026",
            true,
        ),
        (
            Uuid::parse_str("2b1c3d4e-66aa-4f0b-8c1d-5e6f7a8b9c02")?,
            "Tomas Okafor",
            "tomas.okafor@groupscholar.com",
            "2026",
            false,
        ),
        (
            Uuid::parse_str("9c8b7a6d-11ee-4d2c-b3a4-f5e6d7c8b903")?,
            "Mina Kowalska",
            "mina.kowalska@groupscholar.com",
            "2025",
            false,
        ),
    ];

    for (id, name, email, cohort, is_admin) in mentors {
        sqlx::query(
            r#"
            INSERT INTO risk_alerts.mentors (id, full_name, email, cohort, is_admin)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, cohort = EXCLUDED.cohort
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(cohort)
        .bind(is_admin)
        .execute(pool)
        .await?;
    }

    let students = vec![
        (
            "GS-2026-0117",
            "Avery Lee",
            "avery.lee@groupscholar.com",
            "2026",
            Some(Uuid::parse_str("7a6f0f0f-52cb-4b1d-9a2f-0d3c8e9b1a01")?),
        ),
        (
            "GS-2025-0042",
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
            "2025",
            Some(Uuid::parse_str("9c8b7a6d-11ee-4d2c-b3a4-f5e6d7c8b903")?),
        ),
        (
            "GS-2026-0203",
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
            "2026",
            None,
        ),
    ];

    for (scholar_id, name, email, cohort, mentor_id) in students {
        sqlx::query(
            r#"
            INSERT INTO risk_alerts.students (id, scholar_id, full_name, email, cohort, mentor_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scholar_id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                cohort = EXCLUDED.cohort,
                mentor_id = EXCLUDED.mentor_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scholar_id)
        .bind(name)
        .bind(email)
        .bind(cohort)
        .bind(mentor_id)
        .execute(pool)
        .await?;
    }

    let today = Utc::now().date_naive();
    let snapshots = vec![
        ("GS-2026-0117", 2i64, 0.55, 48.0, 30.0),
        ("GS-2026-0117", 9, 0.70, 55.0, 42.0),
        ("GS-2025-0042", 3, 0.92, 81.0, 74.0),
        ("GS-2026-0203", 1, 0.40, 35.0, 22.0),
        ("GS-2026-0203", 8, 0.62, 50.0, 38.0),
    ];

    for (scholar_id, days_ago, attendance, score, engagement) in snapshots {
        let recorded_on = today - Duration::days(days_ago);
        let student_id: Uuid =
            sqlx::query("SELECT id FROM risk_alerts.students WHERE scholar_id = $1")
                .bind(scholar_id)
                .fetch_one(pool)
                .await?
                .get("id");

        sqlx::query(
            r#"
            INSERT INTO risk_alerts.performance_records
            (id, student_id, recorded_on, attendance_rate, avg_assignment_score,
             engagement_score, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(recorded_on)
        .bind(attendance)
        .bind(score)
        .bind(engagement)
        .bind(format!("seed-{scholar_id}-{recorded_on}"))
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        scholar_id: String,
        full_name: String,
        email: String,
        cohort: String,
        recorded_on: NaiveDate,
        attendance_rate: f64,
        avg_assignment_score: f64,
        engagement_score: f64,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO risk_alerts.students (id, scholar_id, full_name, email, cohort)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (scholar_id) DO UPDATE
            SET full_name = EXCLUDED.full_name, cohort = EXCLUDED.cohort
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.scholar_id)
        .bind(&row.full_name)
        .bind(&row.email)
        .bind(&row.cohort)
        .fetch_one(pool)
        .await?
        .get("id");

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO risk_alerts.performance_records
            (id, student_id, recorded_on, attendance_rate, avg_assignment_score,
             engagement_score, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(row.recorded_on)
        .bind(row.attendance_rate)
        .bind(row.avg_assignment_score)
        .bind(row.engagement_score)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn student_query(by_cohort: bool, by_scholar_id: bool) -> String {
    let mut query = String::from(
        "SELECT id, scholar_id, full_name, email, cohort, mentor_id, status, latest_risk_score \
         FROM risk_alerts.students WHERE TRUE",
    );

    let mut arg = 0usize;
    if by_cohort {
        arg += 1;
        query.push_str(&format!(" AND cohort = ${arg}"));
    }
    if by_scholar_id {
        arg += 1;
        query.push_str(&format!(" AND scholar_id = ${arg}"));
    }
    query.push_str(" ORDER BY scholar_id");
    query
}

/// Both filters combine with AND when given together.
pub async fn fetch_students(
    pool: &PgPool,
    cohort: Option<&str>,
    scholar_id: Option<&str>,
) -> anyhow::Result<Vec<Student>> {
    let query = student_query(cohort.is_some(), scholar_id.is_some());

    let mut rows = sqlx::query_as::<_, Student>(&query);
    if let Some(value) = cohort {
        rows = rows.bind(value);
    }
    if let Some(value) = scholar_id {
        rows = rows.bind(value);
    }

    Ok(rows.fetch_all(pool).await?)
}

pub async fn fetch_performance(
    pool: &PgPool,
    student_id: Uuid,
    since_date: NaiveDate,
) -> anyhow::Result<Vec<PerformanceRecord>> {
    let records = sqlx::query_as::<_, PerformanceRecord>(
        r#"
        SELECT student_id, recorded_on, attendance_rate, avg_assignment_score, engagement_score
        FROM risk_alerts.performance_records
        WHERE student_id = $1 AND recorded_on >= $2
        ORDER BY recorded_on
        "#,
    )
    .bind(student_id)
    .bind(since_date)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn insert_prediction(pool: &PgPool, prediction: &Prediction) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO risk_alerts.predictions
        (id, student_id, score, bucket, factors, evaluated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (student_id, evaluated_at) DO NOTHING
        "#,
    )
    .bind(prediction.id)
    .bind(prediction.student_id)
    .bind(prediction.score)
    .bind(prediction.bucket)
    .bind(serde_json::to_value(&prediction.factors)?)
    .bind(prediction.evaluated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn cache_student_risk(pool: &PgPool, student_id: Uuid, score: i32) -> anyhow::Result<()> {
    sqlx::query("UPDATE risk_alerts.students SET latest_risk_score = $2 WHERE id = $1")
        .bind(student_id)
        .bind(score)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_alerts(pool: &PgPool, filter: &AlertFilter) -> anyhow::Result<Vec<Alert>> {
    let mut query = String::from(
        "SELECT id, student_id, mentor_id, severity, message, state, note, \
         created_at, acknowledged_at, resolved_at, last_escalated_at, \
         escalation_count, needs_admin_review, version \
         FROM risk_alerts.alerts WHERE TRUE",
    );

    let mut arg = 0usize;
    if filter.state.is_some() {
        arg += 1;
        query.push_str(&format!(" AND state = ${arg}"));
    }
    if filter.mentor_id.is_some() {
        arg += 1;
        query.push_str(&format!(" AND mentor_id = ${arg}"));
    }
    if filter.student_id.is_some() {
        arg += 1;
        query.push_str(&format!(" AND student_id = ${arg}"));
    }
    query.push_str(" ORDER BY created_at DESC");

    let mut rows = sqlx::query_as::<_, Alert>(&query);
    if let Some(state) = filter.state {
        rows = rows.bind(state);
    }
    if let Some(mentor_id) = filter.mentor_id {
        rows = rows.bind(mentor_id);
    }
    if let Some(student_id) = filter.student_id {
        rows = rows.bind(student_id);
    }

    Ok(rows.fetch_all(pool).await?)
}

pub async fn alert_stats(pool: &PgPool, mentor_id: Option<Uuid>) -> anyhow::Result<AlertStats> {
    let mut query = String::from(
        "SELECT COUNT(*) AS total, \
         COUNT(*) FILTER (WHERE state = 'new') AS \"new\", \
         COUNT(*) FILTER (WHERE state = 'acknowledged') AS acknowledged, \
         COUNT(*) FILTER (WHERE state = 'resolved') AS resolved, \
         COUNT(*) FILTER (WHERE needs_admin_review) AS needs_admin_review, \
         AVG(EXTRACT(EPOCH FROM (resolved_at - created_at)) / 3600.0)::double precision \
             AS avg_response_hours \
         FROM risk_alerts.alerts WHERE TRUE",
    );
    if mentor_id.is_some() {
        query.push_str(" AND mentor_id = $1");
    }

    let mut row = sqlx::query(&query);
    if let Some(mentor_id) = mentor_id {
        row = row.bind(mentor_id);
    }
    let row = row.fetch_one(pool).await?;

    Ok(AlertStats {
        total: row.get("total"),
        new: row.get("new"),
        acknowledged: row.get("acknowledged"),
        resolved: row.get("resolved"),
        needs_admin_review: row.get("needs_admin_review"),
        avg_response_hours: row.get("avg_response_hours"),
    })
}
