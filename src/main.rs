use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod lifecycle;
mod models;
mod notify;
mod risk;

use config::Config;
use models::{Alert, AlertFilter, AlertState, Prediction};

#[derive(Parser)]
#[command(name = "dropout-risk-alerts")]
#[command(about = "Dropout risk alert lifecycle and mentor SLA escalation tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import performance snapshots from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score risk for students and feed predictions into the alert lifecycle
    #[command(group(
        ArgGroup::new("scope")
            .args(["cohort", "student"])
            .multiple(false)
    ))]
    Evaluate {
        #[arg(long)]
        cohort: Option<String>,
        /// Scholar id of a single student
        #[arg(long)]
        student: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
    },
    /// List alerts, newest first
    Alerts {
        /// new, acknowledged or resolved
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        mentor: Option<Uuid>,
        /// Scholar id
        #[arg(long)]
        student: Option<String>,
    },
    /// Acknowledge an alert as its mentor
    Ack {
        #[arg(long)]
        alert: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Resolve an alert
    Resolve {
        #[arg(long)]
        alert: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Run one SLA escalation pass
    Sweep,
    /// Run the escalation sweep on a fixed interval until interrupted
    Watch {
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Deliver pending notifications from the outbox
    Deliver,
    /// Alert counts by state and average response time
    Stats {
        #[arg(long)]
        mentor: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} performance records from {}.", csv.display());
        }
        Commands::Evaluate {
            cohort,
            student,
            since_days,
        } => {
            evaluate(&pool, &cfg, cohort.as_deref(), student.as_deref(), since_days).await?;
        }
        Commands::Alerts {
            status,
            mentor,
            student,
        } => {
            let filter = AlertFilter {
                state: status.as_deref().map(parse_state).transpose()?,
                mentor_id: mentor,
                student_id: match student.as_deref() {
                    Some(scholar_id) => Some(resolve_student(&pool, scholar_id).await?),
                    None => None,
                },
            };
            let alerts = db::list_alerts(&pool, &filter).await?;
            if alerts.is_empty() {
                println!("No alerts match this filter.");
            }
            for alert in &alerts {
                print_alert(alert);
            }
        }
        Commands::Ack { alert, note } => {
            let updated = lifecycle::acknowledge_alert(&pool, &cfg, alert, note).await?;
            println!("Alert {} is {}.", updated.id, updated.state);
        }
        Commands::Resolve { alert, note } => {
            let updated = lifecycle::resolve_alert(&pool, &cfg, alert, note).await?;
            println!("Alert {} is {}.", updated.id, updated.state);
        }
        Commands::Sweep => {
            let summary = lifecycle::sweep_escalations(&pool, &cfg, Utc::now()).await?;
            let delivered = notify::deliver_pending(&pool, &cfg, &notify::LogDispatcher).await?;
            println!(
                "Escalated {} alerts, delivered {delivered} notifications.",
                summary.escalated
            );
            anyhow::ensure!(
                summary.failed == 0,
                "{} alerts failed to escalate and will be retried next sweep",
                summary.failed
            );
        }
        Commands::Watch { interval_secs } => {
            let interval = interval_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(cfg.sweep_interval);
            watch(&pool, &cfg, interval).await?;
        }
        Commands::Deliver => {
            let delivered = notify::deliver_pending(&pool, &cfg, &notify::LogDispatcher).await?;
            println!("Delivered {delivered} notifications.");
        }
        Commands::Stats { mentor } => {
            let stats = db::alert_stats(&pool, mentor).await?;
            println!("Total alerts: {}", stats.total);
            println!("  new:          {}", stats.new);
            println!("  acknowledged: {}", stats.acknowledged);
            println!("  resolved:     {}", stats.resolved);
            println!("  admin review: {}", stats.needs_admin_review);
            match stats.avg_response_hours {
                Some(hours) => println!("Average response time: {hours:.1}h"),
                None => println!("Average response time: n/a"),
            }
        }
    }

    Ok(())
}

async fn evaluate(
    pool: &PgPool,
    cfg: &Config,
    cohort: Option<&str>,
    scholar_id: Option<&str>,
    since_days: i64,
) -> anyhow::Result<()> {
    let students = db::fetch_students(pool, cohort, scholar_id).await?;
    if students.is_empty() {
        println!("No students in scope.");
        return Ok(());
    }

    let since_date = risk::cutoff_date(since_days);
    let today = Utc::now().date_naive();
    let mut evaluated = 0usize;
    let mut alerts_touched = 0usize;
    let mut failures = 0usize;

    for student in &students {
        let records = db::fetch_performance(pool, student.id, since_date).await?;
        let Some(features) = risk::build_features(&records, today) else {
            println!("- {} ({}): no performance data in window", student.full_name, student.scholar_id);
            continue;
        };

        let (score, bucket, factors) = risk::score_features(&features);
        let prediction = Prediction {
            id: Uuid::new_v4(),
            student_id: student.id,
            score,
            bucket,
            factors,
            evaluated_at: Utc::now(),
        };
        db::insert_prediction(pool, &prediction).await?;
        db::cache_student_risk(pool, student.id, score).await?;
        evaluated += 1;

        match lifecycle::create_or_update_alert(pool, cfg, student, &prediction).await {
            Ok(outcome) => {
                let label = match outcome {
                    lifecycle::AlertOutcome::Created(_) => {
                        alerts_touched += 1;
                        "alert created"
                    }
                    lifecycle::AlertOutcome::Updated(_) => {
                        alerts_touched += 1;
                        "alert updated"
                    }
                    lifecycle::AlertOutcome::Unchanged(_) => "alert unchanged",
                    lifecycle::AlertOutcome::Skipped => "no alert",
                };
                println!(
                    "- {} ({}): score {score}/10 {} -> {label}",
                    student.full_name,
                    student.scholar_id,
                    prediction.bucket.as_str()
                );
            }
            Err(err) => {
                error!(student = %student.scholar_id, error = %err,
                    "failed to apply prediction to alert lifecycle");
                failures += 1;
            }
        }
    }

    println!("Evaluated {evaluated} students, {alerts_touched} alerts created or updated.");
    anyhow::ensure!(failures == 0, "{failures} students failed alert processing");
    Ok(())
}

async fn watch(pool: &PgPool, cfg: &Config, interval: std::time::Duration) -> anyhow::Result<()> {
    info!(?interval, "starting escalation watch loop");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match lifecycle::sweep_escalations(pool, cfg, Utc::now()).await {
                    Ok(summary) if summary.failed > 0 => {
                        error!(escalated = summary.escalated, failed = summary.failed,
                            "sweep dropped alerts; retrying next pass");
                    }
                    Ok(summary) => {
                        if summary.escalated > 0 {
                            info!(escalated = summary.escalated, "sweep escalated alerts");
                        }
                    }
                    Err(err) => error!(error = %err, "escalation sweep failed"),
                }
                if let Err(err) = notify::deliver_pending(pool, cfg, &notify::LogDispatcher).await {
                    error!(error = %err, "notification delivery failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("watch loop interrupted, exiting");
                return Ok(());
            }
        }
    }
}

fn parse_state(value: &str) -> anyhow::Result<AlertState> {
    match value {
        "new" => Ok(AlertState::New),
        "acknowledged" => Ok(AlertState::Acknowledged),
        "resolved" => Ok(AlertState::Resolved),
        other => anyhow::bail!("unknown alert status {other:?}"),
    }
}

async fn resolve_student(pool: &PgPool, scholar_id: &str) -> anyhow::Result<Uuid> {
    let students = db::fetch_students(pool, None, Some(scholar_id)).await?;
    students
        .first()
        .map(|s| s.id)
        .with_context(|| format!("no student with scholar id {scholar_id}"))
}

fn print_alert(alert: &Alert) {
    println!(
        "- {} [{} / {}] student={} mentor={} created={} escalations={}{}",
        alert.id,
        alert.state,
        alert.severity.as_str(),
        alert.student_id,
        alert
            .mentor_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unassigned".to_string()),
        alert.created_at.format("%Y-%m-%d %H:%M"),
        alert.escalation_count,
        if alert.needs_admin_review {
            " [admin review]"
        } else {
            ""
        }
    );
}
