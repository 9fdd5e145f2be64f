use chrono::{Duration, NaiveDate, Utc};

use crate::models::{PerformanceRecord, RiskBucket, RiskFactor};

/// Aggregated view of a student's recent performance, the input to the
/// scorer. Attendance is a 0..1 rate, scores are on a 0..100 scale.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    pub attendance_rate: f64,
    pub avg_assignment_score: f64,
    pub engagement_score: f64,
    /// Composite of the last seven days minus the window mean; negative
    /// means the student is trending down.
    pub recent_trend: f64,
}

const WEIGHT_ATTENDANCE: f64 = 0.35;
const WEIGHT_ASSIGNMENTS: f64 = 0.30;
const WEIGHT_ENGAGEMENT: f64 = 0.20;
const WEIGHT_TREND: f64 = 0.15;

pub fn cutoff_date(since_days: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(since_days.max(1))
}

/// Collapse a window of performance records into one feature vector.
/// Returns None when the student has no records in the window.
pub fn build_features(records: &[PerformanceRecord], today: NaiveDate) -> Option<FeatureVector> {
    if records.is_empty() {
        return None;
    }

    let mut attendance = 0.0;
    let mut assignments = 0.0;
    let mut engagement = 0.0;
    let mut recent_composite = 0.0;
    let mut recent_count = 0usize;
    let mut window_composite = 0.0;

    let recent_cutoff = today - Duration::days(7);
    for record in records {
        attendance += record.attendance_rate;
        assignments += record.avg_assignment_score;
        engagement += record.engagement_score;

        let composite = composite_of(record);
        window_composite += composite;
        if record.recorded_on >= recent_cutoff {
            recent_composite += composite;
            recent_count += 1;
        }
    }

    let n = records.len() as f64;
    let window_mean = window_composite / n;
    let recent_trend = if recent_count == 0 {
        0.0
    } else {
        recent_composite / recent_count as f64 - window_mean
    };

    Some(FeatureVector {
        attendance_rate: attendance / n,
        avg_assignment_score: assignments / n,
        engagement_score: engagement / n,
        recent_trend,
    })
}

fn composite_of(record: &PerformanceRecord) -> f64 {
    (record.attendance_rate * 100.0 + record.avg_assignment_score + record.engagement_score) / 3.0
}

/// Map a feature vector to a 1..=10 risk score, a bucket, and the ranked
/// list of contributing factors (largest contribution first).
pub fn score_features(features: &FeatureVector) -> (i32, RiskBucket, Vec<RiskFactor>) {
    let attendance_deficit = (1.0 - features.attendance_rate).clamp(0.0, 1.0) * 10.0;
    let assignment_deficit = (1.0 - features.avg_assignment_score / 100.0).clamp(0.0, 1.0) * 10.0;
    let engagement_deficit = (1.0 - features.engagement_score / 100.0).clamp(0.0, 1.0) * 10.0;
    let decline = (-features.recent_trend / 10.0).clamp(0.0, 1.0) * 10.0;

    let mut factors = vec![
        RiskFactor {
            name: "low_attendance".to_string(),
            contribution: attendance_deficit * WEIGHT_ATTENDANCE,
        },
        RiskFactor {
            name: "weak_assignments".to_string(),
            contribution: assignment_deficit * WEIGHT_ASSIGNMENTS,
        },
        RiskFactor {
            name: "low_engagement".to_string(),
            contribution: engagement_deficit * WEIGHT_ENGAGEMENT,
        },
        RiskFactor {
            name: "declining_trend".to_string(),
            contribution: decline * WEIGHT_TREND,
        },
    ];
    factors.sort_by(|a, b| {
        b.contribution
            .partial_cmp(&a.contribution)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let raw: f64 = factors.iter().map(|f| f.contribution).sum();
    let score = (raw.round() as i32).clamp(1, 10);
    (score, bucket_for(score), factors)
}

pub fn bucket_for(score: i32) -> RiskBucket {
    match score {
        i32::MIN..=3 => RiskBucket::Low,
        4..=6 => RiskBucket::Moderate,
        _ => RiskBucket::High,
    }
}
