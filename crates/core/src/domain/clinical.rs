use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RiskFlagId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn requires_notification(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub id: RiskFlagId,
    pub patient_id: UserId,
    pub risk_type: String,
    pub severity: RiskSeverity,
    pub evidence: String,
    pub session_id: Option<String>,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub patient_id: UserId,
    pub therapist_id: UserId,
    pub reason: String,
    pub urgency: String,
    pub notification_status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientMemory {
    pub id: String,
    pub patient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub patient_id: UserId,
    pub title: String,
    pub progress: u8,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_MEMORY_TOP_K: usize = 5;

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Set-cosine overlap of the words (3+ chars) in `query` and `content`.
pub fn lexical_similarity(query: &str, content: &str) -> f64 {
    let query_terms = terms(query);
    let content_terms = terms(content);
    if query_terms.is_empty() || content_terms.is_empty() {
        return 0.0;
    }
    let shared = query_terms.intersection(&content_terms).count() as f64;
    shared / ((query_terms.len() * content_terms.len()) as f64).sqrt()
}

/// Best `k` memories for `query`; zero-score memories are dropped and ties go
/// to the most recent entry.
pub fn rank_memories(query: &str, memories: Vec<PatientMemory>, k: usize) -> Vec<PatientMemory> {
    let mut scored: Vec<(f64, PatientMemory)> = memories
        .into_iter()
        .map(|memory| (lexical_similarity(query, &memory.content), memory))
        .filter(|(score, _)| *score > 0.0)
        .collect();
    scored.sort_by(|(left_score, left), (right_score, right)| {
        right_score
            .partial_cmp(left_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| right.created_at.cmp(&left.created_at))
    });
    scored.into_iter().take(k).map(|(_, memory)| memory).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{lexical_similarity, rank_memories, NotificationStatus, PatientMemory, RiskSeverity};
    use crate::domain::identity::UserId;

    fn memory(id: &str, content: &str, age_minutes: i64) -> PatientMemory {
        PatientMemory {
            id: id.to_owned(),
            patient_id: UserId::from("patient-1"),
            content: content.to_owned(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn similarity_ignores_case_and_short_words() {
        assert!(lexical_similarity("Panic at WORK", "work panic attacks") > 0.5);
        assert_eq!(lexical_similarity("at a", "at a"), 0.0);
        assert_eq!(lexical_similarity("sleep", "exercise"), 0.0);
    }

    #[test]
    fn ranking_keeps_top_k_relevant_memories() {
        let memories = vec![
            memory("m1", "Struggles with sleep before exams", 30),
            memory("m2", "Enjoys hiking on weekends", 20),
            memory("m3", "Sleep improved after routine change", 10),
            memory("m4", "Sleep sleep sleep exams stress", 5),
        ];

        let ranked = rank_memories("trouble with sleep and exams", memories, 2);
        let ids: Vec<&str> = ranked.iter().map(|memory| memory.id.as_str()).collect();

        assert_eq!(ranked.len(), 2);
        assert!(!ids.contains(&"m2"));
        assert!(ids.contains(&"m1"));
    }


    #[test]
    fn only_critical_risk_triggers_notification() {
        assert!(RiskSeverity::Critical.requires_notification());
        assert!(!RiskSeverity::High.requires_notification());
        assert!(RiskSeverity::Critical > RiskSeverity::Low);
    }

    #[test]
    fn storage_encodings_round_trip() {
        for severity in
            [RiskSeverity::Low, RiskSeverity::Medium, RiskSeverity::High, RiskSeverity::Critical]
        {
            assert_eq!(RiskSeverity::parse(severity.as_str()), Some(severity));
        }
        for status in
            [NotificationStatus::Pending, NotificationStatus::Sent, NotificationStatus::Failed]
        {
            assert_eq!(NotificationStatus::parse(status.as_str()), Some(status));
        }
    }
}
