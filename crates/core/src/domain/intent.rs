use serde::{Deserialize, Serialize};

/// Fixed catalogue of agent intents a user message can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentIntent {
    Booking,
    Session,
    Insights,
    Followup,
    General,
}

impl AgentIntent {
    pub const ALL: [AgentIntent; 5] =
        [Self::Booking, Self::Session, Self::Insights, Self::Followup, Self::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Session => "session",
            Self::Insights => "insights",
            Self::Followup => "followup",
            Self::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "booking" => Some(Self::Booking),
            "session" => Some(Self::Session),
            "insights" => Some(Self::Insights),
            "followup" | "follow_up" | "follow-up" => Some(Self::Followup),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Llm,
    Fallback,
    Explicit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: AgentIntent,
    /// 0..=100
    pub confidence: u8,
    pub reasoning: Vec<String>,
    pub source: ClassificationSource,
}

#[cfg(test)]
mod tests {
    use super::AgentIntent;

    #[test]
    fn intent_names_round_trip() {
        for intent in AgentIntent::ALL {
            assert_eq!(AgentIntent::parse(intent.as_str()), Some(intent));
        }
        assert_eq!(AgentIntent::parse("Follow-Up"), Some(AgentIntent::Followup));
        assert_eq!(AgentIntent::parse("billing"), None);
    }
}
