use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::ConversationId;
use crate::domain::intent::AgentIntent;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }
}

/// USD price per one million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub prompt_per_million: Decimal,
    pub completion_per_million: Decimal,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            prompt_per_million: Decimal::new(250, 2),
            completion_per_million: Decimal::new(1000, 2),
        }
    }
}

impl ModelPricing {
    pub fn cost(&self, usage: &TokenUsage) -> Decimal {
        let million = Decimal::from(1_000_000u32);
        let prompt = Decimal::from(usage.prompt_tokens) * self.prompt_per_million / million;
        let completion =
            Decimal::from(usage.completion_tokens) * self.completion_per_million / million;
        (prompt + completion).round_dp(6)
    }
}

/// Append-only audit row written once per orchestrator invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: ExecutionId,
    pub conversation_id: ConversationId,
    pub agent_type: AgentIntent,
    pub tool_calls: Value,
    pub tokens_used: u32,
    pub cost_usd: Decimal,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
