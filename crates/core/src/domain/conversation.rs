use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::identity::UserId;
use crate::domain::intent::AgentIntent;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner_id: UserId,
    /// Intent of the most recent turn, not a fixed category.
    pub agent_type: AgentIntent,
    pub messages: Vec<ConversationMessage>,
    pub context: Map<String, Value>,
    /// Zero until first persisted; bumped by every successful save.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn start(id: ConversationId, owner_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            agent_type: AgentIntent::General,
            messages: Vec::new(),
            context: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.owner_id == user_id
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// Appends the user message and the assistant reply as one turn and
    /// overwrites `agent_type` with this turn's intent.
    pub fn record_turn(
        &mut self,
        user_message: impl Into<String>,
        assistant_message: impl Into<String>,
        intent: AgentIntent,
        now: DateTime<Utc>,
    ) {
        self.messages.push(ConversationMessage {
            role: MessageRole::User,
            content: user_message.into(),
            timestamp: now,
        });
        self.messages.push(ConversationMessage {
            role: MessageRole::Assistant,
            content: assistant_message.into(),
            timestamp: now,
        });
        self.agent_type = intent;
        self.updated_at = now;
    }

    pub fn merge_context(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.context.insert(key.clone(), value.clone());
        }
    }

    pub fn recent_messages(&self, limit: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    use super::{Conversation, ConversationId, MessageRole};
    use crate::domain::identity::UserId;
    use crate::domain::intent::AgentIntent;

    #[test]
    fn agent_type_tracks_last_turn_intent() {
        let now = Utc::now();
        let mut conversation =
            Conversation::start(ConversationId("c-1".into()), UserId::from("u-1"), now);
        conversation.record_turn("book me in", "done", AgentIntent::Booking, now);
        conversation.record_turn(
            "how am I doing",
            "here is your progress",
            AgentIntent::Insights,
            now + Duration::seconds(5),
        );

        assert_eq!(conversation.agent_type, AgentIntent::Insights);
        assert_eq!(conversation.messages.len(), 4);
        assert_eq!(conversation.messages[2].role, MessageRole::User);
        assert_eq!(conversation.messages[3].role, MessageRole::Assistant);
    }

    #[test]
    fn context_merge_overwrites_keys_and_keeps_others() {
        let mut conversation =
            Conversation::start(ConversationId("c-2".into()), UserId::from("u-1"), Utc::now());
        conversation.context.insert("timezone".into(), json!("UTC"));
        conversation.context.insert("therapist_id".into(), json!("t-1"));

        let mut patch = Map::new();
        patch.insert("timezone".into(), json!("Europe/Paris"));
        conversation.merge_context(&patch);

        assert_eq!(conversation.context["timezone"], json!("Europe/Paris"));
        assert_eq!(conversation.context["therapist_id"], json!("t-1"));
    }

    #[test]
    fn recent_messages_is_bounded() {
        let now = Utc::now();
        let mut conversation =
            Conversation::start(ConversationId("c-3".into()), UserId::from("u-1"), now);
        for turn in 0..4 {
            let (question, answer) = (format!("q{turn}"), format!("a{turn}"));
            conversation.record_turn(question, answer, AgentIntent::General, now);
        }
        let recent = conversation.recent_messages(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].content, "a3");
        assert_eq!(conversation.recent_messages(100).len(), 8);
    }
}
