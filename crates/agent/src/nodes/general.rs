use super::{prompt_messages, AgentDeps, AgentError, AgentState, AgentUpdate};
use crate::llm::CompletionOptions;

const SYSTEM_PROMPT: &str = "You are Tandem, a friendly assistant for a therapy practice. \
     Answer briefly. You can help with scheduling, in-session support, practice insights \
     and follow-up check-ins; suggest one of those when it fits. Do not give medical advice.";

pub async fn run(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    let messages = prompt_messages(SYSTEM_PROMPT.to_string(), state);
    let completion = deps.llm.complete(&messages, &CompletionOptions::default()).await?;
    Ok(AgentUpdate {
        response: completion.content.trim().to_string(),
        usage: completion.usage,
        ..AgentUpdate::default()
    })
}
