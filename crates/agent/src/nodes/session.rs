use serde_json::Value;

use tandem_core::domain::clinical::{rank_memories, DEFAULT_MEMORY_TOP_K};

use super::{run_tool_agent, AgentDeps, AgentError, AgentState, AgentUpdate};

fn system_prompt(state: &AgentState, patient: &str, memories: &[String]) -> String {
    let mut prompt = format!(
        "You are a supportive in-session companion for a therapy patient (`{patient}`). \
         The current time is {now}. Listen, reflect and keep answers calm and brief. \
         If the patient describes any risk of harm, call flag_risk with the matching \
         severity; for immediate danger also call escalate_to_therapist. Save lasting \
         personal facts with record_patient_memory.",
        now = state.now.to_rfc3339(),
    );
    if !memories.is_empty() {
        prompt.push_str("\n\nWhat you remember about this patient:");
        for memory in memories {
            prompt.push_str("\n- ");
            prompt.push_str(memory);
        }
    }
    prompt
}

pub async fn run(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    let patient = state.subject_id();
    let memories = deps.repositories.clinical.list_memories(&patient).await?;
    let recalled: Vec<String> = rank_memories(&state.message, memories, DEFAULT_MEMORY_TOP_K)
        .into_iter()
        .map(|memory| memory.content)
        .collect();

    let prompt = system_prompt(state, patient.as_str(), &recalled);
    let mut update = run_tool_agent(state, deps, prompt, &deps.session_tools).await?;

    update.risk_flags = update
        .tool_calls
        .iter()
        .filter(|execution| execution.call.name == "flag_risk")
        .filter_map(|execution| execution.result.as_ref())
        .filter_map(|result| result.get("flag").cloned())
        .collect();
    let critical = update
        .risk_flags
        .iter()
        .any(|flag| flag.get("severity").and_then(Value::as_str) == Some("critical"));
    update.metadata.insert("memories_used".to_string(), Value::from(recalled.len()));
    if critical {
        update.metadata.insert("critical_risk".to_string(), Value::Bool(true));
    }
    Ok(update)
}
