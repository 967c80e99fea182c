use super::{run_tool_agent, AgentDeps, AgentError, AgentState, AgentUpdate};

fn system_prompt(state: &AgentState) -> String {
    format!(
        "You are the scheduling assistant of a therapy practice. The current time is {now}. \
         The signed-in user is `{user}`. Use the tools to look up availability, book \
         appointments and manage slot proposals. Never invent times: only offer slots \
         returned by check_therapist_availability. Keep replies short and confirm the \
         exact date and time of anything you book.",
        now = state.now.to_rfc3339(),
        user = state.user_id,
    )
}

pub async fn run(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    run_tool_agent(state, deps, system_prompt(state), &deps.booking_tools).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::run;
    use crate::llm::{Completion, MockLlm, ToolCall};
    use crate::nodes::test_support::{deps, state};

    #[tokio::test]
    async fn booking_calls_run_in_the_order_the_model_returned() {
        let booking = |start: &str| {
            json!({
                "therapist_id": "therapist-1",
                "patient_id": "patient-1",
                "start_time": start,
                "duration_minutes": 50
            })
        };
        let llm = Arc::new(MockLlm::new(vec![Ok(Completion {
            content: "Booked what I could.".to_string(),
            tool_calls: vec![
                ToolCall {
                    id: "a".to_string(),
                    name: "create_appointment".to_string(),
                    arguments: booking("2026-03-03T10:00:00Z"),
                },
                ToolCall {
                    id: "b".to_string(),
                    name: "create_appointment".to_string(),
                    arguments: booking("2026-03-03T10:20:00Z"),
                },
            ],
            ..Completion::default()
        })]));
        let deps = deps(llm.clone());

        let update = run(&state("book two sessions", json!({})), &deps).await.expect("update");
        assert_eq!(update.response, "Booked what I could.");
        assert_eq!(update.tool_calls[0].call.id, "a");
        let succeeded: Vec<Option<Value>> = update
            .tool_calls
            .iter()
            .map(|execution| execution.result.as_ref().map(|r| r["success"].clone()))
            .collect();
        assert_eq!(succeeded, vec![Some(json!(true)), Some(json!(false))]);

        let requests = llm.requests().await;
        assert_eq!(requests[0].1.tools.len(), 4);
    }
}
