use serde_json::{Map, Value};

use tandem_core::surface::SurfaceComponent;

use super::{run_tool_agent, AgentDeps, AgentError, AgentState, AgentUpdate};
use crate::tools::insights::{
    goal_progress, risk_overview, session_statistics, DEFAULT_STATISTICS_DAYS,
};

pub const DASHBOARD_ACTION: &str = "generate_dashboard";

fn system_prompt(state: &AgentState) -> String {
    format!(
        "You help therapists understand their practice. The current time is {now}; the \
         signed-in user is `{user}`. Use the tools for numbers and never estimate them \
         yourself. Summarise trends in two or three sentences.",
        now = state.now.to_rfc3339(),
        user = state.user_id,
    )
}

pub async fn run(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    if state.context_str("action") == Some(DASHBOARD_ACTION) {
        return dashboard(state, deps).await;
    }
    run_tool_agent(state, deps, system_prompt(state), &deps.insights_tools).await
}

/// Runs every analysis directly, without the model.
async fn dashboard(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    let patient = state.subject_id();
    let statistics = session_statistics(
        deps.repositories.appointments.as_ref(),
        &state.user_id,
        DEFAULT_STATISTICS_DAYS,
        state.now,
    )
    .await?;
    let risk = risk_overview(deps.repositories.clinical.as_ref(), &patient).await?;
    let goals = goal_progress(deps.repositories.clinical.as_ref(), &patient).await?;

    let components = vec![
        component("session_statistics", "stat_card", "Sessions (30 days)", statistics),
        component("risk_overview", "risk_summary", "Risk overview", risk),
        component("goal_progress", "progress_list", "Goal progress", goals),
    ];

    let mut metadata = Map::new();
    metadata.insert("mode".to_string(), Value::from("dashboard"));
    Ok(AgentUpdate {
        response: "Here is your practice dashboard.".to_string(),
        components: Some(components),
        metadata,
        ..AgentUpdate::default()
    })
}

fn component(id: &str, component_type: &str, title: &str, data: Value) -> SurfaceComponent {
    let mut props = Map::new();
    props.insert("title".to_string(), Value::from(title));
    props.insert("data".to_string(), data);
    SurfaceComponent { id: id.to_string(), component_type: component_type.to_string(), props }
}
