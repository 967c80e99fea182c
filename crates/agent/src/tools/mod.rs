//! Tool registry handed to the LLM plus the per-agent catalogs.
//!
//! Arguments are validated against each tool's JSON schema before the tool
//! runs, so a tool only ever sees structurally valid input. Business failures
//! (a booking conflict, an expired proposal) come back as
//! `{"success": false, ...}` values rather than errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use tandem_core::domain::conversation::ConversationId;
use tandem_core::domain::identity::UserId;
use tandem_db::repositories::RepositoryError;

use crate::calendar::CalendarError;

pub mod booking;
pub mod insights;
pub mod session;

pub use booking::booking_tools;
pub use insights::insights_tools;
pub use session::session_tools;

/// Who is calling a tool and when.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Tool definitions in name order, in the shape the LLM client expects.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema(),
                })
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        validate_arguments(tool.as_ref(), &args)?;
        tool.execute(args, ctx).await
    }
}

fn validate_arguments(tool: &dyn Tool, args: &Value) -> Result<(), ToolError> {
    let schema = tool.parameters_schema();
    let validator = jsonschema::validator_for(&schema).map_err(|error| {
        ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            reason: format!("schema does not compile: {error}"),
        }
    })?;

    let problems: Vec<String> =
        validator.iter_errors(args).map(|error| error.to_string()).collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            reason: problems.join("; "),
        })
    }
}

pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|error| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: error.to_string(),
    })
}

/// Accepts RFC 3339 instants or plain `YYYY-MM-DD` dates (UTC midnight).
/// With `end_of_day`, a plain date means the following midnight so the whole
/// day is covered.
pub(crate) fn parse_instant(
    tool: &str,
    field: &str,
    value: &str,
    end_of_day: bool,
) -> Result<DateTime<Utc>, ToolError> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("`{field}` must be an RFC 3339 timestamp or YYYY-MM-DD date"),
        }
    })?;
    let midnight = date.and_time(chrono::NaiveTime::MIN).and_utc();
    Ok(if end_of_day { midnight + Duration::days(1) } else { midnight })
}

pub(crate) fn business_failure(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};

    use tandem_core::domain::conversation::ConversationId;
    use tandem_core::domain::identity::UserId;

    use super::ToolContext;

    pub fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid timestamp").with_timezone(&Utc)
    }

    pub fn context(user: &str) -> ToolContext {
        ToolContext {
            user_id: UserId::from(user),
            conversation_id: ConversationId("conv-1".to_string()),
            now: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("timestamp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::test_support::context;
    use super::{parse_instant, Tool, ToolContext, ToolError, ToolRegistry};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Returns its input"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string", "minLength": 1 } },
                "required": ["text"],
                "additionalProperties": false
            })
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(json!({ "success": true, "echo": args["text"] }))
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let registry = ToolRegistry::default();
        let error = registry
            .execute("missing", json!({}), &context("user-1"))
            .await
            .expect_err("unknown tool");
        assert!(matches!(error, ToolError::UnknownTool(name) if name == "missing"));
    }

    #[tokio::test]
    async fn schema_violations_never_reach_the_tool() {
        let mut registry = ToolRegistry::default();
        registry.register(Echo);

        let error = registry
            .execute("echo", json!({ "text": 5 }), &context("user-1"))
            .await
            .expect_err("wrong type");
        assert!(matches!(error, ToolError::InvalidArguments { ref tool, .. } if tool == "echo"));

        let error = registry
            .execute("echo", json!({ "text": "hi", "extra": true }), &context("user-1"))
            .await
            .expect_err("extra property");
        assert!(matches!(error, ToolError::InvalidArguments { .. }));

        let value = registry
            .execute("echo", json!({ "text": "hi" }), &context("user-1"))
            .await
            .expect("valid call");
        assert_eq!(value["echo"], "hi");
    }

    #[test]
    fn definitions_carry_name_description_and_schema() {
        let mut registry = ToolRegistry::default();
        registry.register(Echo);

        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0]["name"], "echo");
        assert_eq!(definitions[0]["parameters"]["required"][0], "text");
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn plain_end_dates_cover_the_whole_day() {
        let start = parse_instant("t", "start_date", "2026-03-02", false).expect("start");
        let end = parse_instant("t", "end_date", "2026-03-02", true).expect("end");
        assert_eq!((end - start).num_hours(), 24);

        let exact = parse_instant("t", "end_date", "2026-03-02T10:00:00Z", true).expect("rfc3339");
        assert_eq!((exact - start).num_hours(), 10);

        assert!(parse_instant("t", "start_date", "next tuesday", false).is_err());
    }
}
