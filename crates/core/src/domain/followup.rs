use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::conversation::ConversationId;
use crate::domain::identity::UserId;
use crate::errors::DomainError;
use crate::flows::{FlowAction, FlowContext, FlowState, TransitionOutcome};
use crate::surface::{apply_action, Surface, SurfaceAction, SurfaceComponent};

pub const DEFAULT_TEMPLATE: &str = "weekly_check_in";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FollowUpSessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    Scale { min: i64, max: i64 },
    Choice { options: Vec<String> },
}

impl QuestionKind {
    fn component_type(&self) -> &'static str {
        match self {
            Self::Text => "text_input",
            Self::Scale { .. } => "slider",
            Self::Choice { .. } => "select",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormQuestion {
    pub field: String,
    pub label: String,
    pub kind: QuestionKind,
    pub required: bool,
}

impl FormQuestion {
    fn new(field: &str, label: &str, kind: QuestionKind, required: bool) -> Self {
        Self { field: field.to_owned(), label: label.to_owned(), kind, required }
    }

    pub fn validate(&self, value: &Value) -> Result<(), DomainError> {
        let invalid = |reason: String| DomainError::InvalidFormField {
            field: self.field.clone(),
            reason,
        };
        match &self.kind {
            QuestionKind::Text => match value {
                Value::String(_) => Ok(()),
                _ => Err(invalid("expected text".to_owned())),
            },
            QuestionKind::Scale { min, max } => match value.as_i64() {
                Some(number) if (*min..=*max).contains(&number) => Ok(()),
                _ => Err(invalid(format!("expected a whole number between {min} and {max}"))),
            },
            QuestionKind::Choice { options } => match value.as_str() {
                Some(choice) if options.iter().any(|option| option == choice) => Ok(()),
                _ => Err(invalid(format!("expected one of {}", options.join(", ")))),
            },
        }
    }

    fn component(&self) -> SurfaceComponent {
        let mut props = Map::new();
        props.insert("label".to_owned(), json!(self.label));
        props.insert("required".to_owned(), json!(self.required));
        props.insert("value".to_owned(), Value::Null);
        match &self.kind {
            QuestionKind::Text => {}
            QuestionKind::Scale { min, max } => {
                props.insert("min".to_owned(), json!(min));
                props.insert("max".to_owned(), json!(max));
            }
            QuestionKind::Choice { options } => {
                props.insert("options".to_owned(), json!(options));
            }
        }
        SurfaceComponent {
            id: self.field.clone(),
            component_type: self.kind.component_type().to_owned(),
            props,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpTemplate {
    pub name: String,
    pub title: String,
    pub questions: Vec<FormQuestion>,
}

impl FollowUpTemplate {
    pub fn named(name: &str) -> Option<Self> {
        let scale = |min, max| QuestionKind::Scale { min, max };
        let choice = |options: &[&str]| QuestionKind::Choice {
            options: options.iter().map(|option| (*option).to_owned()).collect(),
        };

        let (title, questions) = match name {
            "weekly_check_in" => (
                "Weekly check-in",
                vec![
                    FormQuestion::new("mood", "Overall mood this week", scale(1, 10), true),
                    FormQuestion::new(
                        "sleep_quality",
                        "How have you been sleeping?",
                        choice(&["poor", "fair", "good"]),
                        true,
                    ),
                    FormQuestion::new("stress_level", "Stress level", scale(1, 10), true),
                    FormQuestion::new(
                        "notes",
                        "Anything else to share?",
                        QuestionKind::Text,
                        false,
                    ),
                ],
            ),
            "post_session" => (
                "After your session",
                vec![
                    FormQuestion::new(
                        "session_helpfulness",
                        "How helpful was today's session?",
                        scale(1, 5),
                        true,
                    ),
                    FormQuestion::new(
                        "key_takeaway",
                        "What will you take away from it?",
                        QuestionKind::Text,
                        true,
                    ),
                    FormQuestion::new(
                        "homework_commitment",
                        "Will you try the agreed exercises?",
                        choice(&["yes", "no", "unsure"]),
                        false,
                    ),
                ],
            ),
            _ => return None,
        };

        Some(Self { name: name.to_owned(), title: title.to_owned(), questions })
    }

    pub fn question(&self, field: &str) -> Option<&FormQuestion> {
        self.questions.iter().find(|question| question.field == field)
    }

    pub fn render_surface(&self, surface_id: &str) -> Result<Surface, DomainError> {
        let rendered = apply_action(
            &Surface::new(surface_id),
            SurfaceAction::Render {
                components: self.questions.iter().map(FormQuestion::component).collect(),
            },
        )?;
        let rendered = apply_action(
            &rendered,
            SurfaceAction::SetMetadata { key: "title".to_owned(), value: json!(self.title) },
        )?;
        Ok(apply_action(
            &rendered,
            SurfaceAction::SetMetadata { key: "status".to_owned(), value: json!("open") },
        )?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowUpSession {
    pub id: FollowUpSessionId,
    pub owner_id: UserId,
    pub conversation_id: ConversationId,
    pub template: String,
    pub state: FlowState,
    pub responses: Map<String, Value>,
    pub surface: Surface,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowUpSession {
    pub fn start(
        id: FollowUpSessionId,
        owner_id: UserId,
        conversation_id: ConversationId,
        template: &FollowUpTemplate,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let surface = template.render_surface(&format!("followup:{}", id.0))?;
        Ok(Self {
            id,
            owner_id,
            conversation_id,
            template: template.name.clone(),
            state: FlowState::Initialized,
            responses: Map::new(),
            surface,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn submit_context(&self, template: &FollowUpTemplate) -> FlowContext {
        let missing_required_fields = template
            .questions
            .iter()
            .filter(|question| question.required)
            .filter(|question| {
                self.responses.get(&question.field).map_or(true, |value| match value {
                    Value::Null => true,
                    Value::String(text) => text.trim().is_empty(),
                    _ => false,
                })
            })
            .map(|question| question.field.clone())
            .collect();
        FlowContext { missing_required_fields }
    }

    /// Applies the side effects of an accepted transition. `value` is only read
    /// for field merges.
    pub fn apply_outcome(
        &mut self,
        outcome: &TransitionOutcome,
        template: &FollowUpTemplate,
        value: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if outcome.from != self.state {
            return Err(DomainError::InvariantViolation(format!(
                "follow-up session is {} but transition starts from {}",
                self.state.as_str(),
                outcome.from.as_str()
            )));
        }

        let mut responses = self.responses.clone();
        let mut surface = self.surface.clone();
        for action in &outcome.actions {
            match action {
                FlowAction::MergeResponse { field } => {
                    let question = template.question(field).ok_or_else(|| {
                        DomainError::InvalidFormField {
                            field: field.clone(),
                            reason: format!("not part of template `{}`", template.name),
                        }
                    })?;
                    question.validate(value)?;
                    responses.insert(field.clone(), value.clone());
                }
                FlowAction::RefreshComponent { field } => {
                    let action = SurfaceAction::from_wire(&format!("on_change_{field}"), value)?;
                    surface = apply_action(&surface, action)?;
                }
                FlowAction::PersistResponses => {}
                FlowAction::MarkSurfaceCompleted => {
                    surface = apply_action(
                        &surface,
                        SurfaceAction::SetMetadata {
                            key: "status".to_owned(),
                            value: json!("completed"),
                        },
                    )?;
                }
            }
        }

        self.responses = responses;
        self.surface = surface;
        self.state = outcome.to;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use super::{FollowUpSession, FollowUpSessionId, FollowUpTemplate, DEFAULT_TEMPLATE};
    use crate::domain::conversation::ConversationId;
    use crate::domain::identity::UserId;
    use crate::errors::DomainError;
    use crate::flows::{FlowEngine, FlowEvent, FlowState};

    fn session(template: &FollowUpTemplate) -> FollowUpSession {
        FollowUpSession::start(
            FollowUpSessionId("fu-1".to_owned()),
            UserId::from("patient-1"),
            ConversationId("conv-1".to_owned()),
            template,
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("timestamp"),
        )
        .expect("session")
    }

    fn change(
        session: &mut FollowUpSession,
        template: &FollowUpTemplate,
        field: &str,
        value: Value,
    ) -> Result<(), DomainError> {
        let engine = FlowEngine::default();
        let outcome = engine.apply(
            &session.state,
            &FlowEvent::FieldChanged { field: field.to_owned() },
            &Default::default(),
        )?;
        session.apply_outcome(&outcome, template, &value, Utc::now())
    }

    #[test]
    fn builtin_templates_resolve_by_name() {
        let template = FollowUpTemplate::named(DEFAULT_TEMPLATE).expect("default template");
        assert!(template.questions.iter().any(|question| question.required));
        assert!(FollowUpTemplate::named("post_session").is_some());
        assert!(FollowUpTemplate::named("intake_v0").is_none());
    }

    #[test]
    fn start_renders_one_component_per_question() {
        let template = FollowUpTemplate::named(DEFAULT_TEMPLATE).expect("template");
        let session = session(&template);

        assert_eq!(session.state, FlowState::Initialized);
        assert_eq!(session.surface.components.len(), template.questions.len());
        assert_eq!(session.surface.metadata["status"], json!("open"));
    }

    #[test]
    fn field_change_merges_response_and_updates_single_component() {
        let template = FollowUpTemplate::named(DEFAULT_TEMPLATE).expect("template");
        let mut session = session(&template);
        let before = session.surface.clone();

        change(&mut session, &template, "mood", json!(6)).expect("mood");

        assert_eq!(session.responses.get("mood"), Some(&json!(6)));
        assert_eq!(session.surface.version, before.version + 1);
        assert_eq!(
            session.surface.component("mood").and_then(|c| c.props.get("value")),
            Some(&json!(6))
        );
        assert_eq!(session.surface.component("sleep_quality"), before.component("sleep_quality"));
    }

    #[test]
    fn invalid_values_leave_session_untouched() {
        let template = FollowUpTemplate::named(DEFAULT_TEMPLATE).expect("template");
        let mut session = session(&template);
        let before = session.clone();

        let out_of_range = change(&mut session, &template, "mood", json!(11));
        let unknown = change(&mut session, &template, "favourite_colour", json!("blue"));

        assert!(matches!(out_of_range, Err(DomainError::InvalidFormField { .. })));
        assert!(matches!(unknown, Err(DomainError::InvalidFormField { .. })));
        assert_eq!(session, before);
    }

    #[test]
    fn submit_requires_every_required_answer() {
        let template = FollowUpTemplate::named(DEFAULT_TEMPLATE).expect("template");
        let mut session = session(&template);
        change(&mut session, &template, "mood", json!(4)).expect("mood");

        let context = session.submit_context(&template);
        assert_eq!(
            context.missing_required_fields,
            vec!["sleep_quality".to_owned(), "stress_level".to_owned()]
        );

        change(&mut session, &template, "sleep_quality", json!("fair")).expect("sleep");
        change(&mut session, &template, "stress_level", json!(3)).expect("stress");
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(&session.state, &FlowEvent::Submitted, &session.submit_context(&template))
            .expect("submit");
        session.apply_outcome(&outcome, &template, &Value::Null, Utc::now()).expect("apply");

        assert_eq!(session.state, FlowState::Completed);
        assert_eq!(session.surface.metadata["status"], json!("completed"));
    }
}
