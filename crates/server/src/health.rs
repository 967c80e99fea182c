use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tandem_db::{migrations, DbPool};
use tracing::warn;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: Readiness,
    pub detail: String,
}

impl ComponentHealth {
    fn ready(detail: impl Into<String>) -> Self {
        Self { status: Readiness::Ready, detail: detail.into() }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: Readiness::Degraded, detail: detail.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub database: ComponentHealth,
    pub schema: ComponentHealth,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

/// Ready only when the database answers and every embedded migration is applied.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db_pool).await
    {
        Ok(_) => ComponentHealth::ready("database query succeeded"),
        Err(error) => ComponentHealth::degraded(format!("database query failed: {error}")),
    };
    let schema = if database.status == Readiness::Ready {
        schema_health(&state.db_pool).await
    } else {
        ComponentHealth::degraded("skipped because the database is unreachable")
    };

    let ready = database.status == Readiness::Ready && schema.status == Readiness::Ready;
    if !ready {
        warn!(
            event_name = "system.health.degraded",
            correlation_id = "health",
            database = %database.detail,
            schema = %schema.detail,
            "readiness check degraded"
        );
    }

    let payload = HealthResponse {
        status: if ready { Readiness::Ready } else { Readiness::Degraded },
        database,
        schema,
        checked_at: Utc::now().to_rfc3339(),
    };
    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn schema_health(pool: &DbPool) -> ComponentHealth {
    let known = migrations::known_count();
    match migrations::applied_count(pool).await {
        Ok(applied) if applied >= known => {
            ComponentHealth::ready(format!("{applied}/{known} migrations applied"))
        }
        Ok(applied) => ComponentHealth::degraded(format!("{applied}/{known} migrations applied")),
        Err(error) => ComponentHealth::degraded(format!("migration ledger unreadable: {error}")),
    }
}
