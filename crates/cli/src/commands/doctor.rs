use serde::Serialize;
use tandem_core::config::{AppConfig, LlmProvider, LoadOptions};
use tandem_db::{connect_with_settings, migrations};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn new(name: &'static str, status: CheckStatus, details: impl Into<String>) -> Self {
        Self { name, status, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["llm_settings", "cron_secret", "database_connectivity", "schema"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\
                 \"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::new(
                "config_validation",
                CheckStatus::Pass,
                "configuration loaded and validated",
            ));
            checks.push(check_llm_settings(&config));
            checks.push(check_cron_secret(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::new(
                "config_validation",
                CheckStatus::Fail,
                error.to_string(),
            ));
            checks.extend(DEPENDENT_CHECKS.iter().map(|name| {
                DoctorCheck::new(
                    *name,
                    CheckStatus::Skipped,
                    "skipped because configuration did not load",
                )
            }));
        }
    }

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);
    let (overall_status, summary) = match (failed, warned) {
        (true, _) => (CheckStatus::Fail, "doctor: one or more readiness checks failed"),
        (false, true) => (CheckStatus::Pass, "doctor: ready, with warnings"),
        (false, false) => (CheckStatus::Pass, "doctor: all readiness checks passed"),
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn check_llm_settings(config: &AppConfig) -> DoctorCheck {
    let endpoint = format!(
        "provider `{}` model `{}` at {} (timeout {}ms)",
        config.llm.provider.as_str(),
        config.llm.model,
        config.llm.effective_base_url(),
        config.llm.timeout_ms
    );
    if config.llm.provider == LlmProvider::Ollama && config.llm.base_url.is_none() {
        return DoctorCheck::new(
            "llm_settings",
            CheckStatus::Warn,
            format!("{endpoint}; using the local default endpoint"),
        );
    }
    DoctorCheck::new("llm_settings", CheckStatus::Pass, endpoint)
}

fn check_cron_secret(config: &AppConfig) -> DoctorCheck {
    match config.server.cron_secret {
        Some(_) => DoctorCheck::new(
            "cron_secret",
            CheckStatus::Pass,
            "calendar sync requires the x-cron-secret header",
        ),
        None => DoctorCheck::new(
            "cron_secret",
            CheckStatus::Warn,
            "unset; POST /api/v1/calendar/sync accepts unauthenticated calls",
        ),
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::new(
                    "database_connectivity",
                    CheckStatus::Fail,
                    format!("failed to initialize async runtime: {error}"),
                ),
                DoctorCheck::new("schema", CheckStatus::Skipped, "skipped without a runtime"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck::new(
                        "database_connectivity",
                        CheckStatus::Fail,
                        format!("failed to connect to database: {error}"),
                    ),
                    DoctorCheck::new(
                        "schema",
                        CheckStatus::Skipped,
                        "skipped without a connection",
                    ),
                ];
            }
        };

        let connectivity = DoctorCheck::new(
            "database_connectivity",
            CheckStatus::Pass,
            format!("connected using `{}`", config.database.url),
        );
        let known = migrations::known_count();
        let schema = match migrations::applied_count(&pool).await {
            Ok(applied) if applied >= known => DoctorCheck::new(
                "schema",
                CheckStatus::Pass,
                format!("{applied}/{known} migrations applied"),
            ),
            Ok(applied) => DoctorCheck::new(
                "schema",
                CheckStatus::Warn,
                format!("{applied}/{known} migrations applied; run `tandem migrate`"),
            ),
            Err(error) => DoctorCheck::new(
                "schema",
                CheckStatus::Fail,
                format!("migration ledger unreadable: {error}"),
            ),
        };
        pool.close().await;
        vec![connectivity, schema]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
