use tandem_agent::CalendarService;
use tandem_db::repositories::RepositorySet;

use crate::commands::{connect_migrated, load_config, runtime, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let config = match load_config("sync-calendars") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("sync-calendars") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_migrated(&config).await?;
        let repositories = RepositorySet::sql(pool.clone());
        let service = CalendarService::new(
            repositories.calendars,
            repositories.appointments,
            &config.calendar,
        );
        let summary =
            service.sync_all().await.map_err(|error| ("calendar_sync", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, StepFailure>(summary)
    });

    match result {
        Ok(summary) if summary.success => CommandResult::success(
            "sync-calendars",
            format!(
                "synced {} calendar(s) in {}ms",
                summary.calendars_synced, summary.duration_ms
            ),
        ),
        Ok(summary) => CommandResult::failure(
            "sync-calendars",
            "partial_sync",
            format!(
                "synced {} calendar(s), {} failed: {}",
                summary.calendars_synced,
                summary.calendars_failed,
                summary.errors.join("; ")
            ),
            7,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sync-calendars", error_class, message, exit_code)
        }
    }
}
