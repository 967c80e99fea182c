use chrono::Utc;
use tandem_db::repositories::RepositorySet;

use crate::commands::{connect_migrated, load_config, runtime, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let config = match load_config("expire-proposals") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("expire-proposals") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_migrated(&config).await?;
        let repositories = RepositorySet::sql(pool.clone());
        let expired = repositories
            .proposals
            .expire_due(Utc::now())
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<u64, StepFailure>(expired)
    });

    match result {
        Ok(expired) => CommandResult::success(
            "expire-proposals",
            format!("expired {expired} pending proposal(s)"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("expire-proposals", error_class, message, exit_code)
        }
    }
}
