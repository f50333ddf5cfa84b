use crate::CRATE_NAME;
use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use tracing::warn;

// Kept apart from the queries, the sqlx::migrate! macro embeds db/migrations at compile time
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    match sqlx::migrate!("db/migrations").run(pool).await {
        Ok(()) => Ok(()),
        Err(MigrateError::VersionMissing(num)) => {
            warn!(
                "The challenge cache was written by a newer {CRATE_NAME} (migration {num} is unknown to this version)."
            );
            warn!("Continuing without migrating the challenge cache.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
