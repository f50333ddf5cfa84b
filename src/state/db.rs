use crate::acme::object::{ChallengeStatus, Token};
use crate::state::cache::{ChallengeCache, ChallengeRecord, PendingChallenge};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;

const DATABASE_TIMEOUT: Duration = Duration::from_secs(60);

/// SQLite-backed challenge cache, shared safely between processes
#[derive(Debug)]
pub struct Database {
    pool: sqlx::SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingChallengeRow {
    domain: String,
    account_url: String,
    order_url: String,
    authorization_url: String,
    challenge_url: String,
    challenge_type: String,
    token: String,
    challenge_status: String,
    key_authorization: String,
    created_at: OffsetDateTime,
}

impl TryFrom<PendingChallengeRow> for PendingChallenge {
    type Error = anyhow::Error;

    fn try_from(row: PendingChallengeRow) -> Result<Self, Self::Error> {
        let parse_url = |url: &str| Url::parse(url).with_context(|| format!("stored URL {url} is invalid"));
        Ok(PendingChallenge {
            account_url: parse_url(&row.account_url)?,
            order_url: parse_url(&row.order_url)?,
            authorization_url: parse_url(&row.authorization_url)?,
            challenge: ChallengeRecord {
                url: parse_url(&row.challenge_url)?,
                typ: row.challenge_type,
                token: Token::from_str(&row.token).context("stored challenge token is invalid")?,
                status: ChallengeStatus::from_str(&row.challenge_status)
                    .with_context(|| format!("stored challenge status {} is unknown", row.challenge_status))?,
            },
            domain: row.domain,
            key_authorization: row.key_authorization,
            created_at: row.created_at,
        })
    }
}

impl Database {
    pub async fn open<P: AsRef<Path>>(database_file: P) -> anyhow::Result<Database> {
        let file = database_file.as_ref();
        let parent = file
            .parent()
            .ok_or_else(|| anyhow!("Database path {} has no parent directory", file.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Creating database directory {} failed", parent.display()))?;
        let connect_options = sqlx::sqlite::SqliteConnectOptions::new().filename(file);
        Self::open_with(connect_options).await
    }

    async fn open_with(connect_options: sqlx::sqlite::SqliteConnectOptions) -> anyhow::Result<Database> {
        let connect_options = connect_options
            .create_if_missing(true)
            .busy_timeout(DATABASE_TIMEOUT)
            .optimize_on_close(true, None);
        let pool_options = sqlx::sqlite::SqlitePoolOptions::new();

        #[cfg(debug_assertions)]
        let connect_options = sqlx::ConnectOptions::log_slow_statements(
            connect_options,
            tracing::log::LevelFilter::Debug,
            Duration::from_millis(500),
        );

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context("Opening challenge cache failed")?;
        super::migration::migrate(&pool).await?;
        Ok(Database { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ChallengeCache for Database {
    async fn put(&self, key: &str, entry: &PendingChallenge) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO pending_challenges (cache_key, domain, account_url, order_url, authorization_url, \
            challenge_url, challenge_type, token, challenge_status, key_authorization, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
            ON CONFLICT(cache_key) DO UPDATE \
            SET domain = $2, account_url = $3, order_url = $4, authorization_url = $5, challenge_url = $6, \
            challenge_type = $7, token = $8, challenge_status = $9, key_authorization = $10, created_at = $11;",
        )
        .bind(key)
        .bind(&entry.domain)
        .bind(entry.account_url.as_str())
        .bind(entry.order_url.as_str())
        .bind(entry.authorization_url.as_str())
        .bind(entry.challenge.url.as_str())
        .bind(&entry.challenge.typ)
        .bind(entry.challenge.token.as_str())
        .bind(entry.challenge.status.to_string())
        .bind(&entry.key_authorization)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Storing pending challenge failed")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<PendingChallenge>> {
        let row: Option<PendingChallengeRow> = sqlx::query_as(
            "SELECT domain, account_url, order_url, authorization_url, challenge_url, challenge_type, token, \
            challenge_status, key_authorization, created_at FROM pending_challenges WHERE cache_key = $1;",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Reading pending challenge failed")?;
        row.map(PendingChallenge::try_from).transpose()
    }

    async fn forget(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM pending_challenges WHERE cache_key = $1;")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Removing pending challenge failed")?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_helper::open_db;
    use super::*;
    use crate::state::cache::test_helper::pending_challenge;

    #[tokio::test]
    async fn test_open_file_database_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("challenges.sqlite");
        let entry = pending_challenge("*.example.com");

        let db = Database::open(&path).await.unwrap();
        db.put("_example_com", &entry).await.unwrap();
        db.close().await;

        let reopened = Database::open(&path).await.unwrap();
        assert_eq!(reopened.get("_example_com").await.unwrap(), Some(entry));
        reopened.close().await;
    }

    // Sanity check to verify that sqlx actually separates the in-memory databases from each other
    #[tokio::test(flavor = "current_thread")]
    async fn databases_isolated_in_test() {
        let db_1 = open_db().await;
        let db_2 = open_db().await;

        db_1.put("example_com", &pending_challenge("example.com")).await.unwrap();

        assert!(db_1.get("example_com").await.unwrap().is_some());
        assert!(db_2.get("example_com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_an_upsert() {
        let db = open_db().await;
        let first = pending_challenge("example.com");
        let mut second = pending_challenge("example.com");
        second.order_url = Url::parse("https://acme.example/order/2").unwrap();
        second.challenge.status = ChallengeStatus::Processing;

        db.put("example_com", &first).await.unwrap();
        db.put("example_com", &second).await.unwrap();

        assert_eq!(db.get("example_com").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_forget() {
        let db = open_db().await;
        db.put("example_com", &pending_challenge("example.com")).await.unwrap();
        db.put("www_example_com", &pending_challenge("www.example.com")).await.unwrap();

        db.forget("example_com").await.unwrap();
        db.forget("never_stored").await.unwrap();

        assert!(db.get("example_com").await.unwrap().is_none());
        assert!(db.get("www_example_com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_with_corrupted_entry() {
        let db = open_db().await;
        db.put("example_com", &pending_challenge("example.com")).await.unwrap();
        sqlx::query("UPDATE pending_challenges SET order_url = 'not a url' WHERE cache_key = 'example_com';")
            .execute(&db.pool)
            .await
            .unwrap();

        assert!(db.get("example_com").await.is_err());
    }
}
