pub mod cache;
mod db;
mod lock;
mod migration;

pub use cache::{ChallengeCache, ChallengeRecord, MemoryChallengeCache, PendingChallenge};

pub type Database = db::Database;
pub type DomainLock = lock::DomainLock;

#[cfg(test)]
pub async fn open_test_db() -> Database {
    db::test_helper::open_db().await
}
