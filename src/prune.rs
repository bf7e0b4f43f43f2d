//! `palm prune`: delete conversations idle for longer than the retention
//! window. Nothing else ever deletes conversations.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Unix-seconds cutoff for a retention window ending at `now`.
pub fn cutoff(now: i64, older_than_days: u32) -> i64 {
    now - Duration::days(i64::from(older_than_days)).num_seconds()
}

pub async fn run_prune(config: &Config, older_than_days: Option<u32>) -> Result<()> {
    let Some(days) = older_than_days.or(config.conversations.retention_days) else {
        bail!("No retention window. Pass --older-than-days or set conversations.retention_days.");
    };
    if days == 0 {
        bail!("Retention window must be at least one day.");
    }

    let store = SqliteStore::new(db::connect(config).await?);
    let before = cutoff(Utc::now().timestamp(), days);
    let deleted = store.prune_conversations(before).await?;
    tracing::info!(days, deleted, "pruned conversations");

    println!("prune conversations older than {} days", days);
    println!("  deleted: {}", deleted);

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff() {
        assert_eq!(cutoff(10 * 86_400, 3), 7 * 86_400);
        assert_eq!(cutoff(100, 0), 100);
    }
}
