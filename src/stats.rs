//! Archive statistics: item, chunk, embedding and conversation counts,
//! with a per-kind breakdown. Used by `palm stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

struct KindStats {
    kind: String,
    item_count: i64,
    chunk_count: i64,
    embedded_count: i64,
    last_updated: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let counts = store.counts().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Palm Island archive");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Items:          {}", counts.items);
    println!("  Chunks:         {}", counts.chunks);
    println!(
        "  Embedded:       {} / {} ({}%)",
        counts.embedded,
        counts.chunks,
        percent(counts.embedded, counts.chunks)
    );
    println!("  Conversations:  {}", counts.conversations);

    let rows = sqlx::query(
        r#"
        SELECT
            i.kind,
            COUNT(DISTINCT i.id) AS item_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count,
            MAX(i.updated_at) AS last_updated
        FROM content_items i
        LEFT JOIN chunks c ON c.source_id = i.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY i.kind
        ORDER BY item_count DESC
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    let by_kind: Vec<KindStats> = rows
        .iter()
        .map(|row| KindStats {
            kind: row.get("kind"),
            item_count: row.get("item_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
            last_updated: row.get("last_updated"),
        })
        .collect();

    if !by_kind.is_empty() {
        println!();
        println!("  By kind:");
        println!(
            "  {:<18} {:>6} {:>8} {:>10}   {}",
            "KIND", "ITEMS", "CHUNKS", "EMBEDDED", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(64));
        for s in &by_kind {
            println!(
                "  {:<18} {:>6} {:>8} {:>10}   {}",
                s.kind,
                s.item_count,
                s.chunk_count,
                s.embedded_count,
                format_ts(s.last_updated)
            );
        }
    }
    println!();

    store.close().await;
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
