//! watchpost_events - inspect and review recorded evidence
//!
//! Prints evidence records as JSON lines, the current status level, or marks a
//! record reviewed.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use watchpost::config::default_categories;
use watchpost::{CategoryClassifier, EvidenceStore, ReviewStatus, SqliteEvidenceStore, StatusQuery};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the evidence database.
    #[arg(long, env = "WATCHPOST_DB_PATH", default_value = "watchpost.db")]
    db_path: String,
    /// Maximum records to print, newest first.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Print the ALERT / OK / IDLE / ERROR status instead of records.
    #[arg(long)]
    status: bool,
    /// Alert window used by --status.
    #[arg(long, default_value_t = 30)]
    alert_window_secs: u64,
    /// Record id to review.
    #[arg(long, requires = "review_as")]
    review: Option<i64>,
    /// Review outcome for --review (valid|false).
    #[arg(long = "as", value_name = "STATUS")]
    review_as: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store: Arc<dyn EvidenceStore> = Arc::new(SqliteEvidenceStore::open(&args.db_path)?);

    if let Some(id) = args.review {
        let status: ReviewStatus = args
            .review_as
            .as_deref()
            .ok_or_else(|| anyhow!("--review requires --as"))?
            .parse()?;
        if !store.set_review_status(id, status)? {
            return Err(anyhow!("no evidence record with id {}", id));
        }
        println!("{}", serde_json::json!({ "id": id, "review": status }));
        return Ok(());
    }

    if args.status {
        let query = StatusQuery::new(
            Arc::clone(&store),
            CategoryClassifier::new(&default_categories())?,
            Duration::from_secs(args.alert_window_secs),
        );
        println!("{}", serde_json::to_string(&query.latest_status(Utc::now()))?);
        return Ok(());
    }

    for record in store.list_recent(args.limit)? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
