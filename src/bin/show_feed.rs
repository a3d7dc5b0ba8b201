use anyhow::{anyhow, Result};
use clap::Parser;
use feed_reload::config;
use feed_reload::db;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Print a stored feed, with all of its news, as JSON.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Feed link as bookmarked
    #[arg(long, conflicts_with = "bookmark")]
    link: Option<String>,

    /// Bookmark id
    #[arg(long)]
    bookmark: Option<i64>,

    /// Leave out tombstoned news
    #[arg(long)]
    visible_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let link = match (args.link, args.bookmark) {
        (Some(link), _) => link,
        (None, Some(id)) => {
            db::get_bookmark(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no bookmark with id {}", id))?
                .feed_link
        }
        (None, None) => return Err(anyhow!("pass --link or --bookmark")),
    };

    let mut feed = db::load_feed_by_link(&pool, &link)
        .await?
        .ok_or_else(|| anyhow!("feed {} has never been reloaded", link))?;
    if args.visible_only {
        feed.news.retain(|n| n.is_visible());
    }
    println!("{}", serde_json::to_string_pretty(&feed)?);
    Ok(())
}
