use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use feed_reload::config::{self, Config};
use feed_reload::connection::ConnectionService;
use feed_reload::db::{self, SqliteStore};
use feed_reload::events::LogEventSink;
use feed_reload::interpreter::SyndicationInterpreter;
use feed_reload::model::{NewsState, RetentionOverrides};
use feed_reload::reload::{FeedReloadCoordinator, ReloadOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reload every bookmark periodically until Ctrl-C
    Run,
    /// Reload one bookmark once
    Reload { id: i64 },
    /// Bookmark a feed
    Add {
        name: String,
        link: String,
        /// Override the global max item count for this feed
        #[arg(long)]
        max_count: Option<u32>,
        /// Override the global max age (days) for this feed
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// List bookmarks
    List,
    /// List the news of a bookmark
    News {
        id: i64,
        #[arg(long)]
        all: bool,
    },
    /// Mark a news item read
    MarkRead { news_id: i64 },
    /// Flag a news item
    Flag { news_id: i64 },
    /// Apply a bookmark's retention policy now, without fetching
    Prune { id: i64 },
    /// Attach a label to a news item
    Label { news_id: i64, label: String },
    /// Delete a news item
    Delete { news_id: i64 },
    /// Create a news bin
    BinCreate { name: String },
    /// List news bins
    Bins,
    /// Copy a news item into a bin
    BinCopy { news_id: i64, bin_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Run => run(&cfg, pool).await,
        Command::Reload { id } => {
            let bookmark = db::get_bookmark(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no bookmark with id {}", id))?;
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let coordinator = coordinator(&cfg, pool, shutdown_rx)?;
            match coordinator.reload(&bookmark).await? {
                ReloadOutcome::NotModified => println!("not modified"),
                ReloadOutcome::AuthRequired { link, realm } => println!(
                    "authentication required for {} (realm: {})",
                    link,
                    realm.as_deref().unwrap_or("-")
                ),
                ReloadOutcome::Done(s) => println!(
                    "added {}, updated {}, removed {}{}",
                    s.added,
                    s.updated,
                    s.removed,
                    if s.feed_updated { ", feed updated" } else { "" }
                ),
            }
            Ok(())
        }
        Command::Add {
            name,
            link,
            max_count,
            max_age_days,
        } => {
            let overrides = RetentionOverrides {
                max_count,
                max_age_days,
                ..Default::default()
            };
            let id = db::insert_bookmark(&pool, &name, &link, &overrides).await?;
            println!("{}", id);
            Ok(())
        }
        Command::List => {
            for b in db::list_bookmarks(&pool).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    b.id,
                    b.name,
                    b.feed_link,
                    b.last_error.as_deref().unwrap_or("ok")
                );
            }
            Ok(())
        }
        Command::News { id, all } => {
            let bookmark = db::get_bookmark(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no bookmark with id {}", id))?;
            for n in db::list_news(&pool, &bookmark.feed_link, all).await? {
                println!(
                    "{}\t{}{}\t{}\t{}",
                    n.id,
                    n.state.as_str(),
                    if n.flagged { "*" } else { "" },
                    n.title,
                    n.link.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::MarkRead { news_id } => {
            db::set_news_state(&pool, news_id, NewsState::Read).await?;
            Ok(())
        }
        Command::Flag { news_id } => {
            db::set_news_flagged(&pool, news_id, true).await?;
            Ok(())
        }
        Command::Prune { id } => {
            let bookmark = db::get_bookmark(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no bookmark with id {}", id))?;
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let removed = coordinator(&cfg, pool, shutdown_rx)?
                .enforce_retention(&bookmark)
                .await?;
            println!("removed {}", removed);
            Ok(())
        }
        Command::Label { news_id, label } => {
            db::add_news_label(&pool, news_id, &label).await?;
            Ok(())
        }
        Command::Delete { news_id } => {
            db::delete_news(&pool, news_id).await?;
            Ok(())
        }
        Command::BinCreate { name } => {
            let id = db::create_news_bin(&pool, &name).await?;
            println!("{}", id);
            Ok(())
        }
        Command::Bins => {
            for bin in db::list_news_bins(&pool).await? {
                println!("{}\t{}", bin.id, bin.name);
            }
            Ok(())
        }
        Command::BinCopy { news_id, bin_id } => {
            let id = db::copy_news_to_bin(&pool, news_id, bin_id).await?;
            println!("{}", id);
            Ok(())
        }
    }
}

fn coordinator(
    cfg: &Config,
    pool: db::Pool,
    shutdown: watch::Receiver<bool>,
) -> Result<FeedReloadCoordinator> {
    let connection = ConnectionService::from_config(&cfg.connection)?;
    Ok(FeedReloadCoordinator::new(
        Arc::new(connection),
        Arc::new(SyndicationInterpreter),
        Arc::new(SqliteStore::new(pool)),
        Arc::new(LogEventSink),
        cfg.retention,
    )
    .with_fetch_timeout(Duration::from_secs(cfg.connection.timeout_secs))
    .with_workers(cfg.app.workers)
    .with_shutdown(shutdown))
}

async fn run(cfg: &Config, pool: db::Pool) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = coordinator(cfg, pool.clone(), shutdown_rx)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.app.reload_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(workers = cfg.app.workers, "starting reload loop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = ticker.tick() => {
                let bookmarks = match db::list_bookmarks(&pool).await {
                    Ok(b) => b,
                    Err(err) => {
                        error!(error = %err, "failed to list bookmarks");
                        continue;
                    }
                };
                let reload = coordinator.reload_all(&bookmarks);
                tokio::pin!(reload);
                let results = tokio::select! {
                    results = &mut reload => results,
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown requested; cancelling fetches");
                        let _ = shutdown_tx.send(true);
                        reload.await;
                        break;
                    }
                };
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                if failed > 0 {
                    warn!(failed, total = results.len(), "reload cycle finished with failures");
                } else {
                    info!(total = results.len(), "reload cycle finished");
                }
            }
        }
    }
    Ok(())
}
