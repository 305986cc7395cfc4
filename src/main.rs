#![allow(missing_docs)]

//! SpiderMail entry point
//!
//! ```text
//! spidermail                      run the scheduler until Ctrl-C
//! spidermail crawl [platform] [category]
//!                                 run one crawl now and exit
//! spidermail status [limit]       print the latest crawl tasks
//! ```

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use spidermail_lib::domain::CrawlRepository;
use spidermail_lib::infrastructure::logging::log_system_info;
use spidermail_lib::infrastructure::{
    AppConfig, ConfigManager, DatabaseConnection, ReqwestFetchClient, RequestExecutor, SqliteCrawlRepository,
    build_spider, init_logging_with_config,
};
use spidermail_lib::{CrawlRequest, CrawlScheduler, CrawlTaskCoordinator, Platform, TriggerOutcome};

enum Command {
    Serve,
    Crawl {
        platform: Option<Platform>,
        category: Option<String>,
    },
    Status {
        limit: u32,
    },
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("crawl") => {
            let platform = match args.get(1).map(String::as_str) {
                None | Some("all") => None,
                Some(name) => Some(name.parse::<Platform>()?),
            };
            Ok(Command::Crawl {
                platform,
                category: args.get(2).cloned(),
            })
        }
        Some("status") => {
            let limit = match args.get(1) {
                Some(value) => value.parse().with_context(|| format!("Invalid limit '{value}'"))?,
                None => 10,
            };
            Ok(Command::Status { limit })
        }
        Some(other) => bail!("Unknown command '{other}' (expected serve, crawl or status)"),
    }
}

fn build_coordinator(
    config: &AppConfig,
    repository: Arc<dyn CrawlRepository>,
    cancel: CancellationToken,
) -> Result<CrawlTaskCoordinator> {
    let executor = Arc::new(
        RequestExecutor::from_config(Arc::new(ReqwestFetchClient::new()), &config.spider)
            .with_cancellation(cancel.clone()),
    );

    let mut spiders = Vec::new();
    for platform in &config.platform.platforms {
        spiders.push(build_spider(*platform, executor.clone())?);
    }
    info!("🕷️ Spiders ready: {:?}", config.platform.platforms);

    Ok(CrawlTaskCoordinator::from_config(spiders, repository, &config.spider).with_cancellation(cancel))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let config_manager = ConfigManager::new()?;
    let config = config_manager.load_config().await?;

    init_logging_with_config(&config.logging).context("Failed to initialize logging")?;
    log_system_info();

    let database = DatabaseConnection::from_config(&config.database).await?;
    database.migrate().await?;
    let repository: Arc<dyn CrawlRepository> = Arc::new(SqliteCrawlRepository::new(database.pool().clone()));

    let cancel = CancellationToken::new();
    let coordinator = Arc::new(build_coordinator(&config, repository.clone(), cancel.clone())?);

    match command {
        Command::Status { limit } => {
            for task in repository.latest_crawl_tasks(limit).await? {
                println!(
                    "{:<28} {:<10} {:<8} {:<10} products={:<5} reviews={:<6} errors={:<4} started={}",
                    task.task_name,
                    task.status,
                    task.platform,
                    task.category,
                    task.products_found,
                    task.reviews_found,
                    task.errors_count,
                    task.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Crawl { platform, category } => {
            let mut request = CrawlRequest::from_config("manual_crawl", &config.platform);
            if let Some(platform) = platform {
                request.platforms = vec![platform];
            }
            if let Some(category) = category {
                request.category = category;
            }

            let scheduler = CrawlScheduler::new(coordinator.clone(), config.schedule.clone(), request.clone())?;
            let run = scheduler.trigger_now(&request);
            tokio::pin!(run);
            let outcome = tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Interrupt received, stopping crawl");
                    coordinator.stop();
                    run.await
                }
            };

            match outcome {
                TriggerOutcome::Finished(task) => println!(
                    "{} {}: {} products, {} reviews, {} errors",
                    task.task_name, task.status, task.products_found, task.reviews_found, task.errors_count
                ),
                TriggerOutcome::Skipped => println!("Skipped: a crawl for the same platform and category is running"),
            }
        }
        Command::Serve => {
            let request = CrawlRequest::from_config("scheduled_crawl", &config.platform);
            let scheduler = CrawlScheduler::new(coordinator, config.schedule.clone(), request)?;
            scheduler.start();
            info!("🚀 SpiderMail running, press Ctrl-C to stop");

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            scheduler.stop().await;
        }
    }

    database.pool().close().await;
    Ok(())
}
