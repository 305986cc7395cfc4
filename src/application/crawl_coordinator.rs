//! Crawl task coordinator
//!
//! Runs one crawl task end to end. A fixed pool of workers drains a shared
//! work queue: search pages first, which fan out into one work item per
//! product (details, price snapshot, review pages). Workers never touch the
//! `CrawlTask`; they report outcomes over a channel and the coordinator,
//! its only writer, folds them into the counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::data_cleaner::{CleaningPipeline, Rejection};
use crate::domain::{
    ConfigError, CrawlRepository, CrawlTask, PersistenceError, Platform, PriceSnapshot, ProductSummary, ReviewInsert,
    Spider, TaskHandle, TerminalError,
};
use crate::infrastructure::config::{PlatformConfig, SpiderConfig, defaults};
use crate::infrastructure::retry_manager::{RetryController, RetryPolicy};

/// Reason recorded when a run is stopped from outside
pub const CANCELLED_REASON: &str = "cancelled";

/// What one crawl task covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    pub task_name: String,
    pub platforms: Vec<Platform>,
    /// Search keyword, also stored as the product category
    pub category: String,
    pub max_pages: u32,
    pub max_review_pages: u32,
}

impl CrawlRequest {
    pub fn new(task_name: impl Into<String>, platforms: Vec<Platform>, category: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            platforms,
            category: category.into(),
            max_pages: defaults::MAX_PAGES,
            max_review_pages: defaults::MAX_REVIEW_PAGES,
        }
    }

    pub fn from_config(task_name: impl Into<String>, config: &PlatformConfig) -> Self {
        Self::new(task_name, config.platforms.clone(), config.default_category.clone())
            .with_pages(config.max_pages, config.max_review_pages)
    }

    #[must_use]
    pub const fn with_pages(mut self, max_pages: u32, max_review_pages: u32) -> Self {
        self.max_pages = max_pages;
        self.max_review_pages = max_review_pages;
        self
    }

    /// Platform column of the task record: "all" or a comma-separated list
    pub fn platform_label(&self) -> String {
        let distinct: HashSet<Platform> = self.platforms.iter().copied().collect();
        if distinct.len() == Platform::ALL.len() {
            return "all".to_string();
        }
        self.platforms.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone)]
enum WorkItem {
    Search { platform: Platform, page: u32 },
    Product { platform: Platform, summary: ProductSummary },
}

/// Outcome reported by a worker
#[derive(Debug)]
enum WorkEvent {
    ProductStored,
    ReviewsStored(u32),
    Error(String),
}

/// FIFO queue that knows when every pushed item has been processed
struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    ready: Semaphore,
    outstanding: AtomicUsize,
    drained: CancellationToken,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            outstanding: AtomicUsize::new(0),
            drained: CancellationToken::new(),
        }
    }

    async fn push(&self, item: WorkItem) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.items.lock().await.push_back(item);
        self.ready.add_permits(1);
    }

    /// Next item, or `None` once the queue is drained or `stop` fires
    async fn next(&self, stop: &CancellationToken) -> Option<WorkItem> {
        tokio::select! {
            biased;
            () = stop.cancelled() => None,
            () = self.drained.cancelled() => None,
            permit = self.ready.acquire() => {
                permit.ok()?.forget();
                self.items.lock().await.pop_front()
            }
        }
    }

    /// Mark one popped item as processed; follow-up items must be pushed first
    fn done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.cancel();
        }
    }
}

/// Shared state of one run, borrowed by every worker
struct RunContext<'a> {
    request: &'a CrawlRequest,
    spiders: &'a HashMap<Platform, Arc<dyn Spider>>,
    repository: &'a dyn CrawlRepository,
    pipeline: &'a CleaningPipeline,
    retry: &'a RetryController,
    stop: &'a CancellationToken,
    queue: WorkQueue,
    seen: Mutex<HashSet<(Platform, String)>>,
    events: mpsc::UnboundedSender<WorkEvent>,
}

impl RunContext<'_> {
    async fn worker(&self, worker_id: usize) {
        debug!("👷 Worker {} started", worker_id);
        while let Some(item) = self.queue.next(self.stop).await {
            match item {
                WorkItem::Search { platform, page } => self.search(platform, page).await,
                WorkItem::Product { platform, summary } => self.product(platform, &summary).await,
            }
            self.queue.done();
        }
        debug!("👷 Worker {} finished", worker_id);
    }

    fn send(&self, event: WorkEvent) {
        if self.events.send(event).is_err() {
            debug!("Event channel closed, dropping worker event");
        }
    }

    fn report(&self, message: String) {
        warn!("❌ {}", message);
        self.send(WorkEvent::Error(message));
    }

    fn report_rejections(&self, rejections: &[Rejection]) {
        for rejection in rejections {
            self.report(rejection.to_string());
        }
    }

    async fn persist<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, TerminalError<PersistenceError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PersistenceError>>,
    {
        self.retry.execute(label, |_| operation()).await
    }

    async fn search(&self, platform: Platform, page: u32) {
        let Some(spider) = self.spiders.get(&platform) else {
            return;
        };
        let category = &self.request.category;

        let summaries = match spider.search_products(category, page).await {
            Ok(summaries) => summaries,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                self.report(format!("[{platform}] search '{category}' page {page}: {e}"));
                return;
            }
        };

        if summaries.is_empty() {
            info!("📭 [{}] No results on page {}, search finished", platform, page);
            return;
        }

        let total = summaries.len();
        let fresh: Vec<ProductSummary> = {
            let mut seen = self.seen.lock().await;
            summaries
                .into_iter()
                .filter(|summary| seen.insert((platform, summary.product_id.clone())))
                .collect()
        };
        info!("📦 [{}] Page {}: {} products ({} new)", platform, page, total, fresh.len());

        for summary in fresh {
            self.queue.push(WorkItem::Product { platform, summary }).await;
        }
        if page < self.request.max_pages {
            self.queue.push(WorkItem::Search { platform, page: page + 1 }).await;
        }
    }

    async fn product(&self, platform: Platform, summary: &ProductSummary) {
        let Some(spider) = self.spiders.get(&platform) else {
            return;
        };
        let product_id = summary.product_id.as_str();

        let mut raw = match spider.get_product_details(product_id).await {
            Ok(raw) => raw,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                self.report(format!("[{platform}] product {product_id}: {e}"));
                return;
            }
        };

        // Fill what the detail page left out from the search hit
        raw.category.get_or_insert_with(|| self.request.category.clone());
        if raw.title.is_none() && !summary.title.is_empty() {
            raw.title = Some(summary.title.clone());
        }
        raw.price = raw.price.or(summary.price);
        raw.source_url.get_or_insert_with(|| summary.url.clone());

        let batch = self.pipeline.clean_products(vec![raw]);
        self.report_rejections(&batch.rejections);
        let Some(product) = batch.valid.into_iter().next() else {
            return;
        };

        if let Err(e) = self.persist("upsert product", || self.repository.upsert_product(&product)).await {
            self.report(format!("[{platform}] saving product {product_id}: {e}"));
            return;
        }
        self.send(WorkEvent::ProductStored);

        let snapshot = PriceSnapshot::from_product(&product, Utc::now());
        if let Err(e) = self
            .persist("append price snapshot", || self.repository.append_price_snapshot(&snapshot))
            .await
        {
            self.report(format!("[{platform}] price snapshot for {product_id}: {e}"));
        }

        self.reviews(spider.as_ref(), platform, product_id).await;
    }

    /// Review pages in order, stopping at the first empty or failed page
    async fn reviews(&self, spider: &dyn Spider, platform: Platform, product_id: &str) {
        for page in 1..=self.request.max_review_pages {
            if self.stop.is_cancelled() {
                return;
            }

            let raw = match spider.get_product_reviews(product_id, page).await {
                Ok(raw) if raw.is_empty() => return,
                Ok(raw) => raw,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    self.report(format!("[{platform}] reviews of {product_id} page {page}: {e}"));
                    return;
                }
            };

            let batch = self.pipeline.clean_reviews(raw);
            self.report_rejections(&batch.rejections);

            let mut stored = 0;
            for review in &batch.valid {
                match self.persist("insert review", || self.repository.insert_review(review)).await {
                    Ok(ReviewInsert::Inserted) => stored += 1,
                    Ok(ReviewInsert::AlreadyPresent) => {
                        debug!("Review {} already stored, refreshed helpful count", review.review_id);
                        stored += 1;
                    }
                    Err(e) => self.report(format!("[{platform}] saving review {}: {e}", review.review_id)),
                }
            }
            if stored > 0 {
                self.send(WorkEvent::ReviewsStored(stored));
            }
        }
    }
}

/// Runs crawl tasks over a fixed set of spiders
pub struct CrawlTaskCoordinator {
    spiders: HashMap<Platform, Arc<dyn Spider>>,
    repository: Arc<dyn CrawlRepository>,
    pipeline: CleaningPipeline,
    persistence_retry: RetryController,
    workers: usize,
    cancel: CancellationToken,
}

impl CrawlTaskCoordinator {
    pub fn new(spiders: Vec<Arc<dyn Spider>>, repository: Arc<dyn CrawlRepository>) -> Self {
        Self {
            spiders: spiders.into_iter().map(|spider| (spider.platform(), spider)).collect(),
            repository,
            pipeline: CleaningPipeline::new(),
            persistence_retry: RetryController::default(),
            workers: defaults::CONCURRENT_REQUESTS,
            cancel: CancellationToken::new(),
        }
    }

    /// Worker pool size and persistence retries taken from spider settings
    pub fn from_config(
        spiders: Vec<Arc<dyn Spider>>,
        repository: Arc<dyn CrawlRepository>,
        config: &SpiderConfig,
    ) -> Self {
        Self::new(spiders, repository)
            .with_workers(config.concurrent_requests)
            .with_persistence_retry(RetryController::new(RetryPolicy::new(
                config.max_retries,
                config.request_delay(),
            )))
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_persistence_retry(mut self, retry: RetryController) -> Self {
        self.persistence_retry = retry;
        self
    }

    /// Stop signal checked between work items. Share it with the request
    /// executor so no new requests start once it fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn repository(&self) -> &Arc<dyn CrawlRepository> {
        &self.repository
    }

    /// Request the running task (and any later one) to stop
    pub fn stop(&self) {
        info!("🛑 Stop requested for crawl coordinator");
        self.cancel.cancel();
    }

    fn validate(&self, request: &CrawlRequest) -> Result<(), ConfigError> {
        if request.platforms.is_empty() {
            return Err(ConfigError::invalid("platforms", "at least one platform is required"));
        }
        if let Some(platform) = request.platforms.iter().find(|p| !self.spiders.contains_key(*p)) {
            return Err(ConfigError::NoSpider(*platform));
        }
        if request.category.trim().is_empty() {
            return Err(ConfigError::invalid("category", "must not be empty"));
        }
        if request.max_pages == 0 {
            return Err(ConfigError::invalid("max_pages", "must be >= 1"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("concurrent_requests", "must be >= 1"));
        }
        Ok(())
    }

    /// Run one crawl task to a terminal state and return its final record.
    ///
    /// Item-level failures are counted in the task; only an unusable store or
    /// configuration (or a stop request) ends it as failed.
    pub async fn run(&self, request: &CrawlRequest) -> CrawlTask {
        let mut task = CrawlTask::start(
            &request.task_name,
            request.platform_label(),
            &request.category,
            Utc::now(),
        );
        info!(
            "🚀 Starting crawl task '{}' [{}] category '{}'",
            task.task_name, task.platform, task.category
        );

        let handle = match self.open_task(&task).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("❌ Crawl task '{}' cannot start: {}", task.task_name, e);
                fail(&mut task, format!("persistence unavailable: {e}"));
                return task;
            }
        };
        task.handle = Some(handle);

        if let Err(e) = self.validate(request) {
            error!("❌ Crawl task '{}' misconfigured: {}", task.task_name, e);
            fail(&mut task, format!("configuration invalid: {e}"));
            self.save(handle, &task).await;
            return task;
        }

        self.execute(request, &mut task).await;

        if self.cancel.is_cancelled() {
            warn!("🛑 Crawl task '{}' stopped before finishing", task.task_name);
            fail(&mut task, CANCELLED_REASON);
        } else if let Err(e) = task.complete(Utc::now()) {
            warn!("Crawl task '{}' already finished: {}", task.task_name, e);
        }
        self.save(handle, &task).await;

        info!(
            "🏁 Crawl task '{}' {}: {} products, {} reviews, {} errors in {} ms",
            task.task_name,
            task.status,
            task.products_found,
            task.reviews_found,
            task.errors_count,
            task.duration_ms.unwrap_or_default()
        );
        task
    }

    async fn open_task(&self, task: &CrawlTask) -> Result<TaskHandle, TerminalError<PersistenceError>> {
        let repository = self.repository.as_ref();
        self.persistence_retry.execute("ping store", |_| repository.ping()).await?;
        self.persistence_retry
            .execute("create crawl task", |_| {
                repository.create_crawl_task(&task.task_name, &task.platform, &task.category, task.start_time)
            })
            .await
    }

    async fn save(&self, handle: TaskHandle, task: &CrawlTask) {
        let repository = self.repository.as_ref();
        if let Err(e) = self
            .persistence_retry
            .execute("update crawl task", |_| repository.update_crawl_task(handle, task))
            .await
        {
            error!("❌ Could not record crawl task '{}' outcome: {}", task.task_name, e);
        }
    }

    async fn execute(&self, request: &CrawlRequest, task: &mut CrawlTask) {
        let (events, mut receiver) = mpsc::unbounded_channel();
        let context = RunContext {
            request,
            spiders: &self.spiders,
            repository: self.repository.as_ref(),
            pipeline: &self.pipeline,
            retry: &self.persistence_retry,
            stop: &self.cancel,
            queue: WorkQueue::new(),
            seen: Mutex::new(HashSet::new()),
            events,
        };

        let mut seeded = HashSet::new();
        for platform in &request.platforms {
            if seeded.insert(*platform) {
                context.queue.push(WorkItem::Search { platform: *platform, page: 1 }).await;
            }
        }

        info!("🚀 Starting {} workers", self.workers);
        {
            let workers = futures::future::join_all((0..self.workers).map(|id| context.worker(id)));
            tokio::pin!(workers);

            loop {
                tokio::select! {
                    Some(event) = receiver.recv() => apply(task, event),
                    _ = &mut workers => break,
                }
            }
        }

        // closes the channel so the drain below ends
        drop(context);
        while let Some(event) = receiver.recv().await {
            apply(task, event);
        }
    }
}

fn apply(task: &mut CrawlTask, event: WorkEvent) {
    match event {
        WorkEvent::ProductStored => task.record_products(1),
        WorkEvent::ReviewsStored(count) => task.record_reviews(count),
        WorkEvent::Error(message) => task.record_error(message),
    }
}

fn fail(task: &mut CrawlTask, reason: impl Into<String>) {
    if let Err(e) = task.fail(Utc::now(), reason) {
        warn!("Crawl task '{}' already finished: {}", task.task_name, e);
    }
}
