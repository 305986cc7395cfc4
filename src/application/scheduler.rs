//! Crawl scheduler
//!
//! Starts coordinator runs at a fixed local time each day or on demand, and
//! prunes old task records in the background. At most one run per
//! (platform, category) is active; an overlapping trigger is skipped, never
//! queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::crawl_coordinator::{CrawlRequest, CrawlTaskCoordinator};
use crate::domain::{ConfigError, CrawlRepository, CrawlTask, PersistenceError, Platform, TaskStatus};
use crate::infrastructure::config::{DailyTime, ScheduleConfig};

/// Result of asking the scheduler for a run
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The run happened; the task is in a terminal state
    Finished(CrawlTask),
    /// Another run for an overlapping platform/category was still active
    Skipped,
}

type ActiveRuns = Arc<Mutex<HashSet<(Platform, String)>>>;

/// Exclusivity slot for one run, released on drop
struct RunGuard {
    active: ActiveRuns,
    keys: Vec<(Platform, String)>,
}

impl RunGuard {
    /// Claim every (platform, category) of `request`, or nothing
    fn claim(active: &ActiveRuns, request: &CrawlRequest) -> Option<Self> {
        let keys: Vec<(Platform, String)> = request
            .platforms
            .iter()
            .map(|platform| (*platform, request.category.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut running = active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if keys.iter().any(|key| running.contains(key)) {
            return None;
        }
        running.extend(keys.iter().cloned());
        Some(Self {
            active: Arc::clone(active),
            keys,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in &self.keys {
            running.remove(key);
        }
    }
}

struct SchedulerState {
    coordinator: Arc<CrawlTaskCoordinator>,
    schedule: ScheduleConfig,
    daily: DailyTime,
    active: ActiveRuns,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SchedulerState {
    async fn trigger(&self, request: &CrawlRequest) -> TriggerOutcome {
        let Some(_guard) = RunGuard::claim(&self.active, request) else {
            warn!(
                "⏭️ Skipping crawl '{}': a run for [{}] '{}' is still active",
                request.task_name,
                request.platform_label(),
                request.category
            );
            return TriggerOutcome::Skipped;
        };
        TriggerOutcome::Finished(self.coordinator.run(request).await)
    }

    /// Scheduled run, retried with a linear delay while it keeps failing
    async fn scheduled(&self, request: &CrawlRequest) -> Option<CrawlTask> {
        let Some(_guard) = RunGuard::claim(&self.active, request) else {
            warn!(
                "⏭️ Skipping scheduled crawl: previous run for [{}] '{}' still active",
                request.platform_label(),
                request.category
            );
            return None;
        };

        let retries = if self.schedule.retry_on_failure {
            self.schedule.max_retry_attempts
        } else {
            0
        };

        let mut task = self.coordinator.run(request).await;
        for attempt in 1..=retries {
            if task.status == TaskStatus::Completed || self.shutdown.is_cancelled() {
                break;
            }

            let delay = Duration::from_secs(self.schedule.retry_delay_secs.saturating_mul(u64::from(attempt)));
            warn!(
                "🔁 Scheduled crawl '{}' failed, retry {}/{} in {:?}",
                request.task_name, attempt, retries, delay
            );
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            task = self.coordinator.run(request).await;
        }

        if task.status == TaskStatus::Failed {
            error!("❌ Scheduled crawl '{}' ended failed", request.task_name);
        }
        Some(task)
    }

    async fn prune(&self) -> Result<u64, PersistenceError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.schedule.task_retention_days));
        let removed = self.coordinator.repository().prune_crawl_tasks(cutoff).await?;
        if removed > 0 {
            info!("🧹 Removed {} crawl tasks older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

/// Owns the timer loops; created and stopped by the process entry point
pub struct CrawlScheduler {
    state: Arc<SchedulerState>,
    request: CrawlRequest,
    started: Mutex<bool>,
}

impl CrawlScheduler {
    /// `request` is what every scheduled trigger runs
    pub fn new(
        coordinator: Arc<CrawlTaskCoordinator>,
        schedule: ScheduleConfig,
        request: CrawlRequest,
    ) -> Result<Self, ConfigError> {
        let daily = schedule.daily_time()?;
        Ok(Self {
            state: Arc::new(SchedulerState {
                coordinator,
                schedule,
                daily,
                active: Arc::new(Mutex::new(HashSet::new())),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            request,
            started: Mutex::new(false),
        })
    }

    /// Next scheduled trigger after `now`
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.state.daily.next_after(now)
    }

    pub fn is_active(&self, platform: Platform, category: &str) -> bool {
        self.state
            .active
            .lock()
            .map(|running| running.contains(&(platform, category.to_string())))
            .unwrap_or(false)
    }

    /// Run now and wait for the outcome
    pub async fn trigger_now(&self, request: &CrawlRequest) -> TriggerOutcome {
        info!("▶️ Manual crawl '{}' requested", request.task_name);
        self.state.trigger(request).await
    }

    /// One scheduled-style run with retry-on-failure, `None` when skipped
    pub async fn run_scheduled(&self, request: &CrawlRequest) -> Option<CrawlTask> {
        self.state.scheduled(request).await
    }

    /// Delete task records past the retention window
    pub async fn run_maintenance(&self) -> Result<u64, PersistenceError> {
        self.state.prune().await
    }

    /// Spawn the daily trigger (when enabled) and the maintenance loop
    pub fn start(&self) {
        let Ok(mut started) = self.started.lock() else {
            return;
        };
        if *started {
            warn!("Scheduler already started");
            return;
        }
        *started = true;

        let state = &self.state;
        if state.schedule.enabled {
            info!(
                "⏰ Daily crawl scheduled at {} (UTC{})",
                state.daily.time.format("%H:%M"),
                state.daily.offset
            );
            state.tracker.spawn(daily_loop(Arc::clone(state), self.request.clone()));
        } else {
            info!("⏰ Daily crawl disabled");
        }
        state.tracker.spawn(maintenance_loop(Arc::clone(state)));
    }

    /// Stop the loops, signal the running crawl and wait for everything to wind down
    pub async fn stop(&self) {
        info!("🛑 Stopping scheduler");
        self.state.shutdown.cancel();
        self.state.coordinator.stop();
        self.state.tracker.close();
        self.state.tracker.wait().await;
        info!("✅ Scheduler stopped");
    }
}

/// Next slot to fire; never the slot already fired, even when the timer wakes early
fn following_slot(daily: &DailyTime, now: DateTime<Utc>, fired: Option<DateTime<Utc>>) -> DateTime<Utc> {
    daily.next_after(fired.map_or(now, |fired| fired.max(now)))
}

async fn daily_loop(state: Arc<SchedulerState>, request: CrawlRequest) {
    let mut fired = None;
    loop {
        let now = Utc::now();
        let next = following_slot(&state.daily, now, fired);
        info!("⏰ Next scheduled crawl at {}", next.with_timezone(&state.daily.offset));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        fired = Some(next);

        let mut request = request.clone();
        request.task_name = format!("{}_{}", request.task_name, next.with_timezone(&state.daily.offset).format("%Y%m%d"));
        // the loop only starts runs; it never waits on one
        let run_state = Arc::clone(&state);
        state.tracker.spawn(async move {
            run_state.scheduled(&request).await;
        });
    }
}

async fn maintenance_loop(state: Arc<SchedulerState>) {
    let period = Duration::from_secs(state.schedule.maintenance_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = state.prune().await {
                    warn!("🧹 Task maintenance failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProductSummary, RawProduct, RawReview, Spider, SpiderError};
    use crate::infrastructure::memory_repository::InMemoryCrawlRepository;
    use crate::infrastructure::retry_manager::{RetryController, RetryPolicy};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Notify;

    /// Search blocks until released, then reports no results
    struct GatedSpider {
        entered: Notify,
        release: CancellationToken,
    }

    #[async_trait]
    impl Spider for GatedSpider {
        fn platform(&self) -> Platform {
            Platform::Jd
        }

        async fn search_products(&self, _keyword: &str, _page: u32) -> Result<Vec<ProductSummary>, SpiderError> {
            self.entered.notify_one();
            self.release.cancelled().await;
            Ok(Vec::new())
        }

        async fn get_product_details(&self, product_id: &str) -> Result<RawProduct, SpiderError> {
            Err(SpiderError::not_found(Platform::Jd, product_id))
        }

        async fn get_product_reviews(&self, _product_id: &str, _page: u32) -> Result<Vec<RawReview>, SpiderError> {
            Ok(Vec::new())
        }
    }

    fn schedule() -> ScheduleConfig {
        ScheduleConfig {
            retry_delay_secs: 10,
            max_retry_attempts: 2,
            ..ScheduleConfig::default()
        }
    }

    fn setup(spider: Arc<GatedSpider>) -> (Arc<CrawlScheduler>, Arc<InMemoryCrawlRepository>) {
        let repo = Arc::new(InMemoryCrawlRepository::new());
        let coordinator = CrawlTaskCoordinator::new(vec![spider], repo.clone())
            .with_workers(2)
            .with_persistence_retry(RetryController::new(
                RetryPolicy::new(0, Duration::from_millis(1)).without_jitter(),
            ));
        let request = CrawlRequest::new("scheduled_crawl", vec![Platform::Jd], "手机");
        let scheduler = CrawlScheduler::new(Arc::new(coordinator), schedule(), request).unwrap();
        (Arc::new(scheduler), repo)
    }

    fn gated() -> Arc<GatedSpider> {
        Arc::new(GatedSpider {
            entered: Notify::new(),
            release: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let spider = gated();
        let (scheduler, repo) = setup(spider.clone());
        let request = CrawlRequest::new("manual", vec![Platform::Jd], "手机");

        let first = {
            let scheduler = scheduler.clone();
            let request = request.clone();
            tokio::spawn(async move { scheduler.trigger_now(&request).await })
        };
        spider.entered.notified().await;
        assert!(scheduler.is_active(Platform::Jd, "手机"));

        assert_eq!(scheduler.trigger_now(&request).await, TriggerOutcome::Skipped);

        spider.release.cancel();
        let TriggerOutcome::Finished(task) = first.await.unwrap() else {
            panic!("first run should finish");
        };
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(repo.latest_crawl_tasks(10).await.unwrap().len(), 1);
        assert!(!scheduler.is_active(Platform::Jd, "手机"));
    }

    #[tokio::test]
    async fn test_other_category_runs_alongside() {
        let spider = gated();
        let (scheduler, _) = setup(spider.clone());

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .trigger_now(&CrawlRequest::new("a", vec![Platform::Jd], "手机"))
                    .await
            })
        };
        spider.entered.notified().await;

        let second = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .trigger_now(&CrawlRequest::new("b", vec![Platform::Jd], "耳机"))
                    .await
            })
        };
        spider.entered.notified().await;
        assert!(scheduler.is_active(Platform::Jd, "耳机"));

        spider.release.cancel();
        assert!(matches!(first.await.unwrap(), TriggerOutcome::Finished(_)));
        assert!(matches!(second.await.unwrap(), TriggerOutcome::Finished(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scheduled_run_is_retried() {
        let (scheduler, repo) = setup(gated());
        // no spider registered for taobao, so every attempt fails
        let request = CrawlRequest::new("scheduled_crawl", vec![Platform::Taobao], "手机");

        let task = scheduler.run_scheduled(&request).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(repo.latest_crawl_tasks(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_maintenance_prunes_expired_tasks() {
        let (scheduler, repo) = setup(gated());
        let old = Utc::now() - chrono::Duration::days(45);
        let handle = repo.create_crawl_task("old", "jd", "手机", old).await.unwrap();
        let mut finished = CrawlTask::start("old", "jd", "手机", old);
        finished.complete(old + chrono::Duration::minutes(5)).unwrap();
        repo.update_crawl_task(handle, &finished).await.unwrap();
        // still running, kept regardless of age
        repo.create_crawl_task("stuck", "jd", "手机", old).await.unwrap();
        repo.create_crawl_task("new", "jd", "手机", Utc::now()).await.unwrap();

        assert_eq!(scheduler.run_maintenance().await.unwrap(), 1);
        assert_eq!(repo.latest_crawl_tasks(10).await.unwrap().len(), 2);
    }

    #[test]
    fn test_early_wakeup_does_not_refire_same_slot() {
        let daily = DailyTime::parse("02:00", "+08:00").unwrap();
        let slot = Utc.with_ymd_and_hms(2026, 10, 16, 18, 0, 0).unwrap();
        let tomorrow = slot + chrono::Days::new(1);

        assert_eq!(following_slot(&daily, slot - chrono::Duration::hours(1), None), slot);
        // timer woke a few ms before the wall clock reached the slot it fired
        let early = slot - chrono::Duration::milliseconds(3);
        assert_eq!(following_slot(&daily, early, Some(slot)), tomorrow);
        assert_eq!(following_slot(&daily, slot, Some(slot)), tomorrow);
    }

    #[test]
    fn test_one_slot_per_day_across_a_week() {
        let daily = DailyTime::parse("02:00", "+08:00").unwrap();
        let mut now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let mut fired = None;
        let mut slots = Vec::new();
        for _ in 0..7 {
            let next = following_slot(&daily, now, fired);
            slots.push(next);
            fired = Some(next);
            // each wake-up lands slightly before the slot
            now = next - chrono::Duration::milliseconds(5);
        }

        for pair in slots.windows(2) {
            assert_eq!(pair[1] - pair[0], chrono::Duration::days(1));
        }
    }

    #[tokio::test]
    async fn test_stop_ends_loops() {
        let (scheduler, _) = setup(gated());
        scheduler.start();
        scheduler.start();
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .unwrap();
    }
}
