//! In-process `CrawlRepository`
//!
//! Used for dry runs and tests. Holds everything behind one `RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{
    CrawlRepository, CrawlTask, PersistenceError, Platform, PriceSnapshot, Product, Review, ReviewInsert, TaskHandle,
};

#[derive(Debug, Default)]
struct Store {
    products: HashMap<(Platform, String), Product>,
    reviews: HashMap<(Platform, String), Review>,
    price_history: Vec<PriceSnapshot>,
    tasks: Vec<(TaskHandle, CrawlTask)>,
    next_task_id: i64,
}

#[derive(Debug)]
pub struct InMemoryCrawlRepository {
    store: RwLock<Store>,
    available: AtomicBool,
}

impl Default for InMemoryCrawlRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCrawlRepository {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable("in-memory store offline".into()))
        }
    }

    pub async fn products(&self) -> Vec<Product> {
        let store = self.store.read().await;
        let mut products: Vec<Product> = store.products.values().cloned().collect();
        products.sort_by(|a, b| (a.platform, &a.product_id).cmp(&(b.platform, &b.product_id)));
        products
    }

    pub async fn reviews(&self) -> Vec<Review> {
        let store = self.store.read().await;
        let mut reviews: Vec<Review> = store.reviews.values().cloned().collect();
        reviews.sort_by(|a, b| (a.platform, &a.review_id).cmp(&(b.platform, &b.review_id)));
        reviews
    }

    pub async fn task(&self, handle: TaskHandle) -> Option<CrawlTask> {
        let store = self.store.read().await;
        store.tasks.iter().find(|(h, _)| *h == handle).map(|(_, task)| task.clone())
    }
}

#[async_trait]
impl CrawlRepository for InMemoryCrawlRepository {
    async fn ping(&self) -> Result<(), PersistenceError> {
        self.check_available()
    }

    async fn upsert_product(&self, product: &Product) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        store
            .products
            .insert((product.platform, product.product_id.clone()), product.clone());
        Ok(())
    }

    async fn insert_review(&self, review: &Review) -> Result<ReviewInsert, PersistenceError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let key = (review.platform, review.review_id.clone());
        if let Some(existing) = store.reviews.get_mut(&key) {
            existing.helpful_count = review.helpful_count;
            return Ok(ReviewInsert::AlreadyPresent);
        }
        store.reviews.insert(key, review.clone());
        Ok(ReviewInsert::Inserted)
    }

    async fn append_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.store.write().await.price_history.push(snapshot.clone());
        Ok(())
    }

    async fn create_crawl_task(
        &self,
        task_name: &str,
        platform: &str,
        category: &str,
        start_time: DateTime<Utc>,
    ) -> Result<TaskHandle, PersistenceError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        store.next_task_id += 1;
        let handle = TaskHandle(store.next_task_id);
        let mut task = CrawlTask::start(task_name, platform, category, start_time);
        task.handle = Some(handle);
        store.tasks.push((handle, task));
        Ok(handle)
    }

    async fn update_crawl_task(&self, handle: TaskHandle, task: &CrawlTask) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let (_, stored) = store
            .tasks
            .iter_mut()
            .find(|(h, _)| *h == handle)
            .ok_or(PersistenceError::UnknownTask(handle.0))?;
        *stored = CrawlTask {
            handle: Some(handle),
            ..task.clone()
        };
        Ok(())
    }

    async fn latest_crawl_tasks(&self, limit: u32) -> Result<Vec<CrawlTask>, PersistenceError> {
        self.check_available()?;
        let store = self.store.read().await;
        let mut tasks: Vec<CrawlTask> = store.tasks.iter().map(|(_, task)| task.clone()).collect();
        tasks.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.handle.map(|h| h.0).cmp(&a.handle.map(|h| h.0))));
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn prune_crawl_tasks(&self, before: DateTime<Utc>) -> Result<u64, PersistenceError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let original = store.tasks.len();
        store
            .tasks
            .retain(|(_, task)| task.start_time >= before || !task.status.is_terminal());
        Ok((original - store.tasks.len()) as u64)
    }

    async fn price_history(
        &self,
        platform: Platform,
        product_id: &str,
    ) -> Result<Vec<PriceSnapshot>, PersistenceError> {
        self.check_available()?;
        let store = self.store.read().await;
        Ok(store
            .price_history
            .iter()
            .filter(|s| s.platform == platform && s.product_id == product_id)
            .cloned()
            .collect())
    }
}
