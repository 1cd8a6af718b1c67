//! In-memory `RemoteStore` with scripted failures, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, ListParams, RemoteStore};
use crate::models::{Collection, Record};

#[derive(Default)]
pub(crate) struct FakeRemote {
    records: Mutex<HashMap<(String, Collection), Vec<(String, Record)>>>,
    fetches: Mutex<HashMap<Collection, usize>>,
    writes: Mutex<usize>,
    failures: Mutex<VecDeque<ApiError>>,
    delay: Mutex<Duration>,
    next_id: AtomicU64,
}

impl FakeRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a record under `id`, bypassing counters.
    pub(crate) fn seed(&self, user_id: &str, id: &str, record: Record) {
        let mut records = self.records.lock().unwrap();
        let list = records
            .entry((user_id.to_string(), record.collection()))
            .or_default();
        list.retain(|(existing, _)| existing != id);
        list.push((id.to_string(), record));
    }

    pub(crate) fn records(&self, user_id: &str, collection: Collection) -> Vec<Record> {
        self.records
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), collection))
            .map(|list| list.iter().map(|(_, record)| record.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn fetch_count(&self, collection: Collection) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub(crate) fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    pub(crate) fn fail_next(&self, error: ApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn pause(&self) -> Result<(), ApiError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_id(id: &str, record: &Record) -> Record {
        let mut record = record.clone();
        match &mut record {
            Record::Transaction(tx) => tx.id = id.to_string(),
            Record::Category(category) => category.id = id.to_string(),
            Record::CategoryBudget(budget) => budget.id = id.to_string(),
            Record::PaymentMethod(method) => method.id = id.to_string(),
            Record::Settings(_) => {}
        }
        record
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn fetch_list(
        &self,
        collection: Collection,
        user_id: &str,
        params: &ListParams,
    ) -> Result<Vec<Record>, ApiError> {
        *self.fetches.lock().unwrap().entry(collection).or_default() += 1;
        self.pause().await?;

        let mut records = self.records(user_id, collection);
        if let Some(ref month) = params.month {
            records.retain(|record| match record {
                Record::CategoryBudget(budget) => &budget.month == month,
                _ => true,
            });
        }
        if collection == Collection::Transactions {
            records.sort_by_key(|record| match record {
                Record::Transaction(tx) => std::cmp::Reverse(tx.timestamp.unwrap_or(i64::MIN)),
                _ => std::cmp::Reverse(i64::MIN),
            });
        }
        if let Some(limit) = params.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn create(
        &self,
        collection: Collection,
        user_id: &str,
        record: &Record,
    ) -> Result<String, ApiError> {
        *self.writes.lock().unwrap() += 1;
        self.pause().await?;
        let id = format!("{}-{}", collection, self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.seed(user_id, &id, Self::with_id(&id, record));
        Ok(id)
    }

    async fn put(
        &self,
        _collection: Collection,
        user_id: &str,
        id: &str,
        record: &Record,
    ) -> Result<(), ApiError> {
        *self.writes.lock().unwrap() += 1;
        self.pause().await?;
        self.seed(user_id, id, Self::with_id(id, record));
        Ok(())
    }

    async fn delete(&self, collection: Collection, user_id: &str, id: &str) -> Result<(), ApiError> {
        *self.writes.lock().unwrap() += 1;
        self.pause().await?;
        if let Some(list) = self
            .records
            .lock()
            .unwrap()
            .get_mut(&(user_id.to_string(), collection))
        {
            list.retain(|(existing, _)| existing != id);
        }
        Ok(())
    }
}
