use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coalesce::config::CacheConfig;
use coalesce::{CacheEntry, CoalescingCache, SharedScopeFactory};
use coalesce_test::TestProducer;
use rand::Rng;
use serde::Deserialize;
use tokio::runtime::Handle;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys the operations are spread across.
    pub keys: usize,
    /// How long every producer invocation takes.
    #[serde(default, with = "humantime_serde")]
    pub producer_latency: Duration,
    #[serde(default)]
    pub mix: OperationMix,
}

/// Relative weights of the operations performed by a workload.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct OperationMix {
    pub get: u32,
    pub set: u32,
    pub remove: u32,
    pub transform: u32,
}

impl Default for OperationMix {
    fn default() -> Self {
        Self {
            get: 1,
            set: 0,
            remove: 0,
            transform: 0,
        }
    }
}

impl OperationMix {
    fn total(&self) -> u32 {
        self.get + self.set + self.remove + self.transform
    }

    fn pick(&self, rng: &mut impl Rng) -> Operation {
        let mut roll = rng.random_range(0..self.total());
        for (weight, operation) in [
            (self.get, Operation::Get),
            (self.set, Operation::Set),
            (self.remove, Operation::Remove),
            (self.transform, Operation::Transform),
        ] {
            if roll < weight {
                return operation;
            }
            roll -= weight;
        }
        Operation::Get
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Operation {
    Get,
    Set,
    Remove,
    Transform,
}

type StressCache = CoalescingCache<SharedScopeFactory<Arc<TestProducer>>>;

pub struct PreparedWorkload {
    pub concurrency: usize,
    pub keys: usize,
    mix: OperationMix,
    pub producer: Arc<TestProducer>,
    cache: StressCache,
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    config: &CacheConfig,
    runtime: Handle,
) -> Result<PreparedWorkload> {
    if workload.concurrency == 0 || workload.keys == 0 {
        anyhow::bail!("workload {index} needs a non-zero concurrency and number of keys");
    }
    if workload.mix.total() == 0 {
        anyhow::bail!("workload {index} has no operations");
    }

    let producer = TestProducer::with_latency(0, workload.producer_latency);
    let config = CacheConfig {
        name: format!("{}-{index}", config.name),
        ..config.clone()
    };
    let cache = CoalescingCache::from_producer(Arc::clone(&producer), &config, runtime);

    Ok(PreparedWorkload {
        concurrency: workload.concurrency,
        keys: workload.keys,
        mix: workload.mix,
        producer,
        cache,
    })
}

impl PreparedWorkload {
    /// Picks a random operation on a random key.
    pub fn next_operation(&self) -> (Operation, String) {
        let mut rng = rand::rng();
        let operation = self.mix.pick(&mut rng);
        (operation, key(rng.random_range(0..self.keys)))
    }

    /// Fetches every key once.
    pub async fn warmup(&self) -> usize {
        let fetches = (0..self.keys).map(|i| self.cache.get(key(i)));
        futures::future::join_all(fetches)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count()
    }

    pub async fn process(&self, operation: Operation, key: String) -> CacheEntry {
        match operation {
            Operation::Get => self.cache.get(key).await.map(drop),
            Operation::Set => self.cache.set(&key, rand::random()),
            Operation::Remove => self.cache.remove(&key),
            Operation::Transform => self
                .cache
                .transform(key, |value| async move { value.wrapping_add(1) })
                .await
                .map(drop),
        }
    }
}

fn key(index: usize) -> String {
    format!("key-{index}")
}
