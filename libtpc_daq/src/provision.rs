//! Destination-collection provisioning and the rolling-collection worker.
//!
//! A freshly sharded collection starts life as a single chunk, so the first
//! seconds of a run would hammer one shard. Pre-splitting on module number
//! and migrating the chunks by hand spreads the boards before data arrives.
//! Under rotation a new cycle collection is provisioned ahead of every clock
//! wrap (one wrap is about 21 s), a little faster than real time so the
//! readers never catch up with an unprovisioned cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use super::constants::CLOCK_WRAP_SECONDS;
use super::error::ProvisionError;
use super::options::MongoOptions;
use super::store::{CollectionSpec, DocumentStore, StoreConnector};

/// Cycles provisioned ahead of the estimated current wrap.
const READAHEAD_CYCLES: f64 = 10.0;
/// Safety factor on elapsed time when estimating the current wrap.
const READAHEAD_FRACTION: f64 = 0.1;

/// Where each chunk of a pre-split collection should live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    /// Module numbers to split at, ascending.
    pub splits: Vec<i32>,
    /// (module representing the chunk, shard index) pairs, one per bucket.
    pub migrations: Vec<(i32, usize)>,
}

/// Bucket the boards evenly across the shards.
///
/// Boards are sorted ascending and cut into `ceil(n / shards)`-sized buckets;
/// the collection is split at every bucket boundary and bucket `k` migrates
/// to shard `k`.
pub fn bucket_split_plan(board_list: &[i32], n_shards: usize) -> Result<SplitPlan, ProvisionError> {
    if n_shards == 0 {
        return Err(ProvisionError::BadShardConfig("no shards configured".into()));
    }
    let mut sorted = board_list.to_vec();
    sorted.sort_unstable();
    let n_in_shard = (sorted.len() as f64 / n_shards as f64).ceil() as usize;
    if n_in_shard == 0 {
        return Err(ProvisionError::BadShardConfig(
            "zero digitizers per shard".into(),
        ));
    }
    let splits: Vec<i32> = sorted
        .iter()
        .copied()
        .skip(n_in_shard)
        .step_by(n_in_shard)
        .collect();
    let mut migrations = Vec::with_capacity(splits.len() + 1);
    migrations.push((sorted[0], 0));
    for (k, split) in splits.iter().enumerate() {
        migrations.push((*split, (k + 1) % n_shards));
    }
    Ok(SplitPlan { splits, migrations })
}

/// Create (and optionally shard) one destination collection.
///
/// `cycle` of -1 means an unrotated destination; otherwise the collection
/// name gets a `_<cycle>` suffix. The first cycle also publishes the base
/// name to `<db>.status` so downstream consumers can discover it.
/// `lots_of_splits` switches from bucketed pre-splits to one chunk per board.
pub fn provision_collection(
    store: &dyn DocumentStore,
    mongo_opts: &MongoOptions,
    collection: &str,
    board_list: &[i32],
    cycle: i32,
    lots_of_splits: bool,
) -> Result<(), ProvisionError> {
    let effective = if cycle != -1 {
        format!("{collection}_{cycle}")
    } else {
        collection.to_string()
    };
    if cycle <= 0 {
        store.insert(
            &format!("{}.status", mongo_opts.database),
            json!({ "collection": collection }),
        )?;
    }

    let ns = format!("{}.{}", mongo_opts.database, effective);
    spdlog::info!("Creating collection {} with no index on ID", ns);
    store.create_collection(
        &ns,
        &CollectionSpec {
            capped_size: mongo_opts.capped_size,
            auto_index_id: false,
        },
    )?;

    if !mongo_opts.indices.is_empty() {
        store.create_index(&ns, &mongo_opts.indices, true)?;
    }

    if mongo_opts.sharding {
        store.create_index(&ns, &[String::from("module")], false)?;
        store.enable_sharding(&ns, "module")?;
        // The balancer would undo the placement we are about to do.
        store.set_balancer(true)?;

        let shards = &mongo_opts.shards;
        if shards.is_empty() {
            spdlog::warn!("Sharding requested for {} but no shards configured", ns);
            return Ok(());
        }
        if lots_of_splits {
            for (i, board) in board_list.iter().enumerate() {
                store.split_chunk(&ns, *board)?;
                store.move_chunk(&ns, *board, &shards[i % shards.len()])?;
            }
        } else {
            let plan = bucket_split_plan(board_list, shards.len())?;
            spdlog::info!(
                "Splitting {} with {} digitizers over {} shards",
                ns,
                board_list.len(),
                shards.len()
            );
            for split in &plan.splits {
                store.split_chunk(&ns, *split)?;
            }
            for (module, shard) in &plan.migrations {
                store.move_chunk(&ns, *module, &shards[*shard])?;
            }
        }
    }
    Ok(())
}

/// Background thread keeping cycle collections provisioned ahead of time.
///
/// One worker runs per detector while a rotated run is live. The
/// orchestrator stops it cooperatively through the shared run flag; the
/// worker notices within a second.
pub struct RollingWorker {
    run: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RollingWorker {
    pub fn spawn(
        connector: Arc<dyn StoreConnector>,
        mongo_opts: MongoOptions,
        collection: String,
        board_list: Vec<i32>,
    ) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let flag = run.clone();
        let handle = thread::spawn(move || {
            // Cycles 0 and 1 exist before the run starts.
            let mut next_cycle: i32 = 2;
            let start = Instant::now();
            while flag.load(Ordering::Acquire) {
                let elapsed = start.elapsed().as_secs_f64();
                while elapsed * (1.0 + READAHEAD_FRACTION) / CLOCK_WRAP_SECONDS + READAHEAD_CYCLES
                    > f64::from(next_cycle)
                {
                    for host in mongo_opts.distinct_hosts() {
                        let mut opts = mongo_opts.clone();
                        opts.address = host.clone();
                        match connector.connect(&host) {
                            Ok(store) => {
                                if let Err(e) = provision_collection(
                                    store.as_ref(),
                                    &opts,
                                    &collection,
                                    &board_list,
                                    next_cycle,
                                    false,
                                ) {
                                    spdlog::error!(
                                        "Failed to provision cycle {} on {}: {}",
                                        next_cycle,
                                        host,
                                        e
                                    );
                                }
                            }
                            Err(e) => {
                                spdlog::error!("Rolling worker cannot reach {}: {}", host, e)
                            }
                        }
                    }
                    next_cycle += 1;
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                }
                thread::sleep(Duration::from_secs(1));
            }
        });
        Self {
            run,
            handle: Some(handle),
        }
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.run.store(false, Ordering::Release);
    }

    /// Stop the worker and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                spdlog::error!("Rolling collection worker panicked");
            }
        }
    }
}

impl Drop for RollingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
