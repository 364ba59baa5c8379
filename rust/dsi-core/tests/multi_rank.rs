// rust/dsi-core/tests/multi_rank.rs

//! End-to-end runs with ranks simulated as threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use dsi_core::config::{DistributedConfig, SamplerConfig};
use dsi_core::{
    generate, Barrier, ConcatDataset, Dataset, DistributedSampler, IndexPlan, ThreadBarrier,
    WorkerPoolLoader,
};
use tempfile::TempDir;

fn rank_config(
    global_batch_size: usize,
    world_size: usize,
    rank: usize,
    local_rank: usize,
) -> SamplerConfig {
    let mut config = SamplerConfig::default();
    config.sampling.global_batch_size = global_batch_size;
    config.sampling.seed = 31;
    config.distributed = DistributedConfig {
        world_size: Some(world_size),
        rank: Some(rank),
        local_rank: Some(local_rank),
    };
    config
}

/// Interleaves per-rank sequences back into global order.
fn interleave(per_rank: &[Vec<u32>]) -> Vec<u32> {
    let len = per_rank[0].len();
    (0..len)
        .flat_map(|i| per_rank.iter().map(move |rank| rank[i]))
        .collect()
}

#[test]
fn two_hosts_four_ranks_two_workers() {
    const WORLD_SIZE: usize = 4;
    const RANKS_PER_HOST: usize = 2;
    const LENGTH: u32 = 192;
    const EPOCHS: u64 = 3;

    let dir = TempDir::new().unwrap();
    let handshake = ThreadBarrier::new(WORLD_SIZE);
    let done = ThreadBarrier::new(WORLD_SIZE);

    let handles: Vec<_> = (0..WORLD_SIZE)
        .map(|rank| {
            let handshake = handshake.clone();
            let done = done.clone();
            // Both host leaders persist to the same shared file.
            let index_file: PathBuf = dir.path().join("shared/global_indices");
            thread::spawn(move || {
                let mut config = rank_config(16, WORLD_SIZE, rank, rank % RANKS_PER_HOST);
                config.index.index_file = Some(index_file);
                config.loader.num_workers = 2;

                let dataset = Arc::new((0..LENGTH).collect::<Vec<_>>());
                let mut sampler =
                    DistributedSampler::new(dataset, &config, Arc::new(handshake)).unwrap();

                let mut per_epoch = Vec::new();
                for epoch in 0..EPOCHS {
                    if epoch > 0 {
                        sampler.reshuffle(epoch).unwrap();
                    }
                    let records: Vec<u32> = WorkerPoolLoader::from_config(&sampler, &config.loader)
                        .unwrap()
                        .flat_map(|batch| batch.unwrap().records)
                        .collect();
                    per_epoch.push(records);
                    // Everyone has loaded this epoch before a leader replaces the file.
                    done.wait(epoch).unwrap();
                }
                per_epoch
            })
        })
        .collect();

    let results: Vec<Vec<Vec<u32>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let plan = IndexPlan {
        length: LENGTH as usize,
        world_size: WORLD_SIZE,
        seed: 31,
        shuffle: true,
        drop_last: false,
    };
    for epoch in 0..EPOCHS {
        let per_rank: Vec<Vec<u32>> = results.iter().map(|r| r[epoch as usize].clone()).collect();
        assert!(per_rank.iter().all(|r| r.len() == 48));
        assert_eq!(
            interleave(&per_rank),
            generate(&plan, epoch).unwrap().into_vec(),
            "epoch {epoch}"
        );
    }
    assert_ne!(results[0][0], results[0][1]);

    let manifest = dir.path().join("shared/global_indices.manifest.toml");
    assert!(manifest.exists());
}

#[test]
fn restart_resumes_mid_epoch() {
    let dataset = Arc::new((0..320u32).collect::<Vec<_>>());
    let global_batch_size = 16;
    let world_size = 2;
    let device_batch_size = global_batch_size / world_size;

    for rank in 0..world_size {
        let mut config = rank_config(global_batch_size, world_size, rank, 0);
        config.sampling.epoch = 5;
        let full: Vec<u32> = DistributedSampler::from_config(dataset.clone(), &config)
            .unwrap()
            .iter(None)
            .unwrap()
            .map(|s| s.unwrap())
            .collect();

        config.sampling.start_index = 2 * global_batch_size;
        let sampler = DistributedSampler::from_config(dataset.clone(), &config).unwrap();
        let resumed: Vec<u32> = WorkerPoolLoader::spawn(&sampler, 3, 2)
            .unwrap()
            .flat_map(|b| b.unwrap().records)
            .collect();

        assert_eq!(resumed, full[2 * device_batch_size..]);
    }
}

#[test]
fn drop_last_over_concatenated_shards() {
    let shards = ConcatDataset::new(vec![
        (0..7u32).collect::<Vec<_>>(),
        (100..105u32).collect::<Vec<_>>(),
        Vec::new(),
        (200..206u32).collect::<Vec<_>>(),
    ]);
    assert_eq!(shards.len(), 18);
    let shards = Arc::new(shards);

    let mut seen = Vec::new();
    for rank in 0..4 {
        let mut config = rank_config(4, 4, rank, rank);
        config.sampling.drop_last = true;
        let sampler = DistributedSampler::from_config(shards.clone(), &config).unwrap();
        assert_eq!(sampler.total_size(), 16);
        assert_eq!(sampler.len(), 4);
        seen.extend(sampler.iter(None).unwrap().map(|s| s.unwrap()));
    }

    let mut distinct = seen.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 16, "drop_last must not repeat samples");
}
