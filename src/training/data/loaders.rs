//! Loader over safetensors shards of beam-training trajectories

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use super::{DataSource, RawBatch};
use crate::config::SystemParams;
use crate::error::{Error, Result};

const SHARD_EXTENSION: &str = "safetensors";

/// In-memory split read from one shard file or a directory of shards
///
/// Each shard holds the tensors `channels`, `bs_label`, `beam_label`,
/// `beam_power`, `ue_loc` and `bs_loc`, batch axis first. Only full batches are
/// yielded; a trailing partial batch is dropped.
pub struct ShardDataLoader {
    samples: RawBatch,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<u32>,
    cursor: usize,
    device: Device,
}

impl ShardDataLoader {
    /// Load every shard under `path` and validate it against `system`
    pub fn open(
        path: impl AsRef<Path>,
        system: &SystemParams,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let shards = list_shards(path)?;
        if shards.is_empty() {
            return Err(Error::data(format!(
                "No .{} shards found at {}",
                SHARD_EXTENSION,
                path.display()
            )));
        }

        let mut batches = Vec::with_capacity(shards.len());
        for shard in &shards {
            debug!("Loading shard {}", shard.display());
            batches.push(load_shard(shard, device)?);
        }
        let samples = RawBatch::cat(&batches)?;
        samples.validate(system)?;

        info!(
            "Loaded {} trajectories from {} shard(s) at {}",
            samples.len(),
            shards.len(),
            path.display()
        );
        Self::from_samples(samples, batch_size, shuffle, seed)
    }

    /// Serve batches from samples already in memory
    pub fn from_samples(samples: RawBatch, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if samples.len() < batch_size {
            return Err(Error::data(format!(
                "{} trajectories cannot fill a batch of {}",
                samples.len(),
                batch_size
            )));
        }

        let device = samples.channels.device().clone();
        let mut loader = Self {
            order: (0..samples.len() as u32).collect(),
            samples,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            cursor: 0,
            device,
        };
        loader.reset()?;
        Ok(loader)
    }

    /// Number of trajectories held
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Full batches per pass
    pub fn num_batches(&self) -> usize {
        self.num_samples() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl DataSource for ShardDataLoader {
    fn reset(&mut self) -> Result<()> {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        let end = self.cursor + self.batch_size;
        if end > self.order.len() {
            return Ok(None);
        }

        let indexes = Tensor::new(&self.order[self.cursor..end], &self.device)?;
        self.cursor = end;
        Ok(Some(self.samples.index_select(&indexes)?))
    }
}

fn list_shards(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(Error::data(format!("Dataset {} not found", path.display())));
    }

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let shard = entry?.path();
        if shard.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
            shards.push(shard);
        }
    }
    shards.sort();
    Ok(shards)
}

fn load_shard(path: &Path, device: &Device) -> Result<RawBatch> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    let mut take = |name: &str| {
        tensors.remove(name).ok_or_else(|| {
            Error::data(format!("Shard {} is missing '{}'", path.display(), name))
        })
    };

    Ok(RawBatch {
        channels: take("channels")?,
        bs_label: take("bs_label")?,
        beam_label: take("beam_label")?,
        beam_power: take("beam_power")?,
        ue_loc: take("ue_loc")?,
        bs_loc: take("bs_loc")?,
    })
}

/// Write a batch as one shard; the inverse of the loader's shard format
pub fn save_shard(batch: &RawBatch, path: impl AsRef<Path>) -> Result<()> {
    let tensors = std::collections::HashMap::from([
        ("channels", batch.channels.clone()),
        ("bs_label", batch.bs_label.clone()),
        ("beam_label", batch.beam_label.clone()),
        ("beam_power", batch.beam_power.clone()),
        ("ue_loc", batch.ue_loc.clone()),
        ("bs_loc", batch.bs_loc.clone()),
    ]);
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}
