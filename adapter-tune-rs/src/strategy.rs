//! Execution strategies and worker launch.
//!
//! A run picks one [`StrategyKind`] at startup and every worker holds a
//! [`Strategy`] for its rank. The training loop only talks to the strategy,
//! never to the collective directly:
//!
//! - `SingleDevice`: one worker, every collective is a no-op.
//! - `ShardedParallel`: data parallel over several workers. Gradients are
//!   averaged once per accumulation group; each worker steps only the
//!   trainable parameters it owns and then shares the updated values.
//! - `Accelerator`: fixed-shape batches and an explicit device
//!   synchronization after every iteration, data parallel when there are
//!   several cores.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};

use crate::collective::{Payload, ThreadCollective};
use crate::error::{FinetuneError, Result};
use crate::model::AdapterModel;

/// Environment variable that forces every worker onto the CPU.
pub const FORCE_CPU_ENV: &str = "ADAPTER_TUNE_FORCE_CPU";

/// The closed set of execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// One worker on one device.
    SingleDevice,
    /// Several workers sharing optimizer work.
    ShardedParallel,
    /// Several accelerator cores with fixed-shape batches.
    Accelerator,
}

impl StrategyKind {
    /// Pick the strategy for `devices` workers.
    ///
    /// Accelerator hardware keeps its fixed-shape execution even on one core.
    ///
    /// ```rust
    /// use adapter_tune_rs::strategy::StrategyKind;
    ///
    /// assert_eq!(StrategyKind::select(1, false), StrategyKind::SingleDevice);
    /// assert_eq!(StrategyKind::select(1, true), StrategyKind::Accelerator);
    /// assert_eq!(StrategyKind::select(8, true), StrategyKind::Accelerator);
    /// assert_eq!(StrategyKind::select(4, false), StrategyKind::ShardedParallel);
    /// ```
    #[must_use]
    pub fn select(devices: usize, accelerator: bool) -> Self {
        match (devices, accelerator) {
            (_, true) => StrategyKind::Accelerator,
            (0 | 1, false) => StrategyKind::SingleDevice,
            (_, false) => StrategyKind::ShardedParallel,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::SingleDevice => "single-device",
            StrategyKind::ShardedParallel => "sharded-parallel",
            StrategyKind::Accelerator => "accelerator",
        };
        f.write_str(name)
    }
}

/// Pick the compute device for worker `rank`.
///
/// Prefers CUDA, then Metal, when compiled in; falls back to CPU with a
/// warning. `ADAPTER_TUNE_FORCE_CPU=1` skips device detection.
#[must_use]
pub fn select_device(rank: usize) -> Device {
    let force_cpu = std::env::var(FORCE_CPU_ENV)
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if force_cpu {
        tracing::debug!("Rank {rank}: CPU mode forced via {FORCE_CPU_ENV}");
        return Device::Cpu;
    }

    if cfg!(feature = "cuda") {
        match Device::cuda_if_available(rank) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Rank {rank}: training device CUDA {rank}");
                return device;
            }
            Ok(_) => tracing::warn!("Rank {rank}: CUDA not available; falling back to CPU."),
            Err(err) => tracing::warn!("Rank {rank}: CUDA init failed ({err}); falling back to CPU."),
        }
    } else if cfg!(feature = "metal") {
        match Device::new_metal(rank) {
            Ok(device) => {
                tracing::info!("Rank {rank}: training device Metal {rank}");
                return device;
            }
            Err(err) => tracing::warn!("Rank {rank}: Metal init failed ({err}); falling back to CPU."),
        }
    } else {
        tracing::warn!(
            "Rank {rank}: no GPU feature enabled; running on CPU. Enable with --features cuda."
        );
    }
    Device::Cpu
}

fn to_flat(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// One worker's view of the run.
#[derive(Clone)]
pub struct Strategy {
    kind: StrategyKind,
    rank: usize,
    world_size: usize,
    device: Device,
    collective: Arc<ThreadCollective>,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish()
    }
}

impl Strategy {
    /// Strategy for `rank` of `world_size`, sharing `collective` with its peers.
    #[must_use]
    pub fn new(
        kind: StrategyKind,
        rank: usize,
        world_size: usize,
        device: Device,
        collective: Arc<ThreadCollective>,
    ) -> Self {
        Self {
            kind,
            rank,
            world_size,
            device,
            collective,
        }
    }

    /// A lone single-device worker.
    #[must_use]
    pub fn single(device: Device) -> Self {
        Self::new(
            StrategyKind::SingleDevice,
            0,
            1,
            device,
            Arc::new(ThreadCollective::new(1)),
        )
    }

    /// Strategy variant.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// This worker's rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of workers.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// This worker's device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether this is rank 0.
    #[must_use]
    pub fn is_global_zero(&self) -> bool {
        self.rank == 0
    }

    /// Log `message` once for the whole run.
    pub fn print(&self, message: impl fmt::Display) {
        if self.is_global_zero() {
            tracing::info!("{message}");
        }
    }

    /// Whether batches must be padded to a fixed length.
    #[must_use]
    pub fn fixed_shape(&self) -> bool {
        self.kind == StrategyKind::Accelerator
    }

    /// Whether an instrumented forward pass can be run for FLOP measurement.
    #[must_use]
    pub fn supports_flop_measurement(&self) -> bool {
        self.kind != StrategyKind::ShardedParallel
    }

    /// Sampling seed of this worker.
    #[must_use]
    pub fn seed_for(&self, seed: u64) -> u64 {
        seed + self.rank as u64
    }

    /// Block until every worker arrives.
    pub fn barrier(&self) {
        self.collective.barrier();
    }

    /// Flush queued device work at the end of an iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails to synchronize.
    pub fn mark_step(&self) -> Result<()> {
        if self.kind == StrategyKind::Accelerator {
            self.device.synchronize()?;
        }
        Ok(())
    }

    fn owns(&self, index: usize) -> bool {
        self.kind != StrategyKind::ShardedParallel || index % self.world_size == self.rank
    }

    /// Trainable parameters this worker's optimizer updates.
    #[must_use]
    pub fn owned_parameters(&self, params: &[(String, Var)]) -> Vec<Var> {
        params
            .iter()
            .enumerate()
            .filter(|(index, _)| self.owns(*index))
            .map(|(_, (_, var))| var.clone())
            .collect()
    }

    /// Make every worker start from rank 0's adapter values.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange or the copy fails.
    pub fn setup_model<M: AdapterModel + ?Sized>(&self, model: &M) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let params = model.trainable_parameters()?;
        let payload = if self.is_global_zero() {
            params
                .iter()
                .map(|(name, var)| Ok((name.clone(), to_flat(var.as_tensor())?)))
                .collect::<Result<Payload>>()?
        } else {
            Vec::new()
        };
        let received = self.collective.broadcast(self.rank, 0, payload)?;
        if !self.is_global_zero() {
            self.assign(&params, received)?;
        }
        Ok(())
    }

    /// Average the accumulated gradients across workers.
    ///
    /// Parameters without a local gradient contribute zeros.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Distributed`] if the workers disagree.
    pub fn sync_gradients(&self, grads: &mut BTreeMap<String, Tensor>, params: &[(String, Var)]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let payload = params
            .iter()
            .map(|(name, var)| {
                let values = match grads.get(name) {
                    Some(grad) => to_flat(grad)?,
                    None => vec![0.0; var.elem_count()],
                };
                Ok((name.clone(), values))
            })
            .collect::<Result<Payload>>()?;

        let reduced = self.collective.all_reduce_mean(self.rank, payload)?;
        for ((name, values), (_, var)) in reduced.into_iter().zip(params) {
            let grad = Tensor::from_vec(values, var.shape(), &self.device)?;
            grads.insert(name, grad);
        }
        Ok(())
    }

    /// Share the values each worker just updated so every replica agrees.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange or the copy fails.
    pub fn gather_parameters(&self, params: &[(String, Var)]) -> Result<()> {
        if self.kind != StrategyKind::ShardedParallel || self.world_size == 1 {
            return Ok(());
        }
        let payload = params
            .iter()
            .enumerate()
            .filter(|(index, _)| self.owns(*index))
            .map(|(_, (name, var))| Ok((name.clone(), to_flat(var.as_tensor())?)))
            .collect::<Result<Payload>>()?;
        let gathered = self.collective.all_gather(self.rank, payload)?;

        let mine: Vec<&String> = params
            .iter()
            .enumerate()
            .filter(|(index, _)| self.owns(*index))
            .map(|(_, (name, _))| name)
            .collect();
        let foreign: Payload = gathered
            .into_iter()
            .filter(|(name, _)| !mine.contains(&name))
            .collect();
        self.assign(params, foreign)
    }

    fn assign(&self, params: &[(String, Var)], values: Payload) -> Result<()> {
        let by_name: HashMap<&str, &Var> = params.iter().map(|(n, v)| (n.as_str(), v)).collect();
        for (name, flat) in values {
            let var = by_name.get(name.as_str()).ok_or_else(|| {
                FinetuneError::Distributed(format!("peer sent unknown parameter {name}"))
            })?;
            let tensor = Tensor::from_vec(flat, var.shape(), &self.device)?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }
        Ok(())
    }
}

/// Run `run` once per rank and collect the results in rank order.
///
/// A single device runs inline on the calling thread; otherwise each rank
/// gets a scoped thread and its own device.
///
/// # Errors
///
/// Returns the first worker error, or [`FinetuneError::Distributed`] when a
/// worker panics.
pub fn launch<T, F>(kind: StrategyKind, devices: usize, run: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Strategy) -> Result<T> + Sync,
{
    if devices == 0 {
        return Err(FinetuneError::Config("devices must be > 0".into()));
    }
    let collective = Arc::new(ThreadCollective::new(devices));
    if devices == 1 {
        let strategy = Strategy::new(kind, 0, 1, select_device(0), collective);
        return Ok(vec![run(strategy)?]);
    }

    tracing::info!("Launching {devices} workers with the {kind} strategy");
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..devices)
            .map(|rank| {
                let collective = Arc::clone(&collective);
                let run = &run;
                scope.spawn(move || {
                    let strategy = Strategy::new(kind, rank, devices, select_device(rank), collective);
                    run(strategy)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .map_err(|_| FinetuneError::Distributed(format!("worker {rank} panicked")))?
            })
            .collect()
    })
}
