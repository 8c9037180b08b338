//! Single-node data parallelism over threads.
//!
//! Each worker owns a replica of the model on its device and participates in
//! blocking collectives through a shared [`ProcessGroup`]. Collectives are
//! generation-based: a round completes when every rank has contributed, and a
//! rank cannot start the next round before it has read the previous result.
//! Any failure aborts the group, which fails every pending and future
//! collective so that no worker is left waiting.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use candle_core::Device;
use parking_lot::{Condvar, Mutex};

use crate::TrainingError;

/// Rank and world size of the calling worker plus access to the collectives.
#[derive(Clone)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    collective: Arc<Collective>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl ProcessGroup {
    /// A group with a single member; collectives are no-ops.
    pub fn single() -> Self {
        Self::group(1).remove(0)
    }

    /// Creates the handles for every rank of a new group.
    pub fn group(world_size: usize) -> Vec<ProcessGroup> {
        let world_size = world_size.max(1);
        let collective = Arc::new(Collective::new(world_size));
        (0..world_size)
            .map(|rank| ProcessGroup {
                rank,
                world_size,
                collective: Arc::clone(&collective),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 performs singleton side effects (logging, checkpoints).
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Element-wise sum across all ranks, written back into `values`.
    pub fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }
        let reduced = self.collective.reduce(self.rank, values)?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    /// Element-wise mean across all ranks.
    pub fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.all_reduce_sum(values)?;
        let world = self.world_size as f64;
        for value in values.iter_mut() {
            *value /= world;
        }
        Ok(())
    }

    pub fn barrier(&self) -> Result<(), TrainingError> {
        self.all_reduce_sum(&mut [])
    }

    /// Tears the whole group down; every rank observes a communication error.
    pub fn abort(&self, reason: impl Into<String>) {
        self.collective.abort(self.rank, reason.into());
    }

    pub fn is_aborted(&self) -> bool {
        self.collective.state.lock().aborted.is_some()
    }
}

struct Collective {
    world_size: usize,
    state: Mutex<CollectiveState>,
    ready: Condvar,
}

#[derive(Default)]
struct CollectiveState {
    generation: u64,
    arrived: usize,
    accumulator: Vec<f64>,
    published: Arc<Vec<f64>>,
    aborted: Option<String>,
}

impl Collective {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            state: Mutex::new(CollectiveState::default()),
            ready: Condvar::new(),
        }
    }

    fn reduce(&self, rank: usize, values: &[f64]) -> Result<Arc<Vec<f64>>, TrainingError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return Err(TrainingError::communication(reason.clone()));
        }

        if state.arrived == 0 {
            state.accumulator.clear();
            state.accumulator.extend_from_slice(values);
        } else if state.accumulator.len() != values.len() {
            let reason = format!(
                "rank {rank} contributed {} values to a collective of {}",
                values.len(),
                state.accumulator.len()
            );
            state.aborted = Some(reason.clone());
            self.ready.notify_all();
            return Err(TrainingError::communication(reason));
        } else {
            for (acc, value) in state.accumulator.iter_mut().zip(values) {
                *acc += value;
            }
        }
        state.arrived += 1;

        if state.arrived == self.world_size {
            let result = std::mem::take(&mut state.accumulator);
            state.published = Arc::new(result);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.ready.notify_all();
            return Ok(Arc::clone(&state.published));
        }

        let generation = state.generation;
        while state.generation == generation {
            if let Some(reason) = &state.aborted {
                return Err(TrainingError::communication(reason.clone()));
            }
            self.ready.wait(&mut state);
        }
        Ok(Arc::clone(&state.published))
    }

    fn abort(&self, rank: usize, reason: String) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            log::warn!("rank {rank} aborted the process group: {reason}");
            state.aborted = Some(format!("process group aborted by rank {rank}: {reason}"));
        }
        self.ready.notify_all();
    }
}

/// Per-worker handle passed to the closure given to [`launch`].
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub group: ProcessGroup,
    pub device: Device,
}

/// Runs `worker` once per device in lockstep and collects the per-rank
/// results in rank order.
///
/// If any worker fails or panics the group is aborted so peers blocked in a
/// collective return. The reported error is the first non-communication
/// error by rank, which is the root cause rather than its echo on peers.
pub fn launch<T, F>(devices: Vec<Device>, worker: F) -> Result<Vec<T>, TrainingError>
where
    T: Send,
    F: Fn(WorkerContext) -> Result<T, TrainingError> + Sync,
{
    if devices.is_empty() {
        return Err(TrainingError::configuration(
            "data-parallel launch requires at least one device",
        ));
    }
    let groups = ProcessGroup::group(devices.len());

    let outcomes: Vec<Result<T, TrainingError>> = thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .zip(devices)
            .map(|(group, device)| {
                let worker = &worker;
                scope.spawn(move || {
                    let ctx = WorkerContext {
                        group: group.clone(),
                        device,
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(ctx)))
                        .unwrap_or_else(|payload| {
                            Err(TrainingError::runtime(format!(
                                "worker {} panicked: {}",
                                group.rank(),
                                panic_message(payload.as_ref())
                            )))
                        });
                    if let Err(err) = &outcome {
                        group.abort(err.to_string());
                    }
                    outcome
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(TrainingError::runtime("worker thread panicked")))
            })
            .collect()
    });

    let mut results = Vec::with_capacity(outcomes.len());
    let mut first_error: Option<TrainingError> = None;
    for outcome in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(err) => {
                let replace = match &first_error {
                    None => true,
                    Some(existing) => existing.is_communication() && !err.is_communication(),
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

/// One device per rank: CUDA ordinals when available, CPU replicas otherwise.
pub fn select_devices(world_size: usize) -> Result<Vec<Device>, TrainingError> {
    let world_size = world_size.max(1);
    if candle_core::utils::cuda_is_available() {
        (0..world_size)
            .map(|ordinal| {
                Device::new_cuda(ordinal).map_err(|err| {
                    TrainingError::configuration(format!("failed to open CUDA device {ordinal}: {err}"))
                })
            })
            .collect()
    } else {
        if world_size > 1 {
            log::info!("CUDA unavailable; running {world_size} CPU replicas");
        }
        Ok(vec![Device::Cpu; world_size])
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
