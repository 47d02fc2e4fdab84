//! Data-parallel worker collectives.
//!
//! Every worker holds a full model replica. After each backward pass the
//! workers average their gradients with a blocking all-reduce, so replicas
//! stay identical. Rank zero alone evaluates, reports and checkpoints; the
//! others wait at a barrier before the next epoch.
//!
//! [`ThreadGroup`] runs `world_size` workers in one process, one thread each,
//! meeting at a generation-counted rendezvous on a `Mutex` + `Condvar`.
//!
//! A worker that fails calls [`Collective::abort`]; every pending and future
//! collective on its peers then returns an error instead of blocking.

use crate::core::{Gradients, NeuroError, NeuroResult};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Blocking collective operations across data-parallel workers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// The designated worker for evaluation, reporting and checkpoint I/O.
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Replace `buffer` with its element-wise mean over all workers.
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> NeuroResult<()>;

    /// Block until every worker has arrived.
    fn barrier(&self) -> NeuroResult<()>;

    /// Release peers that would otherwise wait forever for this worker.
    fn abort(&self, _reason: &str) {}
}

/// World of one: every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _buffer: &mut [f32]) -> NeuroResult<()> {
        Ok(())
    }

    fn barrier(&self) -> NeuroResult<()> {
        Ok(())
    }
}

/// Averaged values, or the reason the generation failed.
type Outcome = Result<Vec<f32>, String>;

#[derive(Debug, Default)]
struct Rendezvous {
    arrived: usize,
    generation: u64,
    sum: Vec<f32>,
    /// Buffer-length disagreement within the current generation
    mismatch: Option<String>,
    /// Outcome of the last completed generation, tagged with its number
    outcome: Option<(u64, Outcome)>,
    /// Set once by the first worker to abort; never cleared
    aborted: Option<String>,
}

fn aborted_error(reason: &str) -> NeuroError {
    NeuroError::Distributed(format!("group aborted: {reason}"))
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    state: Mutex<Rendezvous>,
    condvar: Condvar,
}

/// One worker's handle on an in-process group.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    shared: Arc<Shared>,
    rank: usize,
}

impl ThreadGroup {
    /// Create handles for ranks `0..world_size`; move one into each worker thread.
    ///
    /// # Errors
    /// - `Distributed` if `world_size` is zero
    pub fn new(world_size: usize) -> NeuroResult<Vec<ThreadGroup>> {
        if world_size == 0 {
            return Err(NeuroError::Distributed(
                "world size must be positive".to_string(),
            ));
        }
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(Rendezvous::default()),
            condvar: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroup {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect())
    }

    fn lock(&self) -> NeuroResult<MutexGuard<'_, Rendezvous>> {
        self.shared
            .state
            .lock()
            .map_err(|_| NeuroError::Distributed("rendezvous lock poisoned".to_string()))
    }

    /// Sum `buffer` across workers, then divide by `divisor`.
    fn reduce(&self, buffer: &mut [f32], divisor: f32) -> NeuroResult<()> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.aborted {
            return Err(aborted_error(reason));
        }
        if state.arrived == 0 {
            state.generation = state.generation.wrapping_add(1);
            state.sum.clear();
            state.sum.resize(buffer.len(), 0.0);
            state.mismatch = None;
        } else if state.sum.len() != buffer.len() && state.mismatch.is_none() {
            let message = format!(
                "rank {} sent {} values, group expects {}",
                self.rank,
                buffer.len(),
                state.sum.len()
            );
            state.mismatch = Some(message);
        }
        if state.mismatch.is_none() {
            for (dst, value) in state.sum.iter_mut().zip(buffer.iter()) {
                *dst += *value;
            }
        }

        state.arrived += 1;
        let generation = state.generation;
        if state.arrived == self.shared.world_size {
            let outcome = match state.mismatch.take() {
                Some(message) => Err(message),
                None => Ok(state.sum.iter().map(|v| v / divisor).collect()),
            };
            state.outcome = Some((generation, outcome));
            state.arrived = 0;
            self.shared.condvar.notify_all();
        } else {
            loop {
                if matches!(&state.outcome, Some((g, _)) if *g == generation) {
                    break;
                }
                if let Some(reason) = &state.aborted {
                    return Err(aborted_error(reason));
                }
                state = self
                    .shared
                    .condvar
                    .wait(state)
                    .map_err(|_| NeuroError::Distributed("rendezvous lock poisoned".to_string()))?;
            }
        }

        // The next generation cannot complete before this worker joins it,
        // so the tagged outcome is still this generation's.
        match &state.outcome {
            Some((g, Ok(values))) if *g == generation && values.len() == buffer.len() => {
                buffer.copy_from_slice(values);
                Ok(())
            }
            Some((g, Err(message))) if *g == generation => {
                Err(NeuroError::Distributed(message.clone()))
            }
            _ => Err(NeuroError::Distributed(format!(
                "rank {} lost the outcome of generation {generation}",
                self.rank
            ))),
        }
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    #[allow(clippy::cast_precision_loss)]
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> NeuroResult<()> {
        self.reduce(buffer, self.shared.world_size as f32)
    }

    fn barrier(&self) -> NeuroResult<()> {
        self.reduce(&mut [], 1.0)
    }

    fn abort(&self, reason: &str) {
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.aborted.is_none() {
            warn!(rank = self.rank, reason, "aborting worker group");
            state.aborted = Some(format!("rank {}: {reason}", self.rank));
        }
        self.shared.condvar.notify_all();
    }
}

/// Average gradients across workers and agree on whether to abort the step.
///
/// Every parameter in `shapes` is given an entry (zero if this worker
/// produced none) so all workers flatten identically laid out buffers. A
/// trailing flag carries `local_abort`; if any worker raised it, the function
/// returns `true` and the gradients must not be applied.
pub fn sync_gradients(
    collective: &dyn Collective,
    grads: &mut Gradients,
    shapes: &[(String, Vec<usize>)],
    local_abort: bool,
) -> NeuroResult<bool> {
    grads.fill_missing(shapes);
    if collective.world_size() == 1 {
        return Ok(local_abort);
    }
    let mut flat = grads.flatten();
    flat.push(if local_abort { 1.0 } else { 0.0 });
    collective.all_reduce_mean(&mut flat)?;
    let abort = flat.pop().unwrap_or(0.0) > 0.0;
    if abort {
        debug!(rank = collective.rank(), "step aborted by a worker");
        return Ok(true);
    }
    grads.unflatten(&flat)?;
    Ok(false)
}
