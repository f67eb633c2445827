//! In-process collective operations between worker threads.
//!
//! Every worker thread owns one rank. Collectives are rendezvous points: all
//! ranks must call the same operation in the same order, otherwise the
//! callers block forever.

use std::sync::Barrier;

use parking_lot::Mutex;

use crate::error::{FinetuneError, Result};

/// Named flat `f32` buffers exchanged by a collective.
pub type Payload = Vec<(String, Vec<f32>)>;

/// Shared rendezvous state for `world_size` ranks.
pub struct ThreadCollective {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Payload>>>,
}

impl ThreadCollective {
    /// Create the collective for `world_size` ranks.
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        }
    }

    /// Number of participating ranks.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Block until every rank arrives.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Publish `payload` and receive every rank's payload, ordered by rank.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Distributed`] when `rank` is out of range or a
    /// slot was left empty.
    pub fn exchange(&self, rank: usize, payload: Payload) -> Result<Vec<Payload>> {
        if rank >= self.world_size {
            return Err(FinetuneError::Distributed(format!(
                "rank {rank} is outside a world of {}",
                self.world_size
            )));
        }
        self.slots.lock()[rank] = Some(payload);
        self.barrier.wait();
        let gathered: Result<Vec<Payload>> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .map(|(peer, slot)| {
                slot.clone().ok_or_else(|| {
                    FinetuneError::Distributed(format!("rank {peer} published nothing"))
                })
            })
            .collect();
        // Nobody may publish the next round before every rank has read this one.
        self.barrier.wait();
        gathered
    }

    /// Element-wise mean of every rank's buffers.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Distributed`] when ranks disagree on names or lengths.
    pub fn all_reduce_mean(&self, rank: usize, payload: Payload) -> Result<Payload> {
        let gathered = self.exchange(rank, payload)?;
        let mut iter = gathered.into_iter();
        let mut total = iter.next().unwrap_or_default();
        for other in iter {
            if other.len() != total.len() {
                return Err(FinetuneError::Distributed(
                    "ranks reduced different parameter sets".into(),
                ));
            }
            for ((name, acc), (other_name, values)) in total.iter_mut().zip(other) {
                if *name != other_name || acc.len() != values.len() {
                    return Err(FinetuneError::Distributed(format!(
                        "rank buffers disagree at {name}"
                    )));
                }
                for (a, v) in acc.iter_mut().zip(values) {
                    *a += v;
                }
            }
        }
        let world = self.world_size as f32;
        for (_, values) in &mut total {
            for v in values.iter_mut() {
                *v /= world;
            }
        }
        Ok(total)
    }

    /// Concatenation of every rank's entries, in rank order.
    ///
    /// # Errors
    ///
    /// See [`ThreadCollective::exchange`].
    pub fn all_gather(&self, rank: usize, payload: Payload) -> Result<Payload> {
        Ok(self.exchange(rank, payload)?.into_iter().flatten().collect())
    }

    /// Rank `root`'s payload, delivered to every rank.
    ///
    /// # Errors
    ///
    /// See [`ThreadCollective::exchange`].
    pub fn broadcast(&self, rank: usize, root: usize, payload: Payload) -> Result<Payload> {
        let mine = if rank == root { payload } else { Vec::new() };
        self.exchange(rank, mine)?
            .into_iter()
            .nth(root)
            .ok_or_else(|| FinetuneError::Distributed(format!("root rank {root} does not exist")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T: Send>(world: usize, f: impl Fn(usize, &ThreadCollective) -> T + Sync) -> Vec<T> {
        let collective = ThreadCollective::new(world);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world)
                .map(|rank| {
                    let collective = &collective;
                    let f = &f;
                    scope.spawn(move || f(rank, collective))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_all_reduce_mean() {
        let results = run(3, |rank, c| {
            c.all_reduce_mean(rank, vec![("g".into(), vec![rank as f32, 3.0])])
                .unwrap()
        });
        for result in results {
            assert_eq!(result, vec![("g".to_string(), vec![1.0, 3.0])]);
        }
    }

    #[test]
    fn test_all_gather_in_rank_order() {
        let results = run(2, |rank, c| {
            c.all_gather(rank, vec![(format!("p{rank}"), vec![rank as f32])])
                .unwrap()
        });
        for result in results {
            let names: Vec<&str> = result.iter().map(|(n, _)| n.as_str()).collect();
            assert_eq!(names, vec!["p0", "p1"]);
        }
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = run(4, |rank, c| {
            c.broadcast(rank, 0, vec![("w".into(), vec![rank as f32 + 10.0])])
                .unwrap()
        });
        for result in results {
            assert_eq!(result, vec![("w".to_string(), vec![10.0])]);
        }
    }

    #[test]
    fn test_repeated_rounds_do_not_mix() {
        let results = run(2, |rank, c| {
            (0..20)
                .map(|round| {
                    c.all_reduce_mean(rank, vec![("x".into(), vec![(round * 2 + rank) as f32])])
                        .unwrap()[0]
                        .1[0]
                })
                .collect::<Vec<f32>>()
        });
        let expected: Vec<f32> = (0..20).map(|round| round as f32 * 2.0 + 0.5).collect();
        assert_eq!(results[0], expected);
        assert_eq!(results[1], expected);
    }

    #[test]
    fn test_single_rank_is_identity() {
        let c = ThreadCollective::new(1);
        let out = c.all_reduce_mean(0, vec![("a".into(), vec![2.0])]).unwrap();
        assert_eq!(out, vec![("a".to_string(), vec![2.0])]);
        assert!(c.exchange(1, Vec::new()).is_err());
    }
}
