//! Slice scheduler: parallel packing of one channel's slices.
//!
//! Workers claim slice indices from a shared counter, so a slow slice never
//! leaves other workers idle behind a static range split. Each result lands in
//! its own preallocated slot, and the caller reads the slots back in z order
//! once every worker has been joined.

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;

use crate::config::IntensityMap;
use crate::error::FramePackError;
use crate::geometry::PaddedGeometry;
use crate::pack::{LaneSelector, PackedFrame, pack_slice};
use crate::stack::ImageStack;

/// Fixed-size pool of scoped packing workers.
#[derive(Clone, Copy, Debug)]
pub struct SliceScheduler {
    threads: usize,
}

impl SliceScheduler {
    /// Scheduler with at most `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Pack every slice of `channel`, returned in ascending z order.
    pub fn pack_channel<S: ImageStack + ?Sized>(
        &self,
        stack: &S,
        channel: usize,
        geometry: &PaddedGeometry,
        intensity: &[IntensityMap],
    ) -> Result<Vec<PackedFrame>, FramePackError> {
        self.pack_frames(stack, LaneSelector::broadcast(channel), geometry, intensity)
    }

    /// Pack every slice with an arbitrary lane mapping, in ascending z order.
    pub fn pack_frames<S: ImageStack + ?Sized>(
        &self,
        stack: &S,
        selector: LaneSelector,
        geometry: &PaddedGeometry,
        intensity: &[IntensityMap],
    ) -> Result<Vec<PackedFrame>, FramePackError> {
        self.run(stack.slices(), |z| {
            pack_slice(stack, selector, z, geometry, intensity)
        })
    }

    /// Run `job` for every index in `0..count` and collect results by index.
    ///
    /// The first error stops further claims and is returned; results already
    /// produced are dropped.
    pub fn run<T, F>(&self, count: usize, job: F) -> Result<Vec<T>, FramePackError>
    where
        T: Send + Sync,
        F: Fn(usize) -> Result<T, FramePackError> + Sync,
    {
        let workers = self.threads.min(count).max(1);
        let slots: Vec<OnceLock<T>> = (0..count).map(|_| OnceLock::new()).collect();
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<FramePackError>> = Mutex::new(None);

        debug!("Packing {} slices on {} workers", count, workers);

        let panicked = thread::scope(|scope| -> Result<Option<usize>, FramePackError> {
            let (slots, next, abort, failure, job) = (&slots, &next, &abort, &failure, &job);
            let mut handles = Vec::with_capacity(workers);

            for worker_id in 0..workers {
                let spawned = thread::Builder::new()
                    .name(format!("h5j-pack-{}", worker_id))
                    .spawn_scoped(scope, move || {
                        trace!("Worker {} started", worker_id);
                        while !abort.load(Ordering::Relaxed) {
                            let z = next.fetch_add(1, Ordering::Relaxed);
                            if z >= count {
                                break;
                            }
                            match job(z) {
                                Ok(value) => {
                                    let _ = slots[z].set(value);
                                }
                                Err(e) => {
                                    abort.store(true, Ordering::Relaxed);
                                    let mut first =
                                        failure.lock().unwrap_or_else(PoisonError::into_inner);
                                    first.get_or_insert(e);
                                    break;
                                }
                            }
                        }
                        trace!("Worker {} stopped", worker_id);
                    });

                match spawned {
                    Ok(handle) => handles.push((worker_id, handle)),
                    Err(e) => {
                        abort.store(true, Ordering::Relaxed);
                        return Err(FramePackError::Spawn(e));
                    }
                }
            }

            let mut panicked = None;
            for (worker_id, handle) in handles {
                if handle.join().is_err() {
                    abort.store(true, Ordering::Relaxed);
                    panicked.get_or_insert(worker_id);
                }
            }
            Ok(panicked)
        })?;

        if let Some(worker_id) = panicked {
            return Err(FramePackError::WorkerPanicked(worker_id));
        }
        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(z, slot)| slot.into_inner().ok_or(FramePackError::MissingSlice(z)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackedData;
    use crate::stack::{ChannelData, VolumeStack, VoxelSize};
    use std::time::Duration;

    #[test]
    fn test_results_in_index_order() {
        let scheduler = SliceScheduler::new(4);
        // Early indices are slowest so completion order is roughly reversed
        let out = scheduler
            .run(16, |z| {
                thread::sleep(Duration::from_millis((16 - z as u64) * 2));
                Ok(z * 10)
            })
            .unwrap();
        assert_eq!(out, (0..16).map(|z| z * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_index_claimed_once() {
        let calls = AtomicUsize::new(0);
        let out = SliceScheduler::new(8)
            .run(100, |z| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(z)
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 100);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn test_error_aborts() {
        let result = SliceScheduler::new(3).run(50, |z| {
            if z == 5 {
                Err(FramePackError::MissingSlice(z))
            } else {
                Ok(z)
            }
        });
        assert!(matches!(result, Err(FramePackError::MissingSlice(5))));
    }

    #[test]
    fn test_panic_reported() {
        let result = SliceScheduler::new(2).run(4, |z| {
            if z == 2 {
                panic!("boom");
            }
            Ok(z)
        });
        assert!(matches!(result, Err(FramePackError::WorkerPanicked(_))));
    }

    #[test]
    fn test_zero_slices() {
        let out: Vec<usize> = SliceScheduler::new(4).run(0, Ok).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_pack_channel_matches_sequential() {
        let w = 13;
        let h = 9;
        let slices: Vec<Vec<u8>> = (0..7)
            .map(|z| (0..w * h).map(|i| ((i * 3 + z * 11) % 256) as u8).collect())
            .collect();
        let stack = VolumeStack::new(
            w,
            h,
            vec![ChannelData::U8(slices.clone()), ChannelData::U8(slices)],
            VoxelSize::default(),
            "",
        )
        .unwrap();
        let geometry = PaddedGeometry::new(w, h);

        let parallel = SliceScheduler::new(4).pack_channel(&stack, 1, &geometry, &[]).unwrap();
        let sequential = SliceScheduler::new(1).pack_channel(&stack, 1, &geometry, &[]).unwrap();

        assert_eq!(parallel.len(), 7);
        assert_eq!(parallel, sequential);
        for (z, frame) in parallel.iter().enumerate() {
            assert_eq!(frame.slice, z);
            assert!(matches!(frame.data, PackedData::Rgb24(_)));
        }
    }
}
