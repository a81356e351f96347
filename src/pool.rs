//! Job record arena.
//!
//! Jobs of every socket live in one engine-wide arena. A job is addressed by
//! a [`JobKey`] that encodes both the slot index and the slot's generation, so
//! a key kept past its release can never reach the job that reused the slot.

use crate::job::Job;

/// Generation-checked handle to a pooled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobKey {
    index: u32,
    generation: u32,
}

/// A pooled job and its drain state.
#[derive(Debug)]
pub(crate) struct JobRecord {
    pub(crate) job: Job,
    /// Set once the job reaches the head of its queue and draining starts.
    pub(crate) active: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<JobRecord>,
}

/// Free-list arena of job records.
#[derive(Debug, Default)]
pub(crate) struct JobPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    in_use: usize,
}

impl JobPool {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            in_use: 0,
        }
    }

    /// Stores `job` in a free slot, growing the arena only when none is left.
    pub(crate) fn acquire(&mut self, job: Job) -> JobKey {
        let record = JobRecord { job, active: false };
        self.in_use += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                JobKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                JobKey {
                    index,
                    generation: 0,
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: JobKey) -> Option<&JobRecord> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.record.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: JobKey) -> Option<&mut JobRecord> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.record.as_mut())
    }

    /// Takes the job out and returns its slot to the free list.
    ///
    /// Returns `None` for a stale key; nothing is released twice.
    pub(crate) fn release(&mut self, key: JobKey) -> Option<Job> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.in_use -= 1;
        Some(record.job)
    }

    /// Jobs currently held by some queue.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    /// Slots allocated over the pool's lifetime.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses_slot() {
        let mut pool = JobPool::with_capacity(4);
        let a = pool.acquire(Job::Shutdown);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.release(a).is_some());
        assert_eq!(pool.in_use(), 0);

        let b = pool.acquire(Job::Shutdown);
        assert_eq!(pool.capacity(), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_key_detected() {
        let mut pool = JobPool::default();
        let a = pool.acquire(Job::Shutdown);
        pool.release(a);
        let _b = pool.acquire(Job::Shutdown);

        assert!(pool.get(a).is_none());
        assert!(pool.get_mut(a).is_none());
        assert!(pool.release(a).is_none());
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_fresh_record_is_inactive() {
        let mut pool = JobPool::default();
        let key = pool.acquire(Job::Shutdown);
        pool.get_mut(key).unwrap().active = true;
        pool.release(key);
        let key = pool.acquire(Job::Shutdown);
        assert!(!pool.get(key).unwrap().active);
    }
}
