/// Instance selection algorithms
use super::{Instance, SelectAlgorithm};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Selection algorithm trait
pub trait SelectionAlgorithm: Send + Sync {
    /// Pick the index of one instance for which `eligible` holds
    fn select(&self, instances: &[Arc<Instance>], eligible: &dyn Fn(&Instance) -> bool)
        -> Option<usize>;
}

/// Uniform pick among eligible instances
pub struct RandomSelect;

impl SelectionAlgorithm for RandomSelect {
    fn select(
        &self,
        instances: &[Arc<Instance>],
        eligible: &dyn Fn(&Instance) -> bool,
    ) -> Option<usize> {
        let candidates: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| eligible(inst.as_ref()))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rand::thread_rng().gen_range(0..candidates.len())])
    }
}

/// Round-robin cursor that skips ineligible instances.
///
/// The cursor moves to just past the instance it hands out, so every
/// eligible instance is visited once before any repeats.
pub struct RollingSelect {
    cursor: AtomicUsize,
}

impl RollingSelect {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RollingSelect {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionAlgorithm for RollingSelect {
    fn select(
        &self,
        instances: &[Arc<Instance>],
        eligible: &dyn Fn(&Instance) -> bool,
    ) -> Option<usize> {
        let len = instances.len();
        if len == 0 {
            return None;
        }

        // Bounded: a lost race means another caller advanced the cursor.
        for _ in 0..len {
            let start = self.cursor.load(Ordering::Acquire);
            let found = (0..len)
                .map(|step| (start + step) % len)
                .find(|&i| eligible(instances[i].as_ref()))?;
            if self
                .cursor
                .compare_exchange(start, found + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(found);
            }
        }

        let start = self.cursor.fetch_add(1, Ordering::AcqRel);
        (0..len)
            .map(|step| (start + step) % len)
            .find(|&i| eligible(instances[i].as_ref()))
    }
}

/// Weighted pick favouring instances with a larger weight share
pub struct LocalAwareSelect;

impl SelectionAlgorithm for LocalAwareSelect {
    fn select(
        &self,
        instances: &[Arc<Instance>],
        eligible: &dyn Fn(&Instance) -> bool,
    ) -> Option<usize> {
        let candidates: Vec<(usize, u64)> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| eligible(inst.as_ref()))
            .map(|(i, inst)| (i, inst.weight().max(1) as u64))
            .collect();
        let total: u64 = candidates.iter().map(|(_, w)| *w).sum();
        if total == 0 {
            return None;
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for (index, weight) in &candidates {
            if point < *weight {
                return Some(*index);
            }
            point -= weight;
        }
        candidates.last().map(|(i, _)| *i)
    }
}

pub fn create_selector(algorithm: SelectAlgorithm) -> Box<dyn SelectionAlgorithm> {
    match algorithm {
        SelectAlgorithm::Random => Box::new(RandomSelect),
        SelectAlgorithm::Rolling => Box::new(RollingSelect::new()),
        SelectAlgorithm::LocalAware => Box::new(LocalAwareSelect),
    }
}
