//! ReconstructionManager - container for the models of a multi-model run.
//!
//! An image set that does not form one connected component (or fails to
//! register completely) yields several independent reconstructions. Each one
//! is held behind a shared handle so a mapper can be bound to it while the
//! caller keeps read access.

use std::sync::Arc;

use parking_lot::RwLock;

use super::reconstruction::Reconstruction;

/// Shared, lockable handle to one reconstruction.
pub type SharedReconstruction = Arc<RwLock<Reconstruction>>;

/// Index of a reconstruction inside the manager.
pub type ReconstructionIdx = usize;

#[derive(Debug, Default)]
pub struct ReconstructionManager {
    reconstructions: Vec<SharedReconstruction>,
}

impl ReconstructionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reconstructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconstructions.is_empty()
    }

    /// Append a new empty reconstruction and return its index.
    pub fn add(&mut self) -> ReconstructionIdx {
        self.reconstructions
            .push(Arc::new(RwLock::new(Reconstruction::new())));
        self.reconstructions.len() - 1
    }

    /// Handle to the reconstruction at `idx`.
    pub fn get(&self, idx: ReconstructionIdx) -> Option<SharedReconstruction> {
        self.reconstructions.get(idx).cloned()
    }

    /// Remove the reconstruction at `idx`; later indices shift down by one.
    pub fn delete(&mut self, idx: ReconstructionIdx) -> Option<SharedReconstruction> {
        (idx < self.reconstructions.len()).then(|| self.reconstructions.remove(idx))
    }

    pub fn clear(&mut self) {
        self.reconstructions.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedReconstruction> {
        self.reconstructions.iter()
    }

    /// Index of the model with the most registered frames.
    pub fn largest(&self) -> Option<ReconstructionIdx> {
        self.reconstructions
            .iter()
            .enumerate()
            .max_by_key(|(_, rec)| rec.read().num_reg_frames())
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_delete() {
        let mut manager = ReconstructionManager::new();
        assert!(manager.is_empty());
        let a = manager.add();
        let b = manager.add();
        assert_eq!((a, b), (0, 1));

        let handle = manager.get(b).unwrap();
        assert!(Arc::ptr_eq(&handle, &manager.get(1).unwrap()));

        assert!(manager.delete(0).is_some());
        assert_eq!(manager.len(), 1);
        assert!(Arc::ptr_eq(&handle, &manager.get(0).unwrap()));
        assert!(manager.delete(5).is_none());
    }
}
