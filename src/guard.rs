use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::handshake::Artifact;

/// Idempotency marker for authorization artifacts.
///
/// An entry is created the first time an artifact is observed and is only
/// removed when redeeming it fails, so a successful artifact can never be
/// replayed. Clones share the same set; hand one clone to every coordinator
/// and callback receiver of a process lifetime.
#[derive(Debug, Clone, Default)]
pub struct PendingArtifactGuard {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl PendingArtifactGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the caller is the first to observe `artifact`.
    pub fn try_acquire(&self, artifact: &Artifact) -> bool {
        self.lock().insert(artifact.key())
    }

    /// Permits a retry of a failed artifact.
    pub fn release(&self, artifact: &Artifact) {
        self.lock().remove(&artifact.key());
    }

    pub fn is_held(&self, artifact: &Artifact) -> bool {
        self.lock().contains(&artifact.key())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::PendingArtifactGuard;
    use crate::handshake::Artifact;

    #[test]
    fn first_observer_wins() {
        let guard = PendingArtifactGuard::new();
        let artifact = Artifact::Code("abc123".to_string());

        assert!(guard.try_acquire(&artifact));
        assert!(!guard.try_acquire(&artifact));
        assert!(guard.is_held(&artifact));
    }

    #[test]
    fn clones_share_entries() {
        let guard = PendingArtifactGuard::new();
        let remounted = guard.clone();
        let artifact = Artifact::TempToken("tok1".to_string());

        assert!(guard.try_acquire(&artifact));
        assert!(!remounted.try_acquire(&artifact));
    }

    #[test]
    fn release_permits_retry() {
        let guard = PendingArtifactGuard::new();
        let artifact = Artifact::Code("abc123".to_string());

        assert!(guard.try_acquire(&artifact));
        guard.release(&artifact);
        assert!(guard.is_empty());
        assert!(guard.try_acquire(&artifact));
    }

    #[test]
    fn code_and_temp_token_with_same_value_are_distinct() {
        let guard = PendingArtifactGuard::new();
        assert!(guard.try_acquire(&Artifact::Code("same".to_string())));
        assert!(guard.try_acquire(&Artifact::TempToken("same".to_string())));
        assert_eq!(guard.len(), 2);
    }
}
