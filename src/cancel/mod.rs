//! `CancellationRegistry`: one `CancellationToken` per running build,
//! grounded on the server registry idiom in `src/server/manager.rs`
//! (`DashMap<key, value>`) combined with the composite-cancellation token
//! used throughout `src/environment/docker/power.rs`.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::model::BuildId;

struct Entry {
    token: CancellationToken,
    timed_out: std::sync::atomic::AtomicBool,
}

/// Tracks the in-flight `CancellationToken` for every currently-running
/// build so that an external cancel request or a timeout can reach it.
pub struct CancellationRegistry {
    entries: DashMap<BuildId, Entry>,
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers `build_id` as running, returning its token. Per §4.7,
    /// registering an already-registered `build_id` replaces the prior
    /// entry rather than erroring: a crash-recovered build re-registering
    /// after a restart must win over any stale bookkeeping, not be refused
    /// by it.
    pub fn register(&self, build_id: BuildId) -> CancellationToken {
        let token = CancellationToken::new();
        self.entries.insert(
            build_id,
            Entry {
                token: token.clone(),
                timed_out: std::sync::atomic::AtomicBool::new(false),
            },
        );
        token
    }

    pub fn unregister(&self, build_id: BuildId) {
        self.entries.remove(&build_id);
    }

    pub fn is_running(&self, build_id: BuildId) -> bool {
        self.entries.contains_key(&build_id)
    }

    /// Requests cancellation of `build_id`, marking it as an external
    /// cancel rather than a timeout. Returns `false` if the build is not
    /// currently running (nothing to cancel).
    pub fn try_cancel(&self, build_id: BuildId) -> bool {
        match self.entries.get(&build_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Requests cancellation because the build's deadline elapsed. Marks
    /// the entry as timed-out so `was_timeout` can distinguish a timeout
    /// from an external cancel once both race to cancel the same token
    /// (§5: composite cancellation = externalCancel ∪ timeoutDeadline).
    pub fn cancel_for_timeout(&self, build_id: BuildId) -> bool {
        match self.entries.get(&build_id) {
            Some(entry) => {
                entry
                    .timed_out
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the cancellation observed for `build_id` was caused by its
    /// deadline elapsing rather than an external cancel request. Used by
    /// the orchestrator to map a cancelled composite token to `Cancelled`
    /// vs. `TimedOut` (§5).
    pub fn was_timeout(&self, build_id: BuildId) -> bool {
        self.entries
            .get(&build_id)
            .map(|entry| entry.timed_out.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_cancel_then_unregister() {
        let registry = CancellationRegistry::new();
        let build_id = BuildId(1);

        let token = registry.register(build_id);
        assert!(registry.is_running(build_id));
        assert!(!token.is_cancelled());

        assert!(registry.try_cancel(build_id));
        assert!(token.is_cancelled());
        assert!(!registry.was_timeout(build_id));

        registry.unregister(build_id);
        assert!(!registry.is_running(build_id));
    }

    #[test]
    fn cancelling_unknown_build_returns_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.try_cancel(BuildId(99)));
    }

    #[test]
    fn timeout_cancellation_is_distinguishable_from_external_cancel() {
        let registry = CancellationRegistry::new();
        let build_id = BuildId(2);
        registry.register(build_id);

        assert!(registry.cancel_for_timeout(build_id));
        assert!(registry.was_timeout(build_id));
    }

    #[test]
    fn re_registering_replaces_the_prior_entry() {
        let registry = CancellationRegistry::new();
        let build_id = BuildId(3);

        let first = registry.register(build_id);
        let second = registry.register(build_id);
        registry.try_cancel(build_id);

        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
    }
}
