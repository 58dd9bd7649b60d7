//! Active config generation per application.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use cfgsync_core::ApplicationId;
use dashmap::DashMap;
use tracing::debug;

/// Per-application mutable state, created on first write.
#[derive(Debug, Default)]
pub struct ApplicationState {
    generation: AtomicI64,
}

impl ApplicationState {
    #[must_use]
    pub fn active_generation(&self) -> i64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Tracks the newest activated generation of each application.
///
/// Generations only move forward: activating an older generation than the
/// one already recorded is ignored. Accepted activations of any application
/// also advance a global activation count, which is what requests parked on
/// the global application compare against.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    states: DashMap<ApplicationId, Arc<ApplicationState>>,
    activations: AtomicU64,
}

impl GenerationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The state of `application`, created if missing. There is never more
    /// than one state per application.
    pub fn state(&self, application: &ApplicationId) -> Arc<ApplicationState> {
        if let Some(state) = self.states.get(application) {
            return Arc::clone(state.value());
        }
        Arc::clone(
            self.states
                .entry(application.clone())
                .or_default()
                .value(),
        )
    }

    /// 0 for applications never activated.
    #[must_use]
    pub fn active_generation(&self, application: &ApplicationId) -> i64 {
        self.states
            .get(application)
            .map_or(0, |state| state.active_generation())
    }

    /// Records `generation` as active and returns the generation in effect
    /// afterwards.
    pub fn set_active_generation(&self, application: &ApplicationId, generation: i64) -> i64 {
        let previous = self
            .state(application)
            .generation
            .fetch_max(generation, Ordering::SeqCst);
        if generation < previous {
            debug!(
                "{}ignoring activation of generation {generation}, {previous} is already active",
                application.log_prefix()
            );
            return previous;
        }
        self.activations.fetch_add(1, Ordering::SeqCst);
        generation
    }

    /// Number of accepted activations across all applications.
    #[must_use]
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    /// Whether any application was activated after `activation_count`
    /// returned `since`.
    #[must_use]
    pub fn activated_since(&self, since: u64) -> bool {
        self.activation_count() != since
    }

    /// Whether a generation newer than `generation` has been activated.
    #[must_use]
    pub fn has_newer_generation(&self, application: &ApplicationId, generation: i64) -> bool {
        self.active_generation(application) > generation
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cfgsync_core::TenantName;
    use proptest::prelude::*;

    use super::*;

    fn app(name: &str) -> ApplicationId {
        ApplicationId::new(TenantName::new("t1"), name, "default")
    }

    #[test]
    fn unknown_application_is_generation_zero() {
        let tracker = GenerationTracker::new();
        assert_eq!(tracker.active_generation(&app("a")), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn activation_count_moves_on_accepted_activations_only() {
        let tracker = GenerationTracker::new();
        let start = tracker.activation_count();
        assert!(!tracker.activated_since(start));

        tracker.set_active_generation(&app("a"), 5);
        assert!(tracker.activated_since(start));
        let after = tracker.activation_count();

        tracker.set_active_generation(&app("a"), 3);
        assert!(!tracker.activated_since(after));
        tracker.set_active_generation(&app("b"), 1);
        assert!(tracker.activated_since(after));
    }

    #[test]
    fn older_generation_is_ignored() {
        let tracker = GenerationTracker::new();
        assert_eq!(tracker.set_active_generation(&app("a"), 5), 5);
        assert_eq!(tracker.set_active_generation(&app("a"), 3), 5);
        assert_eq!(tracker.active_generation(&app("a")), 5);
        assert!(tracker.has_newer_generation(&app("a"), 4));
        assert!(!tracker.has_newer_generation(&app("a"), 5));
    }

    #[test]
    fn applications_are_independent() {
        let tracker = GenerationTracker::new();
        tracker.set_active_generation(&app("a"), 7);
        tracker.set_active_generation(&app("b"), 2);
        assert_eq!(tracker.active_generation(&app("a")), 7);
        assert_eq!(tracker.active_generation(&app("b")), 2);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn one_state_per_application() {
        let tracker = GenerationTracker::new();
        let first = tracker.state(&app("a"));
        let second = tracker.state(&app("a"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_activations_keep_the_maximum() {
        let tracker = Arc::new(GenerationTracker::new());
        let mut tasks = Vec::new();
        for generation in 1..=64 {
            let tracker = Arc::clone(&tracker);
            tasks.push(tokio::spawn(async move {
                tracker.set_active_generation(&app("a"), generation);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracker.active_generation(&app("a")), 64);
    }

    proptest! {
        #[test]
        fn generation_never_decreases(updates in proptest::collection::vec(0i64..1000, 1..50)) {
            let tracker = GenerationTracker::new();
            let mut high = 0;
            for generation in updates {
                tracker.set_active_generation(&app("a"), generation);
                let active = tracker.active_generation(&app("a"));
                prop_assert!(active >= high);
                high = high.max(generation);
                prop_assert_eq!(active, high);
            }
        }
    }
}
