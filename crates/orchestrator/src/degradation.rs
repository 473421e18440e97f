//! Feature health registry with fallback and recovery.
//!
//! Auxiliary capabilities (dashboard, sidebar, status bar, file
//! logging, auto-update) can fail without touching the correctness of
//! the phase pipeline. This manager records failures, applies the
//! fallback bound to each feature, schedules recovery attempts on the
//! same exponential backoff as task retries, and tracks the
//! session-level degradation mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use codemend_core::{FallbackPriority, FeatureKind, FeatureStatus};
use events::{Event, EventEnvelope, Notifier, Severity};

use crate::backoff::backoff_floor_ms;

const DEFAULT_FEATURE_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

type FeatureAction = Arc<dyn Fn() -> bool + Send + Sync>;

/// Static policy bound to a feature. Immutable after registration.
#[derive(Clone)]
pub struct FallbackStrategy {
    pub priority: FallbackPriority,
    pub description: String,
    pub requires_user_notification: bool,
    /// Idempotent substitute behavior applied while the feature is
    /// unhealthy.
    fallback_action: FeatureAction,
    /// Optional action that restores the real feature.
    recovery_action: Option<FeatureAction>,
}

impl FallbackStrategy {
    pub fn new(priority: FallbackPriority, description: impl Into<String>) -> Self {
        Self {
            priority,
            description: description.into(),
            requires_user_notification: false,
            fallback_action: Arc::new(|| true),
            recovery_action: None,
        }
    }

    pub fn with_user_notification(mut self) -> Self {
        self.requires_user_notification = true;
        self
    }

    pub fn with_fallback_action(
        mut self,
        action: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fallback_action = Arc::new(action);
        self
    }

    pub fn with_recovery_action(
        mut self,
        action: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.recovery_action = Some(Arc::new(action));
        self
    }
}

impl std::fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("priority", &self.priority)
            .field("description", &self.description)
            .field(
                "requires_user_notification",
                &self.requires_user_notification,
            )
            .field("has_recovery_action", &self.recovery_action.is_some())
            .finish()
    }
}

struct FeatureEntry {
    status: FeatureStatus,
    strategy: FallbackStrategy,
}

/// Snapshot of system health for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DegradationSummary {
    pub degradation_mode: bool,
    pub engine_failures: u32,
    pub features: Vec<FeatureStatus>,
}

/// Tracks feature health and applies fallback policy.
///
/// Mutated only by its owner (single-writer discipline); it never
/// influences task scheduling in the phase orchestrator.
pub struct DegradationManager {
    features: HashMap<FeatureKind, FeatureEntry>,
    critical: HashSet<FeatureKind>,
    notifier: Arc<dyn Notifier>,
    degradation_mode: bool,
    /// Features already notified in the current failure episode.
    notified: HashSet<FeatureKind>,
    /// Count of critical engine-level task failures reported by the
    /// orchestrator, kept separate from feature flakiness.
    engine_failures: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl DegradationManager {
    /// Build a manager with every known feature registered under its
    /// default strategy. Dashboard and sidebar form the critical set.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        let mut manager = Self {
            features: HashMap::new(),
            critical: [FeatureKind::Dashboard, FeatureKind::SidebarPanel]
                .into_iter()
                .collect(),
            notifier,
            degradation_mode: false,
            notified: HashSet::new(),
            engine_failures: 0,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        };
        for kind in FeatureKind::ALL {
            manager.register(kind, Self::default_strategy(kind));
        }
        manager
    }

    pub fn with_backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_critical_set(mut self, critical: impl IntoIterator<Item = FeatureKind>) -> Self {
        self.critical = critical.into_iter().collect();
        self
    }

    fn default_strategy(kind: FeatureKind) -> FallbackStrategy {
        match kind {
            FeatureKind::Dashboard => {
                FallbackStrategy::new(FallbackPriority::High, "fall back to log-only progress")
                    .with_user_notification()
            }
            FeatureKind::SidebarPanel => {
                FallbackStrategy::new(FallbackPriority::High, "collapse sidebar, keep status bar")
                    .with_user_notification()
            }
            FeatureKind::StatusBar => {
                FallbackStrategy::new(FallbackPriority::Medium, "drop status bar updates")
            }
            FeatureKind::FileLogging => {
                FallbackStrategy::new(FallbackPriority::Medium, "log to stderr only")
            }
            FeatureKind::AutoUpdate => {
                FallbackStrategy::new(FallbackPriority::Low, "skip update checks")
            }
        }
    }

    /// Replace the strategy for a feature. Intended for host setup
    /// before any failures are handled.
    pub fn register(&mut self, kind: FeatureKind, strategy: FallbackStrategy) {
        let max_retries = DEFAULT_FEATURE_MAX_RETRIES;
        self.features.insert(
            kind,
            FeatureEntry {
                status: FeatureStatus::new(kind, max_retries),
                strategy,
            },
        );
    }

    /// Record a feature failure and apply its fallback.
    ///
    /// The fallback action runs only when no fallback is already active
    /// for the feature, and the user is notified at most once per
    /// failure episode.
    pub fn handle_feature_failure(&mut self, kind: FeatureKind, error: impl Into<String>) {
        let error = error.into();
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let Some(entry) = self.features.get_mut(&kind) else {
            warn!(feature = kind.as_str(), "failure for unregistered feature");
            return;
        };

        let delay_ms = backoff_floor_ms(base, max, entry.status.retry_count, 2);
        let next_retry = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        entry.status.record_failure(error.clone(), next_retry);

        warn!(
            feature = kind.as_str(),
            retry_count = entry.status.retry_count,
            error = %error,
            "feature failure recorded"
        );

        if !entry.status.fallback_active {
            let applied = (entry.strategy.fallback_action)();
            entry.status.fallback_active = true;
            info!(
                feature = kind.as_str(),
                applied,
                fallback = %entry.strategy.description,
                "fallback activated"
            );

            if entry.strategy.requires_user_notification && self.notified.insert(kind) {
                let severity = match entry.strategy.priority {
                    FallbackPriority::High => Severity::High,
                    FallbackPriority::Medium => Severity::Medium,
                    FallbackPriority::Low => Severity::Low,
                };
                self.notifier.notify(&EventEnvelope::new(Event::FeatureDegraded {
                    feature: kind.as_str().to_string(),
                    message: error,
                    severity,
                }));
            }
        }

        self.update_degradation_mode();
    }

    /// Attempt to recover a feature whose backoff has elapsed.
    ///
    /// Returns true when the feature is healthy after the call.
    pub fn attempt_feature_recovery(&mut self, kind: FeatureKind) -> bool {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let Some(entry) = self.features.get_mut(&kind) else {
            return false;
        };
        if entry.status.healthy {
            return true;
        }
        if entry.status.retries_exhausted() {
            debug!(
                feature = kind.as_str(),
                max_retries = entry.status.max_retries,
                "recovery budget exhausted, fallback stays active"
            );
            return false;
        }
        if !entry.status.recovery_due(Utc::now()) {
            return false;
        }

        let recovered = match &entry.strategy.recovery_action {
            Some(action) => action(),
            // No recovery action registered: the substitute behavior is
            // the feature, so recovery succeeds trivially.
            None => true,
        };

        if recovered {
            entry.status.reset();
            self.notified.remove(&kind);
            info!(feature = kind.as_str(), "feature recovered");
            self.notifier
                .notify(&EventEnvelope::new(Event::FeatureRecovered {
                    feature: kind.as_str().to_string(),
                }));
            self.update_degradation_mode();
            true
        } else {
            let delay_ms = backoff_floor_ms(base, max, entry.status.retry_count, 2);
            let next_retry = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
            entry
                .status
                .record_failure("recovery attempt failed".to_string(), next_retry);
            debug!(
                feature = kind.as_str(),
                retry_count = entry.status.retry_count,
                "recovery attempt failed"
            );
            false
        }
    }

    /// Called by the orchestrator when a task failure classifies as
    /// critical, so repeated engine-level failures are visible apart
    /// from flaky auxiliary features.
    pub fn record_engine_failure(&mut self, message: &str) {
        self.engine_failures += 1;
        warn!(
            engine_failures = self.engine_failures,
            message, "critical engine-level failure recorded"
        );
    }

    /// Degradation mode is active iff any critical feature is
    /// unhealthy. Each transition emits exactly one event.
    fn update_degradation_mode(&mut self) {
        let unhealthy: Vec<String> = self
            .critical
            .iter()
            .filter(|kind| {
                self.features
                    .get(kind)
                    .map(|e| !e.status.healthy)
                    .unwrap_or(false)
            })
            .map(|kind| kind.as_str().to_string())
            .collect();

        let active = !unhealthy.is_empty();
        if active != self.degradation_mode {
            self.degradation_mode = active;
            info!(active, "degradation mode changed");
            self.notifier
                .notify(&EventEnvelope::new(Event::DegradationModeChanged {
                    active,
                    unhealthy,
                }));
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation_mode
    }

    pub fn feature_status(&self, kind: FeatureKind) -> Option<&FeatureStatus> {
        self.features.get(&kind).map(|e| &e.status)
    }

    pub fn summary(&self) -> DegradationSummary {
        let mut features: Vec<FeatureStatus> = self
            .features
            .values()
            .map(|e| e.status.clone())
            .collect();
        features.sort_by_key(|s| s.kind.as_str());
        DegradationSummary {
            degradation_mode: self.degradation_mode,
            engine_failures: self.engine_failures,
            features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::EventBus;
    use events::EventBusNotifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with_bus() -> (DegradationManager, events::EventBus) {
        let bus = EventBus::new();
        let manager = DegradationManager::new(Arc::new(EventBusNotifier::new(bus.clone())));
        (manager, bus)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.event);
        }
        out
    }

    #[tokio::test]
    async fn test_repeated_failures_activate_fallback_once() {
        let (mut manager, bus) = manager_with_bus();
        let mut rx = bus.subscribe();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.register(
            FeatureKind::Dashboard,
            FallbackStrategy::new(FallbackPriority::High, "log-only")
                .with_user_notification()
                .with_fallback_action(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
        );

        for _ in 0..3 {
            manager.handle_feature_failure(FeatureKind::Dashboard, "render failed");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_degraded());

        let events = drain(&mut rx);
        let degraded_notices = events
            .iter()
            .filter(|e| matches!(e, Event::FeatureDegraded { .. }))
            .count();
        let mode_changes = events
            .iter()
            .filter(|e| matches!(e, Event::DegradationModeChanged { .. }))
            .count();
        assert_eq!(degraded_notices, 1);
        assert_eq!(mode_changes, 1);
    }

    #[tokio::test]
    async fn test_non_critical_feature_does_not_degrade_system() {
        let (mut manager, _bus) = manager_with_bus();

        manager.handle_feature_failure(FeatureKind::AutoUpdate, "update server unreachable");
        assert!(!manager.is_degraded());
        assert!(
            !manager
                .feature_status(FeatureKind::AutoUpdate)
                .unwrap()
                .healthy
        );
    }

    #[tokio::test]
    async fn test_recovery_resets_feature_and_exits_degradation() {
        let (mut manager, bus) = manager_with_bus();
        let mut rx = bus.subscribe();

        manager.register(
            FeatureKind::Dashboard,
            FallbackStrategy::new(FallbackPriority::High, "log-only")
                .with_recovery_action(|| true),
        );
        // Zero backoff so recovery is immediately due.
        manager = manager.with_backoff(0, 0);

        manager.handle_feature_failure(FeatureKind::Dashboard, "render failed");
        assert!(manager.is_degraded());

        assert!(manager.attempt_feature_recovery(FeatureKind::Dashboard));
        assert!(!manager.is_degraded());

        let status = manager.feature_status(FeatureKind::Dashboard).unwrap();
        assert!(status.healthy);
        assert_eq!(status.retry_count, 0);
        assert!(!status.fallback_active);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::FeatureRecovered { .. })));
        // One transition in, one transition out.
        let mode_changes = events
            .iter()
            .filter(|e| matches!(e, Event::DegradationModeChanged { .. }))
            .count();
        assert_eq!(mode_changes, 2);
    }

    #[tokio::test]
    async fn test_recovery_not_due_is_skipped() {
        let (mut manager, _bus) = manager_with_bus();
        // Long backoff keeps next_retry_at in the future.
        manager = manager.with_backoff(60_000, 60_000);

        manager.handle_feature_failure(FeatureKind::SidebarPanel, "panel crashed");
        assert!(!manager.attempt_feature_recovery(FeatureKind::SidebarPanel));
        assert!(manager.is_degraded());
    }

    #[tokio::test]
    async fn test_failed_recovery_backs_off_again() {
        let (mut manager, _bus) = manager_with_bus();
        manager.register(
            FeatureKind::Dashboard,
            FallbackStrategy::new(FallbackPriority::High, "log-only")
                .with_recovery_action(|| false),
        );
        manager = manager.with_backoff(0, 0);

        manager.handle_feature_failure(FeatureKind::Dashboard, "render failed");
        let before = manager
            .feature_status(FeatureKind::Dashboard)
            .unwrap()
            .retry_count;

        assert!(!manager.attempt_feature_recovery(FeatureKind::Dashboard));
        let after = manager
            .feature_status(FeatureKind::Dashboard)
            .unwrap()
            .retry_count;
        assert_eq!(after, before + 1);
        assert!(manager.is_degraded());
    }

    #[tokio::test]
    async fn test_recovery_attempts_capped_at_retry_budget() {
        let (mut manager, _bus) = manager_with_bus();
        manager.register(
            FeatureKind::Dashboard,
            FallbackStrategy::new(FallbackPriority::High, "log-only")
                .with_recovery_action(|| false),
        );
        manager = manager.with_backoff(0, 0);

        manager.handle_feature_failure(FeatureKind::Dashboard, "render failed");
        for _ in 0..10 {
            assert!(!manager.attempt_feature_recovery(FeatureKind::Dashboard));
        }

        // One initial failure plus failed recoveries, never past the budget.
        let status = manager.feature_status(FeatureKind::Dashboard).unwrap();
        assert_eq!(status.retry_count, status.max_retries);
        assert!(status.fallback_active);
        assert!(manager.is_degraded());
    }

    #[tokio::test]
    async fn test_notification_dedupe_resets_after_recovery() {
        let (mut manager, bus) = manager_with_bus();
        let mut rx = bus.subscribe();
        manager = manager.with_backoff(0, 0);

        manager.handle_feature_failure(FeatureKind::Dashboard, "first episode");
        assert!(manager.attempt_feature_recovery(FeatureKind::Dashboard));
        manager.handle_feature_failure(FeatureKind::Dashboard, "second episode");

        let events = drain(&mut rx);
        let degraded_notices = events
            .iter()
            .filter(|e| matches!(e, Event::FeatureDegraded { .. }))
            .count();
        // One per episode, not one per retry.
        assert_eq!(degraded_notices, 2);
    }

    #[tokio::test]
    async fn test_summary_reports_all_features() {
        let (mut manager, _bus) = manager_with_bus();
        manager.record_engine_failure("engine kept failing");

        let summary = manager.summary();
        assert_eq!(summary.features.len(), FeatureKind::ALL.len());
        assert_eq!(summary.engine_failures, 1);
        assert!(!summary.degradation_mode);
    }
}
