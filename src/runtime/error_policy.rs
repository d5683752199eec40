//! # Error Policy
//!
//! Error handling and backoff logic for reconcile passes and watch streams.
//! Broker and configuration problems are resolved into conditions inside a
//! pass; what reaches this module are store and serialization failures.

use crate::controller::reconciler::{
    BackoffState, ReconcileAction, Reconciler, ReconcilerError, RequeueReason, ResourceKey,
};
use crate::observability::metrics;
use std::sync::PoisonError;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

const ERROR_BACKOFF_MIN: Duration = Duration::from_secs(1);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

fn backoff_key(kind: &str, key: &ResourceKey) -> String {
    format!("{kind}/{key}")
}

/// Handle a failed pass with a per-resource Fibonacci backoff
///
/// Backoff state is tracked per resource so one failing resource never slows
/// down the others.
pub fn handle_reconciliation_error(
    kind: &str,
    key: &ResourceKey,
    error: &ReconcilerError,
    reconciler: &Reconciler,
) -> ReconcileAction {
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        resource.kind = kind,
        resource.namespace = key.namespace.as_str(),
        resource.name = key.name.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {} {}: {:?}", kind, key, error);
    metrics::increment_reconciliation_errors(kind);

    let (delay, error_count) = {
        let mut states = reconciler
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(backoff_key(kind, key))
            .or_insert_with(|| BackoffState::new(ERROR_BACKOFF_MIN, ERROR_BACKOFF_MAX));
        state.increment_error();
        (state.backoff.next_backoff(), state.error_count)
    };

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        "🔄 Retrying with Fibonacci backoff: {}s (error count: {}, trigger source: error-backoff)",
        delay.as_secs(),
        error_count
    );
    debug!(
        "📅 Next retry scheduled: {} (in {}s, trigger source: error-backoff)",
        next_trigger_time.to_rfc3339(),
        delay.as_secs()
    );

    ReconcileAction::Requeue {
        after: delay,
        reason: RequeueReason::ErrorBackoff,
    }
}

/// Forget the error backoff of a resource after a clean pass
pub fn reset_error_backoff(kind: &str, key: &ResourceKey, reconciler: &Reconciler) {
    let mut states = reconciler
        .backoff_states
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if states.remove(&backoff_key(kind, key)).is_some() {
        debug!("Cleared error backoff of {} {}", kind, key);
    }
}

/// How a watch stream error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// Credentials or RBAC problem
    Unauthorized,
    /// Resource version too old; the watcher relists on its own
    Expired,
    /// API server asked us to slow down
    Throttled,
    /// The CRD is missing or the object vanished
    NotFound,
    Other,
}

impl WatchErrorClass {
    /// Classify a watch error from its rendered text
    #[must_use]
    pub fn classify(error: &str) -> Self {
        // 404 first: a plain-text 404 body surfaces as a serde error mentioning WatchFailed
        let not_found =
            error.contains("ObjectNotFound") || error.contains("404") || error.contains("not found");
        if (error.contains("401") || error.contains("Unauthorized")) && !not_found {
            WatchErrorClass::Unauthorized
        } else if error.contains("410")
            || error.contains("too old resource version")
            || error.contains("Expired")
            || error.contains("Gone")
        {
            WatchErrorClass::Expired
        } else if error.contains("429")
            || error.contains("storage is (re)initializing")
            || error.contains("TooManyRequests")
        {
            WatchErrorClass::Throttled
        } else if not_found {
            WatchErrorClass::NotFound
        } else {
            WatchErrorClass::Other
        }
    }
}

/// Handle a watch stream error, sleeping as the class requires
///
/// `backoff` is the current throttling delay; it doubles up to `max_backoff`
/// on every throttled error and is reset by the caller on success.
pub async fn handle_watch_stream_error(
    kind: &str,
    error: &str,
    backoff: &mut Duration,
    max_backoff: Duration,
    restart_delay: Duration,
) -> WatchErrorClass {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        resource.kind = kind,
        error = %error
    );

    let class = WatchErrorClass::classify(error);
    async {
        match class {
            WatchErrorClass::Unauthorized => {
                error!(
                    "❌ Watch of {} failed with 401 Unauthorized - RBAC may have been revoked or the token expired",
                    kind
                );
                error!(
                    "   Verify with: kubectl auth can-i watch {}s --all-namespaces --as=system:serviceaccount:<namespace>:service-catalog-controller",
                    kind.to_lowercase()
                );
                warn!(
                    "⏳ Waiting {}s before retrying the watch...",
                    restart_delay.as_secs()
                );
                tokio::time::sleep(restart_delay).await;
            }
            WatchErrorClass::Expired => {
                warn!(
                    "Watch resource version of {} expired (410), the watcher relists",
                    kind
                );
            }
            WatchErrorClass::Throttled => {
                warn!(
                    "API server throttled the {} watch (429), backing off for {}ms",
                    kind,
                    backoff.as_millis()
                );
                tokio::time::sleep(*backoff).await;
                *backoff = (*backoff * 2).min(max_backoff);
            }
            WatchErrorClass::NotFound => {
                warn!(
                    "{} watch returned 404 - the CRD may be missing: {}",
                    kind, error
                );
                tokio::time::sleep(restart_delay).await;
            }
            WatchErrorClass::Other => {
                error!("{} watch stream error: {}", kind, error);
                tokio::time::sleep(restart_delay).await;
            }
        }
    }
    .instrument(error_span)
    .await;
    class
}
