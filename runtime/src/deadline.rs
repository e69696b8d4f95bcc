//! Deadline watcher.
//!
//! Reclaims the workspace shortly before the invocation's hard deadline,
//! whether or not the main flow has finished with it. The watcher cannot stop
//! an in-flight pull, build or push; it only removes the directory they write
//! into.

use std::time::Duration;

use soci_builder_core::context::InvocationContext;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::workspace::Workspace;

/// Invocation deadline and the margin before it at which cleanup triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub safety_margin: Duration,
}

impl Deadline {
    pub fn new(at: Instant, safety_margin: Duration) -> Self {
        Self { at, safety_margin }
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration, safety_margin: Duration) -> Self {
        Self::new(Instant::now() + timeout, safety_margin)
    }

    /// When proactive cleanup fires. A margin reaching past the clock's
    /// origin fires immediately.
    pub fn trigger_at(&self) -> Instant {
        self.at
            .checked_sub(self.safety_margin)
            .unwrap_or_else(Instant::now)
    }
}

/// How the watcher ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Trigger time elapsed; the workspace was destroyed.
    Fired,
    /// Cancelled before the trigger time.
    Cancelled,
}

pub struct DeadlineWatcher;

impl DeadlineWatcher {
    /// Start watching `deadline` on behalf of `workspace`.
    pub fn arm(deadline: Deadline, workspace: Workspace, ctx: InvocationContext) -> WatcherHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let trigger_at = deadline.trigger_at();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    tracing::debug!(request_id = %ctx.request_id(), "Deadline watcher cancelled");
                    WatchOutcome::Cancelled
                }
                _ = tokio::time::sleep_until(trigger_at) => {
                    workspace.destroy(&ctx).await;
                    tracing::error!(
                        fatal = true,
                        request_id = %ctx.request_id(),
                        registry = ctx.registry().unwrap_or_default(),
                        repository = ctx.repository().unwrap_or_default(),
                        digest = ctx.image_digest().unwrap_or_default(),
                        workspace = %workspace.root_dir().display(),
                        safety_margin_secs = deadline.safety_margin.as_secs(),
                        "Invocation timeout imminent, workspace reclaimed"
                    );
                    WatchOutcome::Fired
                }
            }
        });

        WatcherHandle {
            cancel_tx,
            handle,
        }
    }
}

/// Cancellation handle of an armed watcher.
pub struct WatcherHandle {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<WatchOutcome>,
}

impl WatcherHandle {
    /// Signal the watcher to stand down and wait for it to finish.
    ///
    /// Consumes the handle, so the signal is sent at most once. Returns
    /// [`WatchOutcome::Fired`] if the trigger time had already elapsed.
    pub async fn cancel(self) -> WatchOutcome {
        let _ = self.cancel_tx.send(true);
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "Deadline watcher task failed");
                WatchOutcome::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use soci_builder_core::config::BuilderConfig;
    use tempfile::TempDir;

    fn workspace(tmp: &TempDir) -> Workspace {
        WorkspaceManager::new(&BuilderConfig {
            workspace_root: tmp.path().to_path_buf(),
            ..Default::default()
        })
        .create(&InvocationContext::new())
        .unwrap()
    }

    #[test]
    fn test_trigger_at_subtracts_margin() {
        let now = Instant::now();
        let deadline = Deadline::new(now + Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(deadline.trigger_at(), now + Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_cancel_before_trigger_keeps_workspace() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp);
        let deadline = Deadline::after(Duration::from_secs(30), Duration::from_secs(10));

        let watcher = DeadlineWatcher::arm(deadline, ws.clone(), InvocationContext::new());
        assert_eq!(watcher.cancel().await, WatchOutcome::Cancelled);
        assert!(ws.root_dir().exists());
        assert!(!ws.is_destroyed());
    }

    #[tokio::test]
    async fn test_fires_at_trigger_time() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp);
        let deadline = Deadline::after(Duration::from_millis(50), Duration::from_millis(40));

        let watcher = DeadlineWatcher::arm(deadline, ws.clone(), InvocationContext::new());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ws.root_dir().exists());
        assert!(ws.is_destroyed());
        assert_eq!(watcher.cancel().await, WatchOutcome::Fired);
    }

    #[tokio::test]
    async fn test_main_flow_destroy_after_fire_is_noop() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp);
        let ctx = InvocationContext::new();
        let deadline = Deadline::after(Duration::ZERO, Duration::ZERO);

        let watcher = DeadlineWatcher::arm(deadline, ws.clone(), ctx.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.cancel().await, WatchOutcome::Fired);
        assert!(!ws.destroy(&ctx).await);
    }
}
