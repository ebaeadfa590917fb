//! Config watcher: coalesced reload triggers from four sources.
//!
//! 1. file-system notifications on the catalog path (preferred),
//! 2. a timed mtime poll (fallback, always on as a safety net),
//! 3. SIGHUP,
//! 4. in-process calls from the `reload_config` admin tool.
//!
//! Triggers within the debounce window collapse into one. Programmatic
//! saves arm an ignore-next-change latch so the aggregator does not reload
//! its own writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::Watcher as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use magg_core::WatchMode;

/// Debounce window for bursts of triggers.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Where a reload trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    FileChanged,
    Poll,
    Signal,
    Manual,
}

impl ReloadTrigger {
    /// Only file-driven triggers honor the ignore-next-change latch.
    const fn respects_latch(self) -> bool {
        matches!(self, Self::FileChanged | Self::Poll)
    }
}

/// Cloneable handle to the ignore-next-change latch, so the catalog store
/// path can arm it without owning the watcher.
#[derive(Clone)]
pub struct WatcherLatch {
    ignore_next: Arc<AtomicBool>,
}

impl WatcherLatch {
    /// Arm the latch: the next file-driven trigger is swallowed.
    pub fn ignore_next_change(&self) {
        self.ignore_next.store(true, Ordering::SeqCst);
    }
}

/// Handle owned by the server core.
pub struct ConfigWatcher {
    triggers: mpsc::Receiver<ReloadTrigger>,
    ignore_next: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ConfigWatcher {
    /// Arm the latch: the next file-driven trigger is swallowed.
    pub fn ignore_next_change(&self) {
        self.ignore_next.store(true, Ordering::SeqCst);
    }

    /// Cloneable latch handle.
    #[must_use]
    pub fn latch(&self) -> WatcherLatch {
        WatcherLatch {
            ignore_next: Arc::clone(&self.ignore_next),
        }
    }

    /// Wait for the next effective reload trigger, debounced. Returns
    /// `None` on shutdown.
    pub async fn next_reload(&mut self) -> Option<ReloadTrigger> {
        loop {
            let trigger = tokio::select! {
                trigger = self.triggers.recv() => trigger?,
                () = self.cancel.cancelled() => return None,
            };

            if trigger.respects_latch() && self.ignore_next.swap(false, Ordering::SeqCst) {
                tracing::debug!("ignoring config change from our own save");
                continue;
            }

            // Debounce: let the burst settle, keep the strongest trigger.
            let mut effective = trigger;
            let settle = tokio::time::sleep(DEBOUNCE_WINDOW);
            tokio::pin!(settle);
            loop {
                tokio::select! {
                    () = &mut settle => break,
                    more = self.triggers.recv() => match more {
                        Some(t) if t == ReloadTrigger::Manual => effective = t,
                        Some(_) => {}
                        None => break,
                    }
                }
            }

            return Some(effective);
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Sender half used by the admin `reload_config` tool.
#[derive(Clone)]
pub struct ReloadRequester {
    triggers: mpsc::Sender<ReloadTrigger>,
}

impl ReloadRequester {
    pub async fn request_reload(&self) {
        let _ = self.triggers.send(ReloadTrigger::Manual).await;
    }
}

/// A watcher with no file or signal sources: only manual triggers flow.
/// Used when auto-reload is disabled.
#[must_use]
pub fn inert_watcher() -> (ConfigWatcher, ReloadRequester) {
    let (tx, rx) = mpsc::channel(16);
    (
        ConfigWatcher {
            triggers: rx,
            ignore_next: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        },
        ReloadRequester { triggers: tx },
    )
}

/// Start watching the catalog path. Always returns a watcher; the
/// file-notification source degrades to polling when unavailable.
#[must_use]
pub fn spawn_watcher(
    config_path: &Path,
    mode: WatchMode,
    poll_interval: Duration,
) -> (ConfigWatcher, ReloadRequester) {
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    if mode != WatchMode::Off {
        start_fs_watcher(config_path, tx.clone(), &cancel, mode);
    }
    start_poller(config_path.to_path_buf(), poll_interval, tx.clone(), &cancel);
    start_signal_listener(tx.clone(), &cancel);

    (
        ConfigWatcher {
            triggers: rx,
            ignore_next: Arc::new(AtomicBool::new(false)),
            cancel,
        },
        ReloadRequester { triggers: tx },
    )
}

/// Watch the catalog's parent directory for events touching the file.
fn start_fs_watcher(
    config_path: &Path,
    tx: mpsc::Sender<ReloadTrigger>,
    cancel: &CancellationToken,
    mode: WatchMode,
) {
    let target = match config_path.canonicalize() {
        Ok(p) => p,
        Err(_) => config_path.to_path_buf(),
    };
    let Some(parent) = target.parent().map(Path::to_path_buf) else {
        return;
    };

    let event_tx = tx;
    let watch_target = target.clone();
    let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else { return };
        if !matches!(
            event.kind,
            notify::EventKind::Create(_)
                | notify::EventKind::Modify(_)
                | notify::EventKind::Remove(_)
        ) {
            return;
        }
        if event.paths.iter().any(|p| p.ends_with(
            watch_target.file_name().unwrap_or_default(),
        )) {
            let _ = event_tx.try_send(ReloadTrigger::FileChanged);
        }
    });

    match watcher {
        Ok(mut watcher) => {
            if let Err(e) = watcher.watch(&parent, notify::RecursiveMode::NonRecursive) {
                tracing::warn!(error = %e, "file watcher failed to start, polling only");
                return;
            }
            tracing::debug!(path = %parent.display(), "config file watcher started");
            // Keep the watcher alive until shutdown.
            let hold_cancel = cancel.clone();
            tokio::spawn(async move {
                hold_cancel.cancelled().await;
                drop(watcher);
            });
        }
        Err(e) => {
            if mode == WatchMode::On {
                tracing::error!(error = %e, "file watcher required but unavailable");
            } else {
                tracing::debug!(error = %e, "file watcher unavailable, polling only");
            }
        }
    }
}

/// Poll the file's mtime as a fallback trigger source.
fn start_poller(
    path: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<ReloadTrigger>,
    cancel: &CancellationToken,
) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut last_mtime: Option<SystemTime> = mtime(&path);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = mtime(&path);
                    match (last_mtime, current) {
                        (Some(old), Some(new)) if new > old => {
                            last_mtime = Some(new);
                            let _ = tx.try_send(ReloadTrigger::Poll);
                        }
                        (None, Some(new)) => {
                            // File appeared.
                            last_mtime = Some(new);
                            let _ = tx.try_send(ReloadTrigger::Poll);
                        }
                        (Some(_), None) => {
                            tracing::warn!(path = %path.display(), "config file disappeared");
                            last_mtime = None;
                        }
                        _ => {}
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    });
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(unix)]
fn start_signal_listener(tx: mpsc::Sender<ReloadTrigger>, cancel: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let cancel = cancel.clone();
    tokio::spawn(async move {
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            tracing::debug!("SIGHUP listener unavailable");
            return;
        };
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("SIGHUP received, reloading config");
                    let _ = tx.try_send(ReloadTrigger::Signal);
                }
                () = cancel.cancelled() => break,
            }
        }
    });
}

#[cfg(not(unix))]
fn start_signal_listener(_tx: mpsc::Sender<ReloadTrigger>, _cancel: &CancellationToken) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_trigger_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (mut watcher, requester) =
            spawn_watcher(&path, WatchMode::Off, Duration::from_secs(60));

        requester.request_reload().await;
        let trigger = tokio::time::timeout(Duration::from_secs(2), watcher.next_reload())
            .await
            .unwrap();
        assert_eq!(trigger, Some(ReloadTrigger::Manual));
        watcher.stop();
    }

    #[tokio::test]
    async fn burst_collapses_to_one_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (mut watcher, requester) =
            spawn_watcher(&path, WatchMode::Off, Duration::from_secs(60));

        for _ in 0..5 {
            requester.request_reload().await;
        }

        let first = tokio::time::timeout(Duration::from_secs(2), watcher.next_reload())
            .await
            .unwrap();
        assert!(first.is_some());

        // The rest of the burst was folded into the first delivery.
        let extra = tokio::time::timeout(Duration::from_millis(300), watcher.next_reload()).await;
        assert!(extra.is_err(), "burst should collapse into one trigger");
        watcher.stop();
    }

    #[tokio::test]
    async fn poll_detects_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (mut watcher, _requester) =
            spawn_watcher(&path, WatchMode::Off, Duration::from_millis(50));

        // Ensure the mtime moves forward even on coarse-grained filesystems.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, r#"{"servers": {}}"#).unwrap();

        let trigger = tokio::time::timeout(Duration::from_secs(5), watcher.next_reload())
            .await
            .expect("poll should notice the edit");
        assert!(matches!(
            trigger,
            Some(ReloadTrigger::Poll | ReloadTrigger::FileChanged)
        ));
        watcher.stop();
    }

    #[tokio::test]
    async fn latch_swallows_one_file_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (mut watcher, _requester) =
            spawn_watcher(&path, WatchMode::Off, Duration::from_millis(50));
        watcher.ignore_next_change();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, r#"{"servers": {}}"#).unwrap();

        // The save is ours; nothing should surface.
        let trigger = tokio::time::timeout(Duration::from_millis(500), watcher.next_reload()).await;
        assert!(trigger.is_err());
        watcher.stop();
    }
}
