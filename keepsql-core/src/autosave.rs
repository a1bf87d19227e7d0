/*!
Debounced auto-save.

[`AutoSaveManager`] turns a stream of "data changed" notifications into a
trailing save once the stream has been quiet for the configured delay. Each
notification cancels the armed timer before arming a new one, so a superseded
timer can never fire. At most one save runs at a time; a notification that
arrives during a save arms a follow-up save rather than starting a second one.

A failed save leaves the pending flag set. Nothing retries on its own: the next
notification or an explicit flush tries again.
*/

use crate::observability;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default quiet period before a save
pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_secs(5);

/// Persists the current engine state
pub type SaveCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Counters describing auto-save activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSaveStats {
    pub saves_completed: u64,
    pub saves_failed: u64,
    pub pending: bool,
    pub last_error: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SaveState {
    pending: bool,
    /// Bumped by every notification; a save only clears `pending` when no
    /// notification arrived while it ran.
    change_epoch: u64,
    timer: Option<JoinHandle<()>>,
    /// Identifies the armed timer. A woken timer whose generation is stale
    /// does nothing.
    generation: u64,
    stats: AutoSaveStats,
}

struct Shared {
    delay: Duration,
    save: SaveCallback,
    state: Mutex<SaveState>,
    save_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SaveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one save. Returns `Ok(false)` when `only_if_pending` is set and
    /// there was nothing to save.
    async fn run_save(&self, only_if_pending: bool) -> Result<bool> {
        let _in_flight = self.save_lock.lock().await;

        let epoch = {
            let state = self.lock_state();
            if only_if_pending && !state.pending {
                debug!("Auto-save skipped: nothing pending");
                return Ok(false);
            }
            state.change_epoch
        };

        let started = Instant::now();
        let result = (self.save)().await;
        let elapsed = started.elapsed();
        observability::record_save(elapsed, result.is_ok());

        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                if state.change_epoch == epoch {
                    state.pending = false;
                }
                state.stats.saves_completed += 1;
                state.stats.last_error = None;
                state.stats.last_saved_at = Some(Utc::now());
                debug!("Save completed in {:?}", elapsed);
                Ok(true)
            }
            Err(e) => {
                // Whatever this save tried to write is still only in memory.
                state.pending = true;
                state.stats.saves_failed += 1;
                state.stats.last_error = Some(e.to_string());
                if e.is_quota_exceeded() {
                    error!("Save refused, storage is full: {}", e);
                } else {
                    warn!("Save failed, changes remain pending: {}", e);
                }
                Err(e)
            }
        }
    }
}

/// Debounces change notifications into saves
#[derive(Clone)]
pub struct AutoSaveManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AutoSaveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSaveManager")
            .field("delay", &self.shared.delay)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AutoSaveManager {
    /// Create a manager that calls `save` once changes have been quiet for `delay`
    pub fn new(delay: Duration, save: SaveCallback) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay,
                save,
                state: Mutex::new(SaveState::default()),
                save_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Record a change and (re)arm the debounce timer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify_changed(&self) {
        let mut state = self.shared.lock_state();
        state.pending = true;
        state.change_epoch += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let shared = Arc::clone(&self.shared);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.delay).await;
            {
                let mut state = shared.lock_state();
                if state.generation != generation {
                    return;
                }
                // From here on the save cannot be cancelled.
                state.timer = None;
            }
            if let Err(e) = shared.run_save(true).await {
                debug!("Debounced save failed: {}", e);
            }
        }));
        debug!("Auto-save armed for {:?}", self.shared.delay);
    }

    /// Cancel the armed timer without saving
    pub fn cancel_pending(&self) {
        let mut state = self.shared.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!("Auto-save timer cancelled");
        }
        state.generation += 1;
    }

    /// Cancel the timer and save now
    ///
    /// Waits for a save already in flight, then always runs one more save.
    pub async fn force_flush(&self) -> Result<()> {
        self.cancel_pending();
        self.shared.run_save(false).await.map(|_| ())
    }

    /// Best-effort flush for a termination signal
    ///
    /// Returns `true` when there were unsaved changes and a save was attempted,
    /// so the host can warn that exit may be delayed.
    pub async fn flush_on_terminate(&self) -> Result<bool> {
        if !self.is_pending() {
            return Ok(false);
        }
        info!("Termination requested with unsaved changes; flushing");
        self.cancel_pending();
        self.shared.run_save(true).await
    }

    /// Whether changes are waiting to be saved
    pub fn is_pending(&self) -> bool {
        self.shared.lock_state().pending
    }

    pub fn stats(&self) -> AutoSaveStats {
        let state = self.shared.lock_state();
        AutoSaveStats {
            pending: state.pending,
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeepError;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    const DELAY: Duration = Duration::from_secs(5);

    fn counting(saves: Arc<AtomicUsize>) -> SaveCallback {
        Arc::new(move || {
            let saves = Arc::clone(&saves);
            async move {
                saves.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_save_with_latest_state() {
        let value = Arc::new(AtomicU64::new(0));
        let saved_values = Arc::new(Mutex::new(Vec::new()));

        let callback: SaveCallback = {
            let value = Arc::clone(&value);
            let saved_values = Arc::clone(&saved_values);
            Arc::new(move || {
                let observed = value.load(Ordering::SeqCst);
                let saved_values = Arc::clone(&saved_values);
                async move {
                    saved_values.lock().unwrap().push(observed);
                    Ok(())
                }
                .boxed()
            })
        };
        let manager = AutoSaveManager::new(DELAY, callback);

        for n in 1..=3 {
            value.store(n, Ordering::SeqCst);
            manager.notify_changed();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(manager.is_pending());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(saved_values.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*saved_values.lock().unwrap(), vec![3]);
        assert!(!manager.is_pending());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(saved_values.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_during_save_schedules_one_follow_up() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let saves = Arc::new(AtomicUsize::new(0));

        let callback: SaveCallback = {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let saves = Arc::clone(&saves);
            Arc::new(move || {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let saves = Arc::clone(&saves);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    saves.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })
        };
        let manager = AutoSaveManager::new(DELAY, callback);

        manager.notify_changed();
        // First save starts at 5s and runs until 7s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 1);

        manager.notify_changed();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert!(manager.is_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!manager.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_cancels_timer() {
        let saves = Arc::new(AtomicUsize::new(0));
        let manager = AutoSaveManager::new(DELAY, counting(Arc::clone(&saves)));

        manager.notify_changed();
        manager.force_flush().await.unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert!(!manager.is_pending());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_saves_without_pending_changes() {
        let saves = Arc::new(AtomicUsize::new(0));
        let manager = AutoSaveManager::new(DELAY, counting(Arc::clone(&saves)));

        manager.force_flush().await.unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_failure_keeps_pending_until_next_change() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let callback: SaveCallback = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(KeepError::QuotaExceeded {
                            needed: 4096,
                            available: 100,
                        })
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
        };
        let manager = AutoSaveManager::new(DELAY, callback);

        manager.notify_changed();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(manager.is_pending());

        let stats = manager.stats();
        assert_eq!(stats.saves_failed, 1);
        assert!(stats.pending);
        assert!(stats.last_error.unwrap().contains("quota"));

        // No background retry loop.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        manager.notify_changed();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!manager.is_pending());

        let stats = manager.stats();
        assert_eq!(stats.saves_completed, 1);
        assert!(stats.last_error.is_none());
        assert!(stats.last_saved_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_force_flush_marks_changes_pending() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let callback: SaveCallback = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(KeepError::storage("disk went away"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
        };
        let manager = AutoSaveManager::new(DELAY, callback);

        // Nothing was notified; the failed save itself leaves unsaved state.
        assert!(!manager.is_pending());
        assert!(manager.force_flush().await.is_err());
        assert!(manager.is_pending());

        assert!(manager.flush_on_terminate().await.unwrap());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!manager.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_terminate_only_when_pending() {
        let saves = Arc::new(AtomicUsize::new(0));
        let manager = AutoSaveManager::new(DELAY, counting(Arc::clone(&saves)));

        assert!(!manager.flush_on_terminate().await.unwrap());
        assert_eq!(saves.load(Ordering::SeqCst), 0);

        manager.notify_changed();
        assert!(manager.flush_on_terminate().await.unwrap());
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert!(!manager.is_pending());
    }
}
