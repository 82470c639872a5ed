//! Restartable one-shot timer with generation-guarded firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio::time;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A restartable one-shot timer. `kickoff` arms the timer to fire after a
/// given duration; a later `kickoff` or a `cancel` bumps the generation
/// counter, turning any still-sleeping earlier firing into a no-op.
pub struct Timer {
    generation: Arc<AtomicU64>,
    fired: Arc<Notify>,
}

impl Timer {
    /// Creates a new unarmed timer.
    pub fn new() -> Self {
        Timer {
            generation: Arc::new(AtomicU64::new(0)),
            fired: Arc::new(Notify::new()),
        }
    }

    /// Arms the timer to fire after `dur`, superseding any earlier arm.
    pub fn kickoff(&self, dur: Duration) {
        let armed = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = Arc::clone(&self.generation);
        let fired = Arc::clone(&self.fired);
        let _ = tokio::spawn(async move {
            time::sleep(dur).await;
            if generation.load(Ordering::Acquire) == armed {
                fired.notify_one();
            }
        });
    }

    /// Invalidates any armed firing.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Waits until an armed firing goes off.
    pub async fn timeout(&self) {
        self.fired.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
