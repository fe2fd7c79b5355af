use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::storage::Sid;

/// Lock key: one captured frame within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub sid: Sid,
    pub frame_id: String,
}

impl FrameKey {
    pub fn new(sid: Sid, frame_id: impl Into<String>) -> Self {
        Self {
            sid,
            frame_id: frame_id.into(),
        }
    }
}

/// One map entry. `users` counts holders and waiters of the key.
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type Entries = HashMap<FrameKey, Slot>;

/// Mutual exclusion per frame key. Entries are created on first acquisition
/// and removed once no holder or waiter is registered for them.
#[derive(Clone, Default)]
pub struct LockRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: FrameKey) -> FrameGuard {
        let (mutex, registration) = {
            let mut entries = lock_entries(&self.entries);
            let slot = entries.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            (
                Arc::clone(&slot.mutex),
                Registration {
                    key,
                    entries: Arc::clone(&self.entries),
                },
            )
        };
        // A cancelled wait drops `registration` here, which unregisters it.
        let guard = mutex.lock_owned().await;
        debug!(
            "Acquired frame lock {}/{}",
            registration.key.sid, registration.key.frame_id
        );
        FrameGuard {
            _guard: guard,
            registration,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers interest in a key for as long as it lives.
struct Registration {
    key: FrameKey,
    entries: Arc<Mutex<Entries>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = lock_entries(&self.entries);
        let Some(slot) = entries.get_mut(&self.key) else {
            return;
        };
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 {
            entries.remove(&self.key);
            debug!("Reclaimed frame lock {}/{}", self.key.sid, self.key.frame_id);
        }
    }
}

/// Held for the duration of a critical section; releases on drop.
pub struct FrameGuard {
    // Field order matters: the mutex is released before unregistering.
    _guard: OwnedMutexGuard<()>,
    registration: Registration,
}

impl FrameGuard {
    pub fn key(&self) -> &FrameKey {
        &self.registration.key
    }
}

fn lock_entries(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
