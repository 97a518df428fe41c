use std::sync::Arc;
use std::time::Duration;

use app::user;
use dashmap::{mapref::entry::Entry, DashMap};

/// Per-user request budget over a sliding window. Each accepted request
/// reserves a slot that frees itself after the window passes.
pub struct RateLimit {
    limit: usize,
    window: Duration,
    slots: Arc<DashMap<user::Id, usize>>,
}

impl RateLimit {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            slots: Arc::new(Default::default()),
        }
    }

    /// Returns true if the user should be rejected, false otherwise.
    pub fn check(&self, user_id: user::Id) -> bool {
        match self.slots.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let taken = occupied.get_mut();
                if *taken >= self.limit {
                    return true;
                }
                *taken += 1;
                self.free_slot_later(user_id);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(1);
                self.free_slot_later(user_id);
                false
            }
        }
    }

    fn free_slot_later(&self, user_id: user::Id) {
        let slots = Arc::clone(&self.slots);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Entry::Occupied(mut occupied) = slots.entry(user_id) {
                let taken = occupied.get_mut();
                *taken = taken.saturating_sub(1);
                if *taken == 0 {
                    occupied.remove();
                }
            }
        });
    }
}
