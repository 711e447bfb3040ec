use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("gateway is at connection capacity")]
    GlobalCapacity,
    #[error("too many connections for this user")]
    UserCapacity,
}

/// Global and per-user connection counters shared by every session.
pub struct ConnectionRegistry {
    active: AtomicUsize,
    per_user: DashMap<i64, usize>,
    max_global: usize,
    max_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_global: usize, max_per_user: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            per_user: DashMap::new(),
            max_global,
            max_per_user,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn user_connections(&self, user_id: i64) -> usize {
        self.per_user.get(&user_id).map(|c| *c).unwrap_or(0)
    }

    /// Reserve a slot for a new connection. Anonymous connections only count
    /// against the global cap.
    pub fn try_acquire(
        self: &Arc<Self>,
        user_id: Option<i64>,
    ) -> Result<ConnectionSlot, SlotError> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_global {
                return Err(SlotError::GlobalCapacity);
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        // From here on the slot releases the global count on drop.
        let mut slot = ConnectionSlot {
            registry: self.clone(),
            user_id: None,
        };

        if let Some(user_id) = user_id {
            let mut count = self.per_user.entry(user_id).or_insert(0);
            if *count >= self.max_per_user {
                return Err(SlotError::UserCapacity);
            }
            *count += 1;
            slot.user_id = Some(user_id);
        }
        Ok(slot)
    }

    fn release(&self, user_id: Option<i64>) {
        if let Some(user_id) = user_id {
            // Check and removal happen under one shard lock so a concurrent
            // acquire cannot land in between.
            if let Entry::Occupied(mut count) = self.per_user.entry(user_id) {
                if *count.get() <= 1 {
                    count.remove();
                } else {
                    *count.get_mut() -= 1;
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by a session for its whole life.
pub struct ConnectionSlot {
    registry: Arc<ConnectionRegistry>,
    user_id: Option<i64>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.release(self.user_id.take());
    }
}

/// Per-user command budget, shared across all of a user's connections.
pub struct CommandRateLimiter {
    commands: DefaultKeyedRateLimiter<i64>,
}

impl CommandRateLimiter {
    pub fn per_minute(max_commands: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max_commands).unwrap_or(NonZeroU32::MIN));
        Self {
            commands: RateLimiter::keyed(quota),
        }
    }

    /// `Err` carries the wait in milliseconds before the next command fits.
    pub fn check(&self, user_id: i64) -> Result<(), u64> {
        let now = DefaultClock::default().now();
        match self.commands.check_key(&user_id) {
            Ok(()) => Ok(()),
            Err(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
        }
    }

    pub fn retain_recent(&self) {
        self.commands.retain_recent();
        self.commands.shrink_to_fit();
    }
}
