//! Tracks worker visibility and drives each worker's binding levels.

pub(crate) mod moderate_pool;

#[cfg(test)]
mod test;

use std::collections::HashMap;

use self::moderate_pool::ModerateBindingPool;
use crate::{
    allocator::ConnectionAllocator,
    binder::Pid,
    conn::ChildConnection,
    launcher::manager::{ManagementRequest, ManagementSender},
    memory::MemoryPressureLevel,
    options::{HostProfile, MODERATE_DRAIN_DELAY},
};

/// Per-worker visibility state tracked by the manager.
#[derive(Clone, Copy, Debug)]
struct ManagedState {
    /// The allocator slot holding the worker's connection.
    slot: usize,

    in_foreground: bool,
    boost_for_pending_views: bool,
    bound_for_background_period: bool,

    /// Whether the manager currently holds a foreground strong binding on
    /// the connection. Needed because the binding is removed with
    /// hysteresis: a worker can return to the foreground while its removal
    /// is still pending, in which case no new binding must be added.
    strong_held: bool,

    /// Bumped on every foreground transition; a delayed strong-binding
    /// removal only applies if its captured epoch is still current.
    drop_epoch: u64,
}

impl ManagedState {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            in_foreground: false,
            boost_for_pending_views: false,
            bound_for_background_period: false,
            strong_held: false,
            drop_epoch: 0,
        }
    }
}

/// Adjusts worker binding levels in response to visibility changes, host
/// lifecycle transitions, and memory pressure.
///
/// The manager operates on the sandboxed allocator's connections; it tracks
/// only bookkeeping itself. It enforces two system-wide rules: on
/// low-memory hosts at most one worker holds any OOM-protecting binding,
/// and while the host application is backgrounded the most recently
/// foregrounded worker is pinned with an extra strong binding.
#[derive(Debug)]
pub(crate) struct BindingManager {
    profile: HostProfile,
    sender: ManagementSender,
    managed: HashMap<Pid, ManagedState>,
    last_foreground: Option<Pid>,
    bound_for_background: Option<Pid>,
    host_foreground: bool,
    moderate_pool: Option<ModerateBindingPool>,

    /// Bumped whenever the host returns to the foreground, invalidating any
    /// scheduled background drain of the moderate pool.
    drain_epoch: u64,
}

impl BindingManager {
    pub(crate) fn new(profile: HostProfile, sender: ManagementSender) -> Self {
        Self {
            profile,
            sender,
            managed: HashMap::new(),
            last_foreground: None,
            bound_for_background: None,
            host_foreground: true,
            moderate_pool: None,
            drain_epoch: 0,
        }
    }

    /// Registers a worker once its setup has completed.
    pub(crate) fn add_connection(&mut self, pid: Pid, slot: usize) {
        debug_assert!(
            !self.managed.contains_key(&pid),
            "worker registered twice with the binding manager"
        );
        self.managed.insert(pid, ManagedState::new(slot));
    }

    /// Deregisters a dead or stopped worker.
    pub(crate) fn remove_connection(&mut self, pid: Pid) {
        if self.managed.remove(&pid).is_none() {
            return;
        }
        if self.last_foreground == Some(pid) {
            self.last_foreground = None;
        }
        if self.bound_for_background == Some(pid) {
            self.bound_for_background = None;
        }
        if let Some(pool) = self.moderate_pool.as_mut() {
            pool.remove(pid);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_connection(&self, pid: Pid) -> bool {
        self.managed.contains_key(&pid)
    }

    /// The visibility signal from the embedder. Binding additions always
    /// precede removals so the worker never transiently drops below the
    /// importance either state implies.
    pub(crate) fn set_priority(
        &mut self,
        alloc: &mut ConnectionAllocator,
        pid: Pid,
        foreground: bool,
        boost_for_pending_views: bool,
    ) {
        let Some(mut state) = self.managed.get(&pid).copied() else {
            tracing::warn!(%pid, "priority change for a worker the binding manager does not track");
            return;
        };
        let was_foreground = state.in_foreground;
        let was_boosted = state.boost_for_pending_views;

        if foreground && !was_foreground {
            state.drop_epoch += 1;
            if !state.strong_held {
                if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                    conn.add_strong_binding();
                }
                state.strong_held = true;
            }
            let in_pool = self
                .moderate_pool
                .as_mut()
                .is_some_and(|pool| pool.remove(pid));
            if in_pool {
                if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                    conn.remove_moderate_binding();
                }
            }
        }
        if boost_for_pending_views && !was_boosted {
            if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                conn.add_initial_binding();
            }
        }

        if foreground && self.profile.low_memory {
            // At most one worker may be OOM-protected on a low-memory host;
            // the incoming foreground worker displaces the previous one.
            if let Some(previous) = self.last_foreground.filter(|previous| *previous != pid) {
                if let Some(conn) = Self::conn_of(&self.managed, alloc, previous) {
                    conn.drop_oom_bindings();
                }
                if let Some(pool) = self.moderate_pool.as_mut() {
                    pool.remove(previous);
                }
                if let Some(previous_state) = self.managed.get_mut(&previous) {
                    // The forced drop cleared the actual bindings, so the
                    // tracked state must read as backgrounded too or a later
                    // re-foreground of this worker would be a no-op.
                    previous_state.in_foreground = false;
                    previous_state.boost_for_pending_views = false;
                    previous_state.strong_held = false;
                    previous_state.drop_epoch += 1;
                }
            }
        }
        if foreground {
            self.last_foreground = Some(pid);
        }

        if !foreground && was_foreground {
            state.drop_epoch += 1;
        }
        state.in_foreground = foreground;
        state.boost_for_pending_views = boost_for_pending_views;
        self.managed.insert(pid, state);

        if !foreground && was_foreground {
            if self.profile.strong_removal_delay.is_zero() {
                self.complete_foreground_drop(alloc, pid, state.drop_epoch);
            } else {
                self.sender.post_delayed(
                    ManagementRequest::CompleteForegroundDrop {
                        pid,
                        epoch: state.drop_epoch,
                    },
                    self.profile.strong_removal_delay,
                );
            }
        }
        if !boost_for_pending_views && was_boosted {
            let mut park = false;
            if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                conn.remove_initial_binding();
                park = conn.strong_count() == 0;
            }
            if park {
                self.insert_moderate(alloc, pid);
            }
        }
    }

    /// Finishes a delayed foreground-to-background transition: removes the
    /// strong binding added while the worker was visible and parks the
    /// worker in the moderate pool. Skipped when the worker returned to the
    /// foreground in the meantime.
    pub(crate) fn complete_foreground_drop(
        &mut self,
        alloc: &mut ConnectionAllocator,
        pid: Pid,
        epoch: u64,
    ) {
        let Some(state) = self.managed.get(&pid).copied() else {
            return;
        };
        if state.drop_epoch != epoch || state.in_foreground || !state.strong_held {
            return;
        }
        if let Some(state) = self.managed.get_mut(&pid) {
            state.strong_held = false;
        }
        let mut park = false;
        if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
            conn.remove_strong_binding();
            park = conn.strong_count() == 0;
        }
        if park {
            self.insert_moderate(alloc, pid);
        }
    }

    /// Pins the most recently foregrounded worker for the background
    /// period, and schedules the delayed moderate-pool drain. The embedder
    /// must alternate this call strictly with
    /// [`on_brought_to_foreground`](Self::on_brought_to_foreground).
    pub(crate) fn on_sent_to_background(&mut self, alloc: &mut ConnectionAllocator) {
        debug_assert!(self.host_foreground, "host sent to background twice");
        if !self.host_foreground {
            tracing::warn!("ignoring unbalanced background transition");
            return;
        }
        self.host_foreground = false;

        if let Some(pid) = self.last_foreground {
            if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                conn.add_strong_binding();
            }
            if let Some(state) = self.managed.get_mut(&pid) {
                state.bound_for_background_period = true;
            }
            self.bound_for_background = Some(pid);
        }

        if self
            .moderate_pool
            .as_ref()
            .is_some_and(|pool| !pool.is_empty())
        {
            self.drain_epoch += 1;
            self.sender.post_delayed(
                ManagementRequest::DrainModeratePool {
                    epoch: self.drain_epoch,
                },
                MODERATE_DRAIN_DELAY,
            );
        }
    }

    /// Releases the background pin and cancels any pending drain.
    pub(crate) fn on_brought_to_foreground(&mut self, alloc: &mut ConnectionAllocator) {
        debug_assert!(!self.host_foreground, "host brought to foreground twice");
        if self.host_foreground {
            tracing::warn!("ignoring unbalanced foreground transition");
            return;
        }
        self.host_foreground = true;
        self.drain_epoch += 1;

        if let Some(pid) = self.bound_for_background.take() {
            let was_pinned = match self.managed.get_mut(&pid) {
                Some(state) if state.bound_for_background_period => {
                    state.bound_for_background_period = false;
                    true
                }
                _ => false,
            };
            // No moderate-pool insertion here: the pin is an extra refcount
            // on top of whatever the worker already held.
            if was_pinned {
                if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                    conn.remove_strong_binding();
                }
            }
        }
    }

    /// Enables the bounded moderate-binding pool. Until this is called,
    /// workers leaving the foreground are not kept protected.
    pub(crate) fn start_moderate_binding_management(&mut self, max_size: usize) {
        if self.moderate_pool.is_some() {
            tracing::warn!("moderate binding management already started");
            return;
        }
        self.moderate_pool = Some(ModerateBindingPool::new(max_size));
    }

    /// Drains the whole pool, e.g. because the allocator is full and idle
    /// workers should become reclaimable.
    pub(crate) fn release_all_moderate_bindings(&mut self, alloc: &mut ConnectionAllocator) {
        let Some(pool) = self.moderate_pool.as_mut() else {
            return;
        };
        for pid in pool.drain_all() {
            if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                conn.remove_moderate_binding();
            }
        }
    }

    /// Sheds part of the pool proportionally to the pressure level.
    pub(crate) fn on_trim_memory(
        &mut self,
        alloc: &mut ConnectionAllocator,
        level: MemoryPressureLevel,
    ) {
        let Some(pool) = self.moderate_pool.as_mut() else {
            return;
        };
        for pid in pool.drop_fraction(level.drop_numerator()) {
            if let Some(conn) = Self::conn_of(&self.managed, alloc, pid) {
                conn.remove_moderate_binding();
            }
        }
    }

    pub(crate) fn on_low_memory(&mut self, alloc: &mut ConnectionAllocator) {
        self.release_all_moderate_bindings(alloc);
    }

    /// The delayed background drain firing. Stale epochs mean the host came
    /// back to the foreground first.
    pub(crate) fn drain_moderate_pool(&mut self, alloc: &mut ConnectionAllocator, epoch: u64) {
        if epoch != self.drain_epoch || self.host_foreground {
            return;
        }
        self.release_all_moderate_bindings(alloc);
    }

    fn insert_moderate(&mut self, alloc: &mut ConnectionAllocator, pid: Pid) {
        let Some(pool) = self.moderate_pool.as_mut() else {
            return;
        };
        let Some(conn) = Self::conn_of(&self.managed, alloc, pid) else {
            return;
        };
        if !conn.is_connected() {
            return;
        }
        conn.add_moderate_binding();
        if let Some(victim) = pool.note_recent(pid) {
            if let Some(conn) = Self::conn_of(&self.managed, alloc, victim) {
                conn.remove_moderate_binding();
            }
        }
    }

    fn conn_of<'a>(
        managed: &HashMap<Pid, ManagedState>,
        alloc: &'a mut ConnectionAllocator,
        pid: Pid,
    ) -> Option<&'a mut ChildConnection> {
        alloc.get_mut(managed.get(&pid)?.slot)
    }

    #[cfg(test)]
    pub(crate) fn moderate_pool_entries(&self) -> Vec<Pid> {
        self.moderate_pool
            .as_ref()
            .map(|pool| pool.entries())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn last_foreground(&self) -> Option<Pid> {
        self.last_foreground
    }

    #[cfg(test)]
    pub(crate) fn bound_for_background(&self) -> Option<Pid> {
        self.bound_for_background
    }
}
