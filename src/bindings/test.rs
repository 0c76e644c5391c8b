use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::{moderate_pool::ModerateBindingPool, BindingManager};
use crate::{
    allocator::ConnectionAllocator,
    binder::{BindingLevel, Pid, ServiceName},
    launcher::manager::{self, ManagementReceiver, ManagementRequest},
    memory::MemoryPressureLevel,
    options::HostProfile,
    test_util::{sandboxed_descriptor, BindCall, FakeBinder, FakeChannel},
};

struct Harness {
    binder: Arc<FakeBinder>,
    alloc: ConnectionAllocator,
    manager: BindingManager,
    receiver: ManagementReceiver,
    next_pid: u32,
}

fn harness(profile: HostProfile) -> Harness {
    let binder = FakeBinder::new();
    let alloc =
        ConnectionAllocator::new(sandboxed_descriptor(8), Arc::clone(&binder) as _).unwrap();
    let (sender, receiver) = manager::channel();
    Harness {
        binder,
        alloc,
        manager: BindingManager::new(profile, sender),
        receiver,
        next_pid: 100,
    }
}

impl Harness {
    /// Allocates, starts, and registers a worker whose channel is up.
    fn spawn_worker(&mut self) -> (Pid, ServiceName) {
        let conn = self.alloc.allocate().unwrap();
        let service = conn.service().clone();
        conn.start(false, false).unwrap();
        let (channel, _) = FakeChannel::new();
        conn.on_channel_established(channel);
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        conn.complete_setup(pid);
        self.manager.add_connection(pid, service.index());
        (pid, service)
    }

    /// Parks a worker in the moderate pool through the pending-views path,
    /// which needs no timers.
    fn park_in_pool(&mut self, pid: Pid) {
        self.manager.set_priority(&mut self.alloc, pid, false, true);
        self.manager.set_priority(&mut self.alloc, pid, false, false);
    }

    fn levels(&self, service: &ServiceName) -> Vec<BindingLevel> {
        self.binder.bound_levels(service)
    }

    fn strong_count(&self, service: &ServiceName) -> u32 {
        self.alloc.get(service.index()).unwrap().strong_count()
    }

    /// Receives the next delayed posting and applies it. Virtual time
    /// auto-advances to whenever the task's sleep elapses.
    async fn fire_next_delayed(&mut self) {
        match self.receiver.recv().await.expect("no delayed task pending") {
            ManagementRequest::CompleteForegroundDrop { pid, epoch } => {
                self.manager
                    .complete_foreground_drop(&mut self.alloc, pid, epoch);
            }
            ManagementRequest::DrainModeratePool { epoch } => {
                self.manager.drain_moderate_pool(&mut self.alloc, epoch);
            }
            other => panic!("unexpected management request {:?}", other),
        }
    }
}

#[test]
fn moderate_pool_keeps_mru_order_and_evicts_tail() {
    let a = Pid::new(1);
    let b = Pid::new(2);
    let c = Pid::new(3);

    let mut pool = ModerateBindingPool::new(2);
    assert_eq!(pool.note_recent(a), None);
    assert_eq!(pool.note_recent(b), None);
    assert_eq!(pool.entries(), vec![b, a]);

    // touching an existing entry moves it to the front without eviction
    assert_eq!(pool.note_recent(a), None);
    assert_eq!(pool.entries(), vec![a, b]);
    assert!(pool.contains(b));

    assert_eq!(pool.note_recent(c), Some(b));
    assert_eq!(pool.entries(), vec![c, a]);
}

#[test]
fn moderate_pool_drop_fraction_rounds_down() {
    let mut pool = ModerateBindingPool::new(8);
    for raw in 1..=5 {
        pool.note_recent(Pid::new(raw));
    }
    // 25% of 5 rounds down to 1, dropped from the LRU end
    assert_eq!(pool.drop_fraction(1), vec![Pid::new(1)]);
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.drop_fraction(2), vec![Pid::new(2), Pid::new(3)]);
    assert_eq!(pool.drain_all(), vec![Pid::new(4), Pid::new(5)]);
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn foreground_worker_gets_strong_binding_with_delayed_removal() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(4);
    let (pid, service) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid, true, false);
    assert_eq!(h.strong_count(&service), 1);

    h.manager.set_priority(&mut h.alloc, pid, false, false);
    // hysteresis: still bound until the delayed removal fires
    assert_eq!(h.strong_count(&service), 1);

    h.fire_next_delayed().await;
    assert_eq!(h.strong_count(&service), 0);
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid]);
    assert!(h.binder.is_bound(&service, BindingLevel::Moderate));
}

#[tokio::test(start_paused = true)]
async fn returning_to_foreground_cancels_pending_removal() {
    let mut h = harness(HostProfile::regular());
    let (pid, service) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid, true, false);
    h.manager.set_priority(&mut h.alloc, pid, false, false);
    h.manager.set_priority(&mut h.alloc, pid, true, false);

    h.fire_next_delayed().await;
    // the stale removal must not fire, and no second binding piled up
    assert_eq!(h.strong_count(&service), 1);
    let strong_binds = h
        .binder
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BindCall::Bind(_, BindingLevel::Strong)))
        .count();
    assert_eq!(strong_binds, 1);
}

#[tokio::test(start_paused = true)]
async fn low_memory_host_removes_strong_binding_immediately() {
    let mut h = harness(HostProfile::low_memory());
    let (pid, service) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid, true, false);
    h.manager.set_priority(&mut h.alloc, pid, false, false);
    assert_eq!(h.strong_count(&service), 0);
}

#[tokio::test(start_paused = true)]
async fn low_memory_foreground_displaces_previous_worker() {
    let mut h = harness(HostProfile::low_memory());
    h.manager.start_moderate_binding_management(4);
    let (pid_a, service_a) = h.spawn_worker();
    let (pid_b, service_b) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid_a, true, false);
    assert!(h.binder.is_bound(&service_a, BindingLevel::Strong));

    h.manager.set_priority(&mut h.alloc, pid_b, true, false);
    // exactly one worker keeps OOM protection: A is down to waived only
    assert_eq!(h.levels(&service_a), vec![BindingLevel::Waived]);
    assert!(h.binder.is_bound(&service_b, BindingLevel::Strong));
    assert_eq!(h.manager.last_foreground(), Some(pid_b));
}

#[tokio::test(start_paused = true)]
async fn low_memory_displaced_worker_can_return_to_foreground() {
    let mut h = harness(HostProfile::low_memory());
    let (pid_a, service_a) = h.spawn_worker();
    let (pid_b, service_b) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid_a, true, false);
    h.manager.set_priority(&mut h.alloc, pid_b, true, false);
    assert_eq!(h.levels(&service_a), vec![BindingLevel::Waived]);

    // the user switches back: A regains its protection and B is displaced
    h.manager.set_priority(&mut h.alloc, pid_a, true, false);
    assert!(h.binder.is_bound(&service_a, BindingLevel::Strong));
    assert_eq!(h.levels(&service_b), vec![BindingLevel::Waived]);
    assert_eq!(h.manager.last_foreground(), Some(pid_a));
}

#[tokio::test(start_paused = true)]
async fn foreground_transition_adds_before_removing() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(4);
    let (pid, service) = h.spawn_worker();
    h.park_in_pool(pid);
    assert!(h.binder.is_bound(&service, BindingLevel::Moderate));
    h.binder.take_calls();

    h.manager.set_priority(&mut h.alloc, pid, true, false);
    let calls = h.binder.calls();
    assert_eq!(
        calls,
        vec![
            BindCall::Bind(service.clone(), BindingLevel::Strong),
            BindCall::Unbind(service.clone(), BindingLevel::Moderate),
        ]
    );
    assert!(h.manager.moderate_pool_entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn background_pin_adds_one_strong_binding_and_restores() {
    let mut h = harness(HostProfile::regular());
    let (pid_a, service_a) = h.spawn_worker();
    let (_pid_b, service_b) = h.spawn_worker();

    h.manager.set_priority(&mut h.alloc, pid_a, true, false);
    let a_before = h.levels(&service_a);
    let b_before = h.levels(&service_b);
    assert_eq!(h.strong_count(&service_a), 1);

    h.manager.on_sent_to_background(&mut h.alloc);
    assert_eq!(h.strong_count(&service_a), 2);
    assert_eq!(h.strong_count(&service_b), 0);
    assert_eq!(h.manager.bound_for_background(), Some(pid_a));

    h.manager.on_brought_to_foreground(&mut h.alloc);
    assert_eq!(h.strong_count(&service_a), 1);
    assert_eq!(h.levels(&service_a), a_before);
    assert_eq!(h.levels(&service_b), b_before);
    assert_eq!(h.manager.bound_for_background(), None);
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "host brought to foreground twice")]
async fn unbalanced_host_transitions_are_a_programming_error() {
    let mut h = harness(HostProfile::regular());
    let (pid, _service) = h.spawn_worker();
    h.manager.set_priority(&mut h.alloc, pid, true, false);

    h.manager.on_brought_to_foreground(&mut h.alloc);
}

#[tokio::test(start_paused = true)]
async fn moderate_pool_eviction_unbinds_the_victim() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(2);
    let (pid_a, service_a) = h.spawn_worker();
    let (pid_b, _service_b) = h.spawn_worker();
    let (pid_c, service_c) = h.spawn_worker();

    h.park_in_pool(pid_a);
    h.park_in_pool(pid_b);
    h.park_in_pool(pid_c);

    // the LRU tail is evicted and loses its moderate binding
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid_c, pid_b]);
    assert!(!h.binder.is_bound(&service_a, BindingLevel::Moderate));
    assert!(h.binder.is_bound(&service_c, BindingLevel::Moderate));
}

#[tokio::test(start_paused = true)]
async fn trim_memory_drops_pool_entries_by_level() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(8);
    let mut workers = Vec::new();
    // park D first so the MRU order ends up [A, B, C, D]
    for _ in 0..4 {
        workers.push(h.spawn_worker());
    }
    for (pid, _) in workers.iter().rev() {
        h.park_in_pool(*pid);
    }
    let [(pid_a, _), (pid_b, _), (pid_c, service_c), (pid_d, service_d)] =
        <[_; 4]>::try_from(workers).unwrap();
    assert_eq!(
        h.manager.moderate_pool_entries(),
        vec![pid_a, pid_b, pid_c, pid_d]
    );

    h.manager
        .on_trim_memory(&mut h.alloc, MemoryPressureLevel::RunningLow);
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid_a, pid_b]);
    assert!(!h.binder.is_bound(&service_c, BindingLevel::Moderate));
    assert!(!h.binder.is_bound(&service_d, BindingLevel::Moderate));

    h.manager
        .on_trim_memory(&mut h.alloc, MemoryPressureLevel::Complete);
    assert!(h.manager.moderate_pool_entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn trim_memory_at_moderate_drops_a_quarter() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(8);
    let mut pids = Vec::new();
    for _ in 0..4 {
        let (pid, _) = h.spawn_worker();
        pids.push(pid);
    }
    for pid in pids.iter().rev() {
        h.park_in_pool(*pid);
    }

    h.manager
        .on_trim_memory(&mut h.alloc, MemoryPressureLevel::RunningModerate);
    assert_eq!(h.manager.moderate_pool_entries().len(), 3);

    h.manager
        .on_trim_memory(&mut h.alloc, MemoryPressureLevel::UiHidden);
    assert_eq!(h.manager.moderate_pool_entries().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn background_drain_empties_pool_after_delay() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(4);
    let (pid, service) = h.spawn_worker();
    h.park_in_pool(pid);

    h.manager.on_sent_to_background(&mut h.alloc);
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid]);

    h.fire_next_delayed().await;
    assert!(h.manager.moderate_pool_entries().is_empty());
    assert!(!h.binder.is_bound(&service, BindingLevel::Moderate));
}

#[tokio::test(start_paused = true)]
async fn returning_to_foreground_cancels_background_drain() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(4);
    let (pid, service) = h.spawn_worker();
    h.park_in_pool(pid);

    h.manager.on_sent_to_background(&mut h.alloc);
    h.manager.on_brought_to_foreground(&mut h.alloc);

    h.fire_next_delayed().await;
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid]);
    assert!(h.binder.is_bound(&service, BindingLevel::Moderate));
}

#[tokio::test(start_paused = true)]
async fn priority_change_for_unknown_worker_is_ignored() {
    let mut h = harness(HostProfile::regular());
    h.manager
        .set_priority(&mut h.alloc, Pid::new(4242), true, true);
    assert!(h.binder.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn removed_worker_leaves_manager_state() {
    let mut h = harness(HostProfile::regular());
    h.manager.start_moderate_binding_management(4);
    let (pid, _service) = h.spawn_worker();
    h.manager.set_priority(&mut h.alloc, pid, true, false);
    h.manager.set_priority(&mut h.alloc, pid, false, false);
    h.fire_next_delayed().await;
    assert_eq!(h.manager.moderate_pool_entries(), vec![pid]);
    assert_eq!(h.manager.last_foreground(), Some(pid));

    h.manager.remove_connection(pid);
    assert!(!h.manager.has_connection(pid));
    assert_eq!(h.manager.last_foreground(), None);
    assert!(h.manager.moderate_pool_entries().is_empty());
}
