//! Scripted in-memory transport fakes shared by the unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use crate::{
    binder::{BindingLevel, ChildChannel, ServiceBinder, ServiceDescriptor, ServiceName},
    error::{Error, Result},
    options::ConnectionBundles,
};

pub(crate) fn sandboxed_descriptor(count: usize) -> ServiceDescriptor {
    ServiceDescriptor {
        package_name: "com.example.host".into(),
        class_name_prefix: "SandboxedWorker".into(),
        count,
    }
}

pub(crate) fn privileged_descriptor(count: usize) -> ServiceDescriptor {
    ServiceDescriptor {
        package_name: "com.example.host".into(),
        class_name_prefix: "PrivilegedWorker".into(),
        count,
    }
}

/// One call observed by the [`FakeBinder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BindCall {
    Bind(ServiceName, BindingLevel),
    Unbind(ServiceName, BindingLevel),
}

/// A `ServiceBinder` that records every call and tracks which levels are
/// bound, asserting the at-most-once bind/unbind discipline.
#[derive(Debug, Default)]
pub(crate) struct FakeBinder {
    state: Mutex<FakeBinderState>,
}

#[derive(Debug, Default)]
struct FakeBinderState {
    calls: Vec<BindCall>,
    bound: HashSet<(ServiceName, BindingLevel)>,
    fail_binds: bool,
}

impl FakeBinder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `bind` fail, as a transport rejection would.
    pub(crate) fn fail_binds(&self, fail: bool) {
        self.state.lock().unwrap().fail_binds = fail;
    }

    pub(crate) fn calls(&self) -> Vec<BindCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn take_calls(&self) -> Vec<BindCall> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }

    pub(crate) fn is_bound(&self, service: &ServiceName, level: BindingLevel) -> bool {
        self.state
            .lock()
            .unwrap()
            .bound
            .contains(&(service.clone(), level))
    }

    pub(crate) fn bound_levels(&self, service: &ServiceName) -> Vec<BindingLevel> {
        let state = self.state.lock().unwrap();
        [
            BindingLevel::Initial,
            BindingLevel::Strong,
            BindingLevel::Moderate,
            BindingLevel::Waived,
        ]
        .into_iter()
        .filter(|level| state.bound.contains(&(service.clone(), *level)))
        .collect()
    }
}

impl ServiceBinder for FakeBinder {
    fn bind(&self, service: &ServiceName, level: BindingLevel) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_binds {
            return Err(Error::bind_failure(service, "rejected by test binder"));
        }
        let newly = state.bound.insert((service.clone(), level));
        assert!(newly, "double bind of {:?} for {}", level, service);
        state.calls.push(BindCall::Bind(service.clone(), level));
        Ok(())
    }

    fn unbind(&self, service: &ServiceName, level: BindingLevel) {
        let mut state = self.state.lock().unwrap();
        let was_bound = state.bound.remove(&(service.clone(), level));
        assert!(was_bound, "unbind of unbound {:?} for {}", level, service);
        state.calls.push(BindCall::Unbind(service.clone(), level));
    }
}

/// Everything a [`FakeChannel`] has been asked to do.
#[derive(Debug, Default)]
pub(crate) struct FakeChannelState {
    pub(crate) peer_identity_requests: usize,
    pub(crate) setups: Vec<ConnectionBundles>,
}

/// A `ChildChannel` whose outbound calls the test can observe.
#[derive(Debug)]
pub(crate) struct FakeChannel {
    state: Arc<Mutex<FakeChannelState>>,
}

impl FakeChannel {
    pub(crate) fn new() -> (Box<dyn ChildChannel>, Arc<Mutex<FakeChannelState>>) {
        let state = Arc::new(Mutex::new(FakeChannelState::default()));
        (
            Box::new(Self {
                state: Arc::clone(&state),
            }),
            state,
        )
    }
}

impl ChildChannel for FakeChannel {
    fn request_peer_identity(&self) {
        self.state.lock().unwrap().peer_identity_requests += 1;
    }

    fn send_setup(&self, payload: ConnectionBundles) {
        self.state.lock().unwrap().setups.push(payload);
    }
}
