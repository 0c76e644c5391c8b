//! Holder for a single pre-warmed spare connection.

use crate::{binder::ServiceName, options::CreationParams};

/// Tracks the one spare connection the launcher may keep warmed: an
/// already-allocated, already-started sandboxed connection waiting for a
/// spawn whose parameters match.
///
/// The holder only records identity and progress; the connection itself
/// lives in its allocator slot like any other. Handoff is single-shot, and
/// a parameter mismatch is not an error; the holder simply declines and
/// the spawn falls through to normal allocation.
#[derive(Debug, Default)]
pub(crate) struct SpareConnectionHolder {
    state: Option<Spare>,
}

#[derive(Debug)]
struct Spare {
    service: ServiceName,
    sandboxed: bool,
    foreground: bool,
    params: CreationParams,
}

impl SpareConnectionHolder {
    pub(crate) fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// Records a freshly warmed connection. Replaces nothing: callers check
    /// [`is_empty`](Self::is_empty) before warming.
    pub(crate) fn record(&mut self, service: ServiceName, params: CreationParams) {
        debug_assert!(self.state.is_none(), "spare warmed while one was held");
        self.state = Some(Spare {
            service,
            sandboxed: true,
            foreground: false,
            params,
        });
    }

    /// Hands the spare over iff the spawn's class, foreground flag, and
    /// creation parameters all match.
    pub(crate) fn take_if_matching(
        &mut self,
        sandboxed: bool,
        foreground: bool,
        params: &CreationParams,
    ) -> Option<ServiceName> {
        let spare = self.state.as_ref()?;
        if spare.sandboxed != sandboxed || spare.foreground != foreground || spare.params != *params
        {
            return None;
        }
        self.state.take().map(|spare| spare.service)
    }

    /// Drops the spare if `service` is it; a spare that dies before any
    /// caller claims it simply stops being offered.
    pub(crate) fn on_connection_died(&mut self, service: &ServiceName) {
        if self
            .state
            .as_ref()
            .is_some_and(|spare| spare.service == *service)
        {
            self.state = None;
        }
    }
}
