//! Application-scope state shared by every service instance.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Identity of the running process and the number of active services.
#[derive(Debug)]
pub struct AppContext {
    own_uid: i32,
    own_package: String,
    active_services: AtomicUsize,
}

impl AppContext {
    pub fn new(own_uid: i32, own_package: impl Into<String>) -> Self {
        Self {
            own_uid,
            own_package: own_package.into(),
            active_services: AtomicUsize::new(0),
        }
    }

    pub fn own_uid(&self) -> i32 {
        self.own_uid
    }

    pub fn own_package(&self) -> &str {
        &self.own_package
    }

    /// Returns the new count.
    pub fn service_started(&self) -> usize {
        self.active_services.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new count. Never goes below zero.
    pub fn service_stopped(&self) -> usize {
        let previous = self
            .active_services
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn active_services(&self) -> usize {
        self.active_services.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_service_count() {
        let context = AppContext::new(10_001, "me.loopfx");

        assert_eq!(context.service_started(), 1);
        assert_eq!(context.service_started(), 2);
        assert_eq!(context.service_stopped(), 1);
        assert_eq!(context.service_stopped(), 0);
        assert_eq!(context.service_stopped(), 0);
        assert_eq!(context.active_services(), 0);
    }
}
