//! Share one in-progress async operation between every caller that asks for
//! it while it is running.

use std::future::Future;
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};

pub struct SingleFlight<T: Clone> {
    inflight: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }

    /// Join the running operation, or start `start()` if none is running.
    ///
    /// The operation lives in the slot, not in any one caller, so a caller
    /// that is dropped mid-way does not cancel it for the others. The slot is
    /// emptied by whichever caller observes completion first.
    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let started = start().boxed().shared();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        let result = shared.clone().await;

        let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|running| running.ptr_eq(&shared)) {
            *slot = None;
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
