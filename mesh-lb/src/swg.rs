use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::warn;

/// Reference-counted completion token carried by every service event.
///
/// Producers call [`add`](Self::add) before handing the token out, consumers
/// call [`done`](Self::done) once the event has been applied downstream.
/// After [`stop`](Self::stop) the producer side is sealed: further `add`
/// calls are ignored and [`wait`](Self::wait) resolves once the outstanding
/// count drains to zero.
///
/// Clones share the same counter.
#[derive(Clone, Debug)]
pub struct StoppableWaitGroup {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    drained_tx: watch::Sender<bool>,
}

#[derive(Debug)]
struct State {
    count: u64,
    stopped: bool,
}

impl Default for StoppableWaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl StoppableWaitGroup {
    pub fn new() -> Self {
        let (drained_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    count: 0,
                    stopped: false,
                }),
                drained_tx,
            }),
        }
    }

    /// Increments the outstanding count. Ignored once the group is stopped.
    pub fn add(&self) {
        let mut state = self.inner.state.lock().expect("wait group lock poisoned");
        if state.stopped {
            return;
        }
        state.count += 1;
        self.publish(&state);
    }

    /// Balances one previous [`add`](Self::add).
    pub fn done(&self) {
        let mut state = self.inner.state.lock().expect("wait group lock poisoned");
        if state.count == 0 {
            warn!("wait group done called more times than add");
            return;
        }
        state.count -= 1;
        self.publish(&state);
    }

    /// Seals the producer side. Outstanding consumers still drain.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().expect("wait group lock poisoned");
        state.stopped = true;
        self.publish(&state);
    }

    /// Resolves once the group is stopped and the outstanding count is zero.
    pub async fn wait(&self) {
        let mut rx = self.inner.drained_tx.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|drained| *drained).await;
    }

    fn publish(&self, state: &State) {
        self.inner
            .drained_tx
            .send_replace(state.stopped && state.count == 0);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_after_drain() {
        let swg = StoppableWaitGroup::new();
        swg.add();
        swg.add();
        swg.stop();

        let waiter = swg.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        swg.done();
        swg.done();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_after_stop_is_ignored() {
        let swg = StoppableWaitGroup::new();
        swg.stop();
        swg.add();

        timeout(Duration::from_secs(1), swg.wait())
            .await
            .expect("wait did not resolve");
    }

    #[tokio::test]
    async fn test_wait_blocks_while_outstanding() {
        let swg = StoppableWaitGroup::new();
        swg.add();
        swg.stop();

        assert!(
            timeout(Duration::from_millis(50), swg.wait())
                .await
                .is_err()
        );

        swg.done();
        timeout(Duration::from_secs(1), swg.wait())
            .await
            .expect("wait did not resolve");
    }
}
