//! Reachability of the remote store

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;

use crate::state::ConnState;

/// Source of reachable/unreachable transitions
pub trait ConnectivityMonitor: Send + Sync {
    /// Reachability right now
    fn current(&self) -> ConnState;

    /// Every later change of reachability. Repeated states are not reported.
    fn transitions(&self) -> BoxStream<'static, ConnState>;
}

/// Connectivity driven by hand, for tests and the CLI
#[derive(Debug)]
pub struct ManualConnectivity {
    state: watch::Sender<ConnState>,
}

impl ManualConnectivity {
    pub fn new(initial: ConnState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn set(&self, state: ConnState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn go_online(&self) {
        self.set(ConnState::Reachable);
    }

    pub fn go_offline(&self) {
        self.set(ConnState::Unreachable);
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> ConnState {
        *self.state.borrow()
    }

    fn transitions(&self) -> BoxStream<'static, ConnState> {
        let receiver = self.state.subscribe();
        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let state = *receiver.borrow_and_update();
            Some((state, receiver))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_skip_repeated_states() {
        let monitor = ManualConnectivity::new(ConnState::Unreachable);
        let mut transitions = monitor.transitions();

        monitor.go_offline();
        monitor.go_online();
        assert_eq!(transitions.next().await, Some(ConnState::Reachable));
        assert_eq!(monitor.current(), ConnState::Reachable);

        monitor.go_offline();
        assert_eq!(transitions.next().await, Some(ConnState::Unreachable));
    }

    #[tokio::test]
    async fn stream_ends_when_monitor_is_dropped() {
        let monitor = ManualConnectivity::new(ConnState::Reachable);
        let mut transitions = monitor.transitions();
        drop(monitor);
        assert_eq!(transitions.next().await, None);
    }
}
