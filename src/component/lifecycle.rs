use displaydoc::Display as DisplayDoc;
use tokio::sync::watch;

/// Observable component states, strictly ordered
#[derive(DisplayDoc, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// initializing
    Init,
    /// running
    Running,
    /// stopped
    Stopped,
}

/// Shared lifecycle cell. Owned by value inside each component;
/// observers subscribe through the component's `wait_for_ready`.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(LifecycleState::Init),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Raises the ready signal. Idempotent by construction: the watch
    /// channel only notifies on an actual transition.
    pub fn set_running(&self) {
        self.tx.send_if_modified(|state| {
            if *state == LifecycleState::Init {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
    }

    pub fn set_stopped(&self) {
        self.tx.send_if_modified(|state| {
            if *state != LifecycleState::Stopped {
                *state = LifecycleState::Stopped;
                true
            } else {
                false
            }
        });
    }

    pub async fn wait_for(&self, target: LifecycleState) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, wait_for cannot fail
        let _ = rx.wait_for(|state| *state >= target).await;
    }
}

/// The uniform start/ready/stop protocol every fabric component obeys
pub trait Runnable {
    fn lifecycle(&self) -> &Lifecycle;

    /// Runs the component until it has fully stopped
    fn run(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Initiates shutdown; `run` resolves once teardown completes
    fn stop(&self) -> impl std::future::Future<Output = ()> + Send;

    fn wait_for_ready(&self) -> impl std::future::Future<Output = ()> + Send {
        self.lifecycle().wait_for(LifecycleState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_fires_between_init_and_stop() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Init);
        let waiter = lifecycle.wait_for(LifecycleState::Running);
        lifecycle.set_running();
        waiter.await;
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        lifecycle.set_stopped();
        // A second set_running after stop must not regress the state
        lifecycle.set_running();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}
