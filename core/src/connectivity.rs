//! Two-state reachability tracking that reports edges only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Default cadence for platforms without push notifications.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    #[must_use]
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable { Self::Online } else { Self::Offline }
    }

    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

/// Platform reachability signal.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Start from the probe's current answer.
    pub async fn sample(probe: &dyn ReachabilityProbe) -> Self {
        Self::new(Connectivity::from_reachable(probe.is_reachable().await))
    }

    #[must_use]
    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Record a reachability sample. Returns the transition when the state
    /// changed, `None` when it stayed the same.
    pub fn observe(&self, reachable: bool) -> Option<Transition> {
        let next = Connectivity::from_reachable(reachable);
        let mut edge = None;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            edge = Some(match next {
                Connectivity::Online => Transition::CameOnline,
                Connectivity::Offline => Transition::WentOffline,
            });
            true
        });
        edge
    }

    /// Poll `probe` every `interval` and hand each edge to `on_edge`.
    /// Runs until the surrounding task is dropped.
    pub async fn poll<F>(&self, probe: &dyn ReachabilityProbe, interval: Duration, mut on_edge: F)
    where
        F: FnMut(Transition) + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = probe.is_reachable().await;
            if let Some(edge) = self.observe(reachable) {
                info!(?edge, "connectivity changed");
                on_edge(edge);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_observe_reports_edges_only() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        assert_eq!(monitor.observe(false), None);
        assert_eq!(monitor.observe(true), Some(Transition::CameOnline));
        assert!(monitor.is_online());
        assert_eq!(monitor.observe(true), None);
        assert_eq!(monitor.observe(false), Some(Transition::WentOffline));
        assert_eq!(monitor.current(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_sample_uses_probe() {
        let probe = FlagProbe(AtomicBool::new(true));
        let monitor = ConnectivityMonitor::sample(&probe).await;
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let mut rx = monitor.subscribe();
        monitor.observe(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_emits_each_transition_once() {
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let edges = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let probe = Arc::clone(&probe);
            let monitor = monitor.clone();
            let edges = Arc::clone(&edges);
            tokio::spawn(async move {
                monitor
                    .poll(probe.as_ref(), Duration::from_secs(1), |edge| {
                        edges.lock().unwrap().push(edge);
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        probe.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        probe.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        task.abort();

        assert_eq!(
            *edges.lock().unwrap(),
            vec![Transition::CameOnline, Transition::WentOffline]
        );
    }
}
