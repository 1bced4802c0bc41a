//! Backend locator: finds, remembers and keeps watching the backend this client talks to.
//!
//! Every consumer asks the locator for a base URL instead of hard-coding one. The
//! first caller triggers a discovery run (same-origin shortcut, cached endpoint,
//! then a two-phase probe sweep); concurrent callers share that run. Once resolved,
//! a background task re-probes the endpoint and, when it stops answering, drops it
//! and tells subscribers so they can re-resolve.

mod discovery;
mod listeners;
mod monitor;

pub use listeners::{ConnectionLostFn, Subscription};
pub use probe::HealthProbe;

use crate::discovery::DiscoveryRun;
use crate::listeners::Listeners;
use discovery_cache::DiscoveryCache;
use futures::future::{BoxFuture, FutureExt, Shared};
use signance_core::{EndpointSource, LocatorConfig, LocatorError, PageContext, ResolvedEndpoint};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedRun = Shared<BoxFuture<'static, Result<ResolvedEndpoint, LocatorError>>>;

/// Observable lifecycle of the locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorState {
    Unresolved,
    Resolving,
    Resolved,
    /// The active endpoint failed a check and is being dropped.
    Stale,
}

impl fmt::Display for LocatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocatorState::Unresolved => "unresolved",
            LocatorState::Resolving => "resolving",
            LocatorState::Resolved => "resolved",
            LocatorState::Stale => "stale",
        };
        f.write_str(s)
    }
}

enum State {
    Unresolved,
    Resolving { run: u64, pending: SharedRun },
    /// `run` is the discovery run that produced `ep`.
    Resolved { run: u64, ep: ResolvedEndpoint },
    Stale(ResolvedEndpoint),
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Inner {
    context: PageContext,
    config: LocatorConfig,
    probe: Arc<dyn HealthProbe>,
    cache: DiscoveryCache,
    state: Mutex<State>,
    listeners: Arc<Listeners>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    runs: AtomicU64,
}

/// Cheap to clone; clones share state, cache and subscribers.
#[derive(Clone)]
pub struct Locator {
    inner: Arc<Inner>,
}

impl Locator {
    /// Fails with [`LocatorError::Config`] when `config` does not validate.
    pub fn new(
        context: PageContext,
        config: LocatorConfig,
        probe: Arc<dyn HealthProbe>,
        cache: DiscoveryCache,
    ) -> Result<Self, LocatorError> {
        config.validate()?;
        Ok(Locator {
            inner: Arc::new(Inner {
                context,
                config,
                probe,
                cache,
                state: Mutex::new(State::Unresolved),
                listeners: Arc::new(Listeners::default()),
                monitor: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        })
    }

    pub fn context(&self) -> &PageContext {
        &self.inner.context
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.inner.cache
    }

    /// Start background health checks. Must be called from within a tokio runtime.
    /// Calling it again while the monitor is running does nothing.
    pub fn init(&self) {
        let mut slot = lock(&self.inner.monitor);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let period = self.inner.config.network.health_interval();
        *slot = Some(monitor::spawn(Arc::downgrade(&self.inner), period));
        debug!(interval_secs = period.as_secs(), "health monitor started");
    }

    /// Stop background health checks. The resolved endpoint is kept.
    pub fn teardown(&self) {
        if let Some(h) = lock(&self.inner.monitor).take() {
            h.abort();
            debug!("health monitor stopped");
        }
    }

    /// The backend base URL, discovering it first if necessary.
    pub async fn base_url(&self) -> Result<String, LocatorError> {
        Ok(self.resolve().await?.base_url)
    }

    /// Realtime URL for `path` on the resolved backend (`ws://` or `wss://`).
    pub async fn realtime_url(&self, path: &str) -> Result<String, LocatorError> {
        Ok(self.resolve().await?.ws_url(path))
    }

    /// Resolve the backend. At most one discovery run is in flight; every caller
    /// arriving while it runs receives the same outcome.
    pub async fn resolve(&self) -> Result<ResolvedEndpoint, LocatorError> {
        let pending = {
            let mut state = lock(&self.inner.state);
            match &*state {
                State::Resolved { ep, .. } => return Ok(ep.clone()),
                State::Resolving { pending, .. } => pending.clone(),
                State::Unresolved | State::Stale(_) => {
                    let (run, pending) = self.inner.start_run();
                    *state = State::Resolving { run, pending: pending.clone() };
                    pending
                }
            }
        };
        pending.await
    }

    pub fn state(&self) -> LocatorState {
        match &*lock(&self.inner.state) {
            State::Unresolved => LocatorState::Unresolved,
            State::Resolving { .. } => LocatorState::Resolving,
            State::Resolved { .. } => LocatorState::Resolved,
            State::Stale(_) => LocatorState::Stale,
        }
    }

    /// The endpoint currently in use, without triggering discovery.
    pub fn active(&self) -> Option<ResolvedEndpoint> {
        self.inner.active().map(|(_, ep)| ep)
    }

    /// Drop the active endpoint as if a health check had failed. Returns whether
    /// there was one to drop.
    pub fn invalidate(&self) -> bool {
        let Some((run, ep)) = self.inner.active() else { return false };
        info!(base_url = %ep.base_url, "backend invalidated");
        self.inner.drop_endpoint(run, &ep)
    }

    /// Run one health check now. `true` when the active endpoint answered or there is
    /// nothing to check.
    pub async fn check_now(&self) -> bool {
        self.inner.check_active().await
    }

    /// Register `f` to be told about every lost endpoint until the returned
    /// handle is dropped or unsubscribed.
    pub fn on_connection_lost<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ResolvedEndpoint) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(f))
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Number of discovery runs started so far.
    pub fn discovery_runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn start_run(self: &Arc<Self>) -> (u64, SharedRun) {
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let job = DiscoveryRun {
            context: self.context.clone(),
            network: self.config.network.clone(),
            candidates: self.config.candidates.clone(),
            probe: self.probe.clone(),
            cache: self.cache.clone(),
        };
        let weak = Arc::downgrade(self);
        debug!(run, "discovery started");
        let pending = async move {
            let result = job.execute().await;
            if let Some(inner) = weak.upgrade() {
                inner.settle(run, &result);
            }
            result
        }
        .boxed()
        .shared();
        (run, pending)
    }

    fn settle(&self, run: u64, result: &Result<ResolvedEndpoint, LocatorError>) {
        let mut state = lock(&self.state);
        if !matches!(&*state, State::Resolving { run: current, .. } if *current == run) {
            return;
        }
        *state = match result {
            Ok(ep) => State::Resolved { run, ep: ep.clone() },
            Err(_) => State::Unresolved,
        };
    }

    fn active(&self) -> Option<(u64, ResolvedEndpoint)> {
        match &*lock(&self.state) {
            State::Resolved { run, ep } => Some((*run, ep.clone())),
            _ => None,
        }
    }

    pub(crate) async fn check_active(&self) -> bool {
        let (run, ep) = match self.active() {
            Some((run, ep)) if ep.source != EndpointSource::SameOrigin => (run, ep),
            _ => return true,
        };
        if self.probe.probe(&ep.host, ep.port).await {
            debug!(base_url = %ep.base_url, "health check passed");
            return true;
        }
        warn!(base_url = %ep.base_url, "backend stopped answering");
        self.drop_endpoint(run, &ep);
        false
    }

    /// RESOLVED -> STALE -> UNRESOLVED, clearing the cache and notifying subscribers.
    /// No-op unless run `run` still owns the active endpoint; a later run may have
    /// resolved to the same URL in the meantime.
    fn drop_endpoint(&self, run: u64, ep: &ResolvedEndpoint) -> bool {
        {
            let mut state = lock(&self.state);
            match &*state {
                State::Resolved { run: current, ep: active } if *current == run => {
                    *state = State::Stale(active.clone());
                }
                _ => return false,
            }
        }
        self.cache.clear();
        {
            let mut state = lock(&self.state);
            if matches!(&*state, State::Stale(_)) {
                *state = State::Unresolved;
            }
        }
        self.listeners.notify(ep);
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(h) = lock(&self.monitor).take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use discovery_cache::KeyValueStore;
    use signance_core::{CandidateConfig, NetworkConfig, PortRange};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedProbe {
        alive: Mutex<HashSet<(String, u16)>>,
        calls: Mutex<Vec<(String, u16)>>,
        delay: Mutex<Duration>,
    }

    impl ScriptedProbe {
        fn new(alive: &[(&str, u16)]) -> Arc<Self> {
            Arc::new(Self::with_delay(alive, Duration::ZERO))
        }

        fn with_delay(alive: &[(&str, u16)], delay: Duration) -> Self {
            ScriptedProbe {
                alive: Mutex::new(alive.iter().map(|(h, p)| (h.to_string(), *p)).collect()),
                calls: Mutex::default(),
                delay: Mutex::new(delay),
            }
        }

        fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        fn revive(&self, host: &str, port: u16) {
            self.alive.lock().unwrap().insert((host.to_string(), port));
        }

        fn kill(&self, host: &str, port: u16) {
            self.alive.lock().unwrap().remove(&(host.to_string(), port));
        }

        fn calls(&self) -> Vec<(String, u16)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, host: &str, port: u16) -> bool {
            self.calls.lock().unwrap().push((host.to_string(), port));
            // answer as of the moment the request went out
            let alive = self.alive.lock().unwrap().contains(&(host.to_string(), port));
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            alive
        }
    }

    // page host + loopback pair, no subnet sweep: three hosts
    fn config(range: (u16, u16)) -> LocatorConfig {
        LocatorConfig {
            network: NetworkConfig {
                preferred_port: 8002,
                port_range: PortRange::new(range.0, range.1).unwrap(),
                ..NetworkConfig::default()
            },
            candidates: CandidateConfig::fixed(),
        }
    }

    fn locator(probe: Arc<ScriptedProbe>) -> Locator {
        let ctx = PageContext::new("192.168.1.20");
        let cache = DiscoveryCache::in_memory(ctx.origin_key());
        Locator::new(ctx, config((8000, 8010)), probe, cache).unwrap()
    }

    #[tokio::test]
    async fn preferred_port_wins_without_range_sweep() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        assert_eq!(loc.state(), LocatorState::Unresolved);

        assert_eq!(loc.base_url().await.unwrap(), "http://127.0.0.1:8002");
        assert_eq!(
            probe.calls(),
            vec![("192.168.1.20".to_string(), 8002), ("127.0.0.1".to_string(), 8002)]
        );
        assert_eq!(loc.state(), LocatorState::Resolved);
        assert_eq!(loc.active().unwrap().source, EndpointSource::Discovered);
        assert_eq!(loc.cache().read().unwrap().base_url, "http://127.0.0.1:8002");

        // resolved: no more probing
        loc.base_url().await.unwrap();
        assert_eq!(probe.calls().len(), 2);
        assert_eq!(loc.discovery_runs(), 1);
    }

    #[tokio::test]
    async fn range_sweep_is_host_major() {
        let probe = ScriptedProbe::new(&[("localhost", 8005)]);
        let ctx = PageContext::new("192.168.1.20");
        let cache = DiscoveryCache::in_memory(ctx.origin_key());
        let loc = Locator::new(ctx, config((8000, 8005)), probe.clone(), cache).unwrap();

        assert_eq!(loc.base_url().await.unwrap(), "http://localhost:8005");
        let calls = probe.calls();
        // 3 preferred-port probes, then 5 fallback ports for each host
        assert_eq!(calls.len(), 3 + 5 + 5 + 5);
        assert!(calls[..3].iter().all(|(_, p)| *p == 8002));
        assert_eq!(calls[3], ("192.168.1.20".to_string(), 8000));
        assert_eq!(calls[8], ("127.0.0.1".to_string(), 8000));
        assert!(calls[3..].iter().all(|(_, p)| *p != 8002));
        assert_eq!(calls.last().unwrap(), &("localhost".to_string(), 8005));
    }

    #[tokio::test]
    async fn exhausted_discovery_can_be_retried() {
        let probe = ScriptedProbe::new(&[]);
        let loc = locator(probe.clone());

        let err = loc.base_url().await.unwrap_err();
        match &err {
            LocatorError::DiscoveryExhausted { hosts, preferred_port, probes, .. } => {
                assert_eq!(hosts, &vec!["192.168.1.20".to_string(), "127.0.0.1".into(), "localhost".into()]);
                assert_eq!(*preferred_port, 8002);
                assert_eq!(*probes, 3 * 11);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("192.168.1.20"));
        assert_eq!(loc.state(), LocatorState::Unresolved);
        assert_eq!(probe.calls().len(), 33);

        probe.revive("192.168.1.20", 8002);
        assert_eq!(loc.base_url().await.unwrap(), "http://192.168.1.20:8002");
        assert_eq!(loc.discovery_runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_run() {
        let probe = Arc::new(ScriptedProbe::with_delay(&[("127.0.0.1", 8002)], Duration::from_millis(50)));
        let loc = locator(probe.clone());

        let other = loc.clone();
        let (a, b, c) = tokio::join!(loc.base_url(), loc.base_url(), other.resolve());
        assert_eq!(a.unwrap(), "http://127.0.0.1:8002");
        assert_eq!(b.unwrap(), "http://127.0.0.1:8002");
        assert_eq!(c.unwrap().base_url, "http://127.0.0.1:8002");
        assert_eq!(loc.discovery_runs(), 1);
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let probe = Arc::new(ScriptedProbe::with_delay(&[], Duration::from_millis(10)));
        let loc = locator(probe.clone());

        let (a, b) = tokio::join!(loc.base_url(), loc.base_url());
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(loc.discovery_runs(), 1);
        assert_eq!(probe.calls().len(), 33);
    }

    #[tokio::test]
    async fn cached_endpoint_needs_one_probe() {
        let probe = ScriptedProbe::new(&[("10.0.1.76", 8007)]);
        let loc = locator(probe.clone());
        loc.cache().write("10.0.1.76", 8007).unwrap();

        let ep = loc.resolve().await.unwrap();
        assert_eq!(ep.base_url, "http://10.0.1.76:8007");
        assert_eq!(ep.source, EndpointSource::Cache);
        assert_eq!(probe.calls(), vec![("10.0.1.76".to_string(), 8007)]);
    }

    #[tokio::test]
    async fn dead_cache_entry_falls_back_to_discovery() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.cache().write("10.0.1.76", 8007).unwrap();

        let ep = loc.resolve().await.unwrap();
        assert_eq!(ep.source, EndpointSource::Discovered);
        assert_eq!(probe.calls()[0], ("10.0.1.76".to_string(), 8007));
        assert_eq!(loc.cache().read().unwrap().base_url, "http://127.0.0.1:8002");
    }

    #[tokio::test]
    async fn cached_candidate_is_not_probed_twice() {
        let probe = ScriptedProbe::new(&[("localhost", 8002)]);
        let loc = locator(probe.clone());
        loc.cache().write("192.168.1.20", 8002).unwrap();

        loc.resolve().await.unwrap();
        let hits = probe.calls().iter().filter(|c| **c == ("192.168.1.20".to_string(), 8002)).count();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn same_origin_skips_probing() {
        let probe = ScriptedProbe::new(&[]);
        let ctx = PageContext::from_url("https://signage.example.org/admin").unwrap().with_same_origin(true);
        let cache = DiscoveryCache::in_memory(ctx.origin_key());
        let loc = Locator::new(ctx, config((8000, 8010)), probe.clone(), cache).unwrap();

        let ep = loc.resolve().await.unwrap();
        assert_eq!(ep.base_url, "https://signage.example.org");
        assert_eq!(ep.source, EndpointSource::SameOrigin);
        assert_eq!(loc.realtime_url("/ws").await.unwrap(), "wss://signage.example.org/ws");
        assert!(probe.calls().is_empty());
        assert!(loc.cache().read().is_none());
        assert!(loc.check_now().await);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn oversized_plan_is_refused_before_probing() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let ctx = PageContext::new("192.168.1.20");
        let mut cfg = config((8000, 8010));
        cfg.network.max_probes = 5;
        let loc = Locator::new(ctx.clone(), cfg, probe.clone(), DiscoveryCache::in_memory(ctx.origin_key())).unwrap();

        let err = loc.resolve().await.unwrap_err();
        assert_eq!(err, LocatorError::TooManyProbes { planned: 33, limit: 5 });
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn realtime_url_uses_ws_scheme() {
        let probe = ScriptedProbe::new(&[("192.168.1.20", 8002)]);
        let loc = locator(probe);
        assert_eq!(loc.realtime_url("/ws").await.unwrap(), "ws://192.168.1.20:8002/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_drops_dead_backend_and_notifies() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.init();
        loc.resolve().await.unwrap();

        let lost = Arc::new(Mutex::new(Vec::new()));
        let seen = lost.clone();
        let _sub = loc.on_connection_lost(move |ep| seen.lock().unwrap().push(ep.base_url.clone()));

        // one healthy interval
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(loc.state(), LocatorState::Resolved);
        assert!(lost.lock().unwrap().is_empty());

        probe.kill("127.0.0.1", 8002);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*lost.lock().unwrap(), vec!["http://127.0.0.1:8002".to_string()]);
        assert_eq!(loc.state(), LocatorState::Unresolved);
        assert!(loc.cache().read().is_none());

        // unresolved: nothing for the monitor to do
        let before = probe.calls().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls().len(), before);
        assert_eq!(lost.lock().unwrap().len(), 1);
        loc.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_stops_health_checks() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.init();
        loc.init();
        loc.resolve().await.unwrap();
        loc.teardown();

        probe.kill("127.0.0.1", 8002);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(loc.state(), LocatorState::Resolved);
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test]
    async fn check_now_reports_loss() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.resolve().await.unwrap();
        assert!(loc.check_now().await);

        probe.kill("127.0.0.1", 8002);
        assert!(!loc.check_now().await);
        assert_eq!(loc.state(), LocatorState::Unresolved);
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_not_called() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = loc.on_connection_lost(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        loc.on_connection_lost(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        })
        .detach();
        assert_eq!(loc.listener_count(), 2);
        sub.unsubscribe();
        assert_eq!(loc.listener_count(), 1);

        loc.resolve().await.unwrap();
        assert!(loc.invalidate());
        assert!(!loc.invalidate());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_starve_others() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe);
        let hits = Arc::new(AtomicUsize::new(0));
        let _a = loc.on_connection_lost(|_| panic!("listener bug"));
        let h = hits.clone();
        let _b = loc.on_connection_lost(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        loc.resolve().await.unwrap();
        loc.invalidate();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_discovery() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.resolve().await.unwrap();
        assert!(loc.invalidate());
        assert!(loc.cache().read().is_none());

        probe.kill("127.0.0.1", 8002);
        probe.revive("localhost", 8002);
        assert_eq!(loc.base_url().await.unwrap(), "http://localhost:8002");
        assert_eq!(loc.discovery_runs(), 2);
    }

    #[test]
    fn zero_health_interval_is_rejected() {
        let ctx = PageContext::new("192.168.1.20");
        let mut cfg = config((8000, 8010));
        cfg.network.health_interval_secs = 0;
        let cache = DiscoveryCache::in_memory(ctx.origin_key());
        let res = Locator::new(ctx, cfg, ScriptedProbe::new(&[]), cache);
        assert!(matches!(res, Err(LocatorError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_failed_check_spares_rediscovered_endpoint() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let loc = locator(probe.clone());
        loc.resolve().await.unwrap();
        let lost = Arc::new(AtomicUsize::new(0));
        let l = lost.clone();
        let _sub = loc.on_connection_lost(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        // the check goes out while the backend is down and answers late
        probe.kill("127.0.0.1", 8002);
        probe.set_delay(Duration::from_millis(100));
        let (healthy, ep) = tokio::join!(loc.check_now(), async {
            tokio::task::yield_now().await;
            probe.set_delay(Duration::ZERO);
            assert!(loc.invalidate());
            probe.revive("127.0.0.1", 8002);
            loc.resolve().await.unwrap()
        });

        assert!(!healthy);
        assert_eq!(ep.base_url, "http://127.0.0.1:8002");
        assert_eq!(loc.state(), LocatorState::Resolved);
        assert_eq!(loc.active().unwrap().base_url, "http://127.0.0.1:8002");
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(loc.discovery_runs(), 2);
    }

    struct FailingWrites;

    impl KeyValueStore for FailingWrites {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        fn set_all(&self, _pairs: &[(&str, String)]) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        fn remove_all(&self, _keys: &[&str]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cache_write_failure_still_resolves() {
        let probe = ScriptedProbe::new(&[("127.0.0.1", 8002)]);
        let ctx = PageContext::new("192.168.1.20");
        let cache = DiscoveryCache::new(Arc::new(FailingWrites), ctx.origin_key());
        let loc = Locator::new(ctx, config((8000, 8010)), probe, cache).unwrap();

        let ep = loc.resolve().await.unwrap();
        assert_eq!(ep.base_url, "http://127.0.0.1:8002");
        assert_eq!(ep.source, EndpointSource::Discovered);
        assert_eq!(loc.state(), LocatorState::Resolved);
        assert!(loc.cache().read().is_none());
    }
}
