//! # Namespace Fan-out
//!
//! One watch session per configured namespace, or a single cluster-wide session
//! when no namespace is configured. Each session keeps a reflector cache of the
//! pods it sees and forwards every notification to the term's [`EventHandler`].
//!
//! The fan-out only reports success once every session finished its initial
//! list. A session that does not sync within the timeout fails the whole
//! fan-out; nothing is dispatched from a partially synced view.

use crate::controller::dispatcher::EventHandler;
use crate::error::StartupError;
use crate::observability::metrics;
use crate::runtime::lifetime::Lifetime;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Human readable name of a watch scope
#[must_use]
pub fn scope_label(namespace: Option<&str>) -> String {
    namespace.map_or_else(|| "all namespaces".to_string(), |ns| format!("namespace {ns}"))
}

/// A running watch session and the cache it maintains
#[derive(Debug)]
pub struct Session {
    scope: String,
    reader: Store<Pod>,
    task: JoinHandle<()>,
}

impl Session {
    /// Start consuming `events`, feeding the cache and `handler`
    pub fn spawn<S, H>(scope: String, events: S, handler: Arc<H>, lifetime: Lifetime) -> Self
    where
        S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send + 'static,
        H: EventHandler + ?Sized + 'static,
    {
        let (reader, writer) = reflector::store::<Pod>();
        let span = tracing::info_span!("controller.watch", scope = scope.as_str());
        let task = tokio::spawn(
            run_session(events, writer, reader.clone(), handler, lifetime).instrument(span),
        );
        Self {
            scope,
            reader,
            task,
        }
    }

    /// Wait until the initial list has been delivered.
    ///
    /// # Errors
    ///
    /// [`StartupError::CacheSyncTimeout`] after `timeout`, or
    /// [`StartupError::WatchClosed`] if the session ended first.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), StartupError> {
        match tokio::time::timeout(timeout, self.reader.wait_until_ready()).await {
            Ok(Ok(())) => {
                info!("Cache synced for {} ({} pods)", self.scope, self.reader.len());
                Ok(())
            }
            Ok(Err(_writer_dropped)) => Err(StartupError::WatchClosed {
                scope: self.scope.clone(),
            }),
            Err(_elapsed) => Err(StartupError::CacheSyncTimeout {
                scope: self.scope.clone(),
                timeout,
            }),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn reader(&self) -> &Store<Pod> {
        &self.reader
    }
}

async fn run_session<S, H>(
    events: S,
    mut writer: reflector::store::Writer<Pod>,
    reader: Store<Pod>,
    handler: Arc<H>,
    lifetime: Lifetime,
) where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send,
    H: EventHandler + ?Sized,
{
    let mut events = std::pin::pin!(events);
    loop {
        let next = tokio::select! {
            () = lifetime.cancelled() => break,
            next = events.next() => next,
        };

        match next {
            None => {
                warn!("Watch stream ended");
                break;
            }
            Some(Err(e)) => {
                // The backoff wrapper retries, so the session carries on
                metrics::increment_watch_errors();
                warn!(error = %e, "watch.error");
            }
            Some(Ok(event)) => {
                match &event {
                    Event::Apply(pod) => {
                        let known = reader.get(&ObjectRef::from_obj(pod)).is_some();
                        writer.apply_watcher_event(&event);
                        if known {
                            handler.on_update(pod);
                        } else {
                            handler.on_add(pod);
                        }
                    }
                    Event::InitApply(pod) => {
                        writer.apply_watcher_event(&event);
                        handler.on_add(pod);
                    }
                    Event::Delete(pod) => {
                        writer.apply_watcher_event(&event);
                        handler.on_delete(pod);
                    }
                    Event::Init | Event::InitDone => {
                        writer.apply_watcher_event(&event);
                    }
                }
            }
        }
    }
    debug!("watch session stopped");
}

/// Timing knobs for [`FanOut::start`]
#[derive(Debug, Clone, Copy)]
pub struct FanOutOptions {
    pub cache_sync_timeout: Duration,
    /// `None` disables periodic resync
    pub resync_interval: Option<Duration>,
}

/// All watch sessions of one leadership term
#[derive(Debug)]
pub struct FanOut {
    sessions: Vec<Session>,
    resync: Option<JoinHandle<()>>,
    lifetime: Lifetime,
}

impl FanOut {
    /// Watch pods in every scope and wait for all caches to sync.
    ///
    /// A `None` scope watches all namespaces.
    ///
    /// # Errors
    ///
    /// Returns the first sync failure; every session is stopped before returning.
    pub async fn start<H>(
        client: &Client,
        scopes: &[Option<String>],
        handler: Arc<H>,
        options: FanOutOptions,
        lifetime: &Lifetime,
    ) -> Result<Self, StartupError>
    where
        H: EventHandler + ?Sized + 'static,
    {
        let streams = scopes.iter().map(|scope| {
            let api: Api<Pod> = match scope {
                Some(namespace) => Api::namespaced(client.clone(), namespace),
                None => Api::all(client.clone()),
            };
            let events = watcher::watcher(api, watcher::Config::default()).default_backoff();
            (scope_label(scope.as_deref()), events)
        });
        Self::from_streams(streams, handler, options, lifetime).await
    }

    /// Like [`FanOut::start`] but over already constructed event streams
    ///
    /// # Errors
    ///
    /// Returns the first sync failure; every session is stopped before returning.
    pub async fn from_streams<I, S, H>(
        streams: I,
        handler: Arc<H>,
        options: FanOutOptions,
        lifetime: &Lifetime,
    ) -> Result<Self, StartupError>
    where
        I: IntoIterator<Item = (String, S)>,
        S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send + 'static,
        H: EventHandler + ?Sized + 'static,
    {
        let lifetime = lifetime.child();
        let sessions: Vec<Session> = streams
            .into_iter()
            .map(|(scope, events)| {
                info!("Starting pod watch for {}", scope);
                Session::spawn(scope, events, Arc::clone(&handler), lifetime.clone())
            })
            .collect();

        let synced = futures::future::try_join_all(
            sessions
                .iter()
                .map(|session| session.wait_synced(options.cache_sync_timeout)),
        )
        .await;

        let mut fan_out = Self {
            sessions,
            resync: None,
            lifetime,
        };
        if let Err(e) = synced {
            fan_out.stop().await;
            return Err(e);
        }

        if let Some(period) = options.resync_interval {
            let readers = fan_out.sessions.iter().map(|s| s.reader.clone()).collect();
            fan_out.resync = Some(tokio::spawn(run_resync(
                readers,
                handler,
                period,
                fan_out.lifetime.clone(),
            )));
        }

        Ok(fan_out)
    }

    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Stop every session and the resync task and wait for them to finish.
    /// Returns how many of them had failed.
    pub async fn stop(self) -> usize {
        self.lifetime.cancel();
        let mut failed = 0;
        if let Some(resync) = self.resync {
            if let Err(e) = resync.await {
                warn!(error = %e, "Resync task failed");
                failed += 1;
            }
        }
        for session in self.sessions {
            if let Err(e) = session.task.await {
                warn!(error = %e, scope = session.scope.as_str(), "Watch session task failed");
                failed += 1;
            }
        }
        failed
    }
}

/// Re-deliver every cached pod as an update once per `period`
async fn run_resync<H>(readers: Vec<Store<Pod>>, handler: Arc<H>, period: Duration, lifetime: Lifetime)
where
    H: EventHandler + ?Sized,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the initial list was just dispatched
    ticker.tick().await;

    loop {
        tokio::select! {
            () = lifetime.cancelled() => break,
            _ = ticker.tick() => {
                let pods: Vec<_> = readers.iter().flat_map(Store::state).collect();
                debug!(pods = pods.len(), "resync");
                for pod in pods {
                    handler.on_update(&pod);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::sync::Mutex;

    type Events = BoxStream<'static, Result<Event<Pod>, watcher::Error>>;

    /// Deliver `events`, then stay open like a live watch
    fn open(events: Vec<Event<Pod>>) -> Events {
        futures::stream::iter(events.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed()
    }

    fn closed(events: Vec<Event<Pod>>) -> Events {
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(&'static str, String)>>,
    }

    impl Recorder {
        fn record(&self, kind: &'static str, pod: &Pod) {
            let name = pod.metadata.name.clone().unwrap_or_default();
            self.calls.lock().unwrap().push((kind, name));
        }

        fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EventHandler for Recorder {
        fn on_add(&self, pod: &Pod) {
            self.record("add", pod);
        }
        fn on_update(&self, pod: &Pod) {
            self.record("update", pod);
        }
        fn on_delete(&self, pod: &Pod) {
            self.record("delete", pod);
        }
    }

    fn pod(name: &str, version: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": "ns", "resourceVersion": version }
        }))
        .unwrap()
    }

    fn options() -> FanOutOptions {
        FanOutOptions {
            cache_sync_timeout: Duration::from_secs(5),
            resync_interval: None,
        }
    }

    #[test]
    fn test_scope_label() {
        assert_eq!(scope_label(None), "all namespaces");
        assert_eq!(scope_label(Some("team-a")), "namespace team-a");
    }

    #[tokio::test]
    async fn test_events_are_classified() {
        let recorder = Arc::new(Recorder::default());
        let events = open(vec![
            Event::Init,
            Event::InitApply(pod("a", "1")),
            Event::InitDone,
            Event::Apply(pod("a", "2")),
            Event::Apply(pod("b", "3")),
            Event::Delete(pod("a", "4")),
        ]);

        let lifetime = Lifetime::new();
        let fan_out = FanOut::from_streams(
            [("namespace ns".to_string(), events)],
            Arc::clone(&recorder),
            options(),
            &lifetime,
        )
        .await
        .unwrap();

        // Give the session a chance to drain the remaining events
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fan_out.stop().await, 0);

        assert_eq!(
            recorder.calls(),
            vec![
                ("add", "a".to_string()),
                ("update", "a".to_string()),
                ("add", "b".to_string()),
                ("delete", "a".to_string()),
            ]
        );
    }

    /// Handler that fails on every update
    struct Failing;

    impl EventHandler for Failing {
        fn on_add(&self, _pod: &Pod) {}
        fn on_update(&self, pod: &Pod) {
            panic!("cannot handle {:?}", pod.metadata.name);
        }
        fn on_delete(&self, _pod: &Pod) {}
    }

    #[tokio::test]
    async fn test_stop_reports_failed_session() {
        let events = open(vec![
            Event::Init,
            Event::InitApply(pod("a", "1")),
            Event::InitDone,
            Event::Apply(pod("a", "2")),
        ]);
        let healthy = open(vec![Event::Init, Event::InitDone]);

        let fan_out = FanOut::from_streams(
            [
                ("namespace a".to_string(), events),
                ("namespace b".to_string(), healthy),
            ],
            Arc::new(Failing),
            options(),
            &Lifetime::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fan_out.stop().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsynced_session_times_out() {
        let recorder = Arc::new(Recorder::default());
        let synced = open(vec![Event::Init, Event::InitDone]);
        let stuck = open(Vec::new());

        let result = FanOut::from_streams(
            [
                ("namespace a".to_string(), synced),
                ("namespace b".to_string(), stuck),
            ],
            recorder,
            options(),
            &Lifetime::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(StartupError::CacheSyncTimeout { ref scope, .. }) if scope == "namespace b"
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_before_sync_fails() {
        let recorder = Arc::new(Recorder::default());
        let events = closed(vec![Event::Init]);

        let result = FanOut::from_streams(
            [("all namespaces".to_string(), events)],
            recorder,
            options(),
            &Lifetime::new(),
        )
        .await;

        assert!(matches!(result, Err(StartupError::WatchClosed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_redelivers_cached_pods() {
        let recorder = Arc::new(Recorder::default());
        let events = open(vec![
            Event::Init,
            Event::InitApply(pod("a", "1")),
            Event::InitDone,
        ]);

        let fan_out = FanOut::from_streams(
            [("namespace ns".to_string(), events)],
            Arc::clone(&recorder),
            FanOutOptions {
                cache_sync_timeout: Duration::from_secs(5),
                resync_interval: Some(Duration::from_secs(600)),
            },
            &Lifetime::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(601)).await;
        fan_out.stop().await;

        assert_eq!(
            recorder.calls(),
            vec![("add", "a".to_string()), ("update", "a".to_string())]
        );
    }
}
