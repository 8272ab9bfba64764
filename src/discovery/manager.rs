//! The Discovery Manager owns discoveries.
//!
//! When started, every discovery is put in sync mode and its events are
//! forwarded into one merged feed. A dispatcher keeps a cache of the ports
//! each discovery has reported, and hands every event to every watcher.
//!
//! Watchers which do not take an event within [`WATCHER_GRACE`] are dropped.

use std::{
    collections::HashMap,
    fmt::Display,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{future::join_all, Stream};
use itertools::Itertools;
use tokio::{sync::mpsc, time};
use tracing::{debug, debug_span, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{DiscoveryClient, EventReader};
use crate::{
    error::Error,
    events::{Event, EventKind},
    port::Port,
    process::{Launcher, ProcessLauncher},
    protocol::lock,
};

/// How long the dispatcher waits for a single watcher to take an event.
pub const WATCHER_GRACE: Duration = Duration::from_millis(500);

const FEED_CAPACITY: usize = 50;
const WATCHER_CAPACITY: usize = 10;
const SYNC_BUFFER: usize = 5;

type SharedClient = Arc<tokio::sync::Mutex<DiscoveryClient>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WatcherId(Uuid);

impl Display for WatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

#[derive(Debug, Default)]
struct Discoveries {
    clients: HashMap<String, SharedClient>,
    running: bool,
}

#[derive(Debug, Default)]
struct Watchers {
    senders: HashMap<WatcherId, mpsc::Sender<Event>>,

    // discovery ID -> port key -> the `add` which made the port visible
    cache: HashMap<String, HashMap<String, Event>>,
}

impl Watchers {
    /// Update the cache with an incoming event.
    /// Returns what should be delivered to watchers.
    fn apply(&mut self, event: Event) -> Vec<Event> {
        match &event.kind {
            EventKind::Add(port) => {
                self.cache
                    .entry(event.discovery_id.clone())
                    .or_default()
                    .insert(port.key(), event.clone());
                vec![event]
            }
            EventKind::Remove(port) => {
                if let Some(ports) = self.cache.get_mut(&event.discovery_id) {
                    ports.remove(&port.key());
                }
                vec![event]
            }
            EventKind::Stop => self
                .cache
                .remove(&event.discovery_id)
                .unwrap_or_default()
                .into_values()
                .map(Event::into_remove)
                .collect(),
        }
    }

    fn cached(&self) -> Vec<Event> {
        self.cache
            .values()
            .flat_map(|ports| ports.values().cloned())
            .collect()
    }

    fn snapshot(&self) -> Vec<(WatcherId, mpsc::Sender<Event>)> {
        self.senders
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    launcher: Arc<dyn Launcher>,
    discoveries: Mutex<Discoveries>,

    // Serializes start, add and clear.
    // Held across discovery I/O, so never taken by the dispatcher.
    start_lock: tokio::sync::Mutex<()>,

    feed: mpsc::Sender<Event>,
    feed_receiver: Mutex<Option<mpsc::Receiver<Event>>>,

    watchers: Arc<Mutex<Watchers>>,
}

/// Owns discoveries, merges their events and fans them out to watchers.
///
/// Cheap to clone: clones share the same discoveries and watchers.
#[derive(Debug, Clone)]
pub struct DiscoveryManager {
    inner: Arc<Inner>,
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new(Arc::new(ProcessLauncher))
    }
}

impl DiscoveryManager {
    /// A manager which launches discoveries using the given launcher.
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        let (feed, feed_receiver) = mpsc::channel(FEED_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                launcher,
                discoveries: Mutex::new(Discoveries::default()),
                start_lock: tokio::sync::Mutex::new(()),
                feed,
                feed_receiver: Mutex::new(Some(feed_receiver)),
                watchers: Arc::new(Mutex::new(Watchers::default())),
            }),
        }
    }

    /// The IDs of all added discoveries, sorted.
    pub fn ids(&self) -> Vec<String> {
        lock(&self.inner.discoveries)
            .clients
            .keys()
            .cloned()
            .sorted()
            .collect()
    }

    /// True once [`DiscoveryManager::start`] has run (and until [`DiscoveryManager::clear`]).
    pub fn is_running(&self) -> bool {
        lock(&self.inner.discoveries).running
    }

    /// Add a discovery launched from the command line `args`.
    ///
    /// If the manager is already running, the discovery is started right away.
    /// A failure to start is logged, the discovery is kept.
    pub async fn add(&self, id: impl Into<String>, args: Vec<String>) -> Result<(), Error> {
        let client = DiscoveryClient::new(id, args, self.inner.launcher.clone());
        self.add_shared(Arc::new(tokio::sync::Mutex::new(client)))
            .await
    }

    /// Add an already constructed discovery.
    pub async fn add_client(&self, client: DiscoveryClient) -> Result<(), Error> {
        self.add_shared(Arc::new(tokio::sync::Mutex::new(client)))
            .await
    }

    /// Add every discovery of `other` to this manager.
    /// Discoveries with IDs already present here are skipped.
    pub async fn add_all_discoveries_from(&self, other: &DiscoveryManager) {
        let clients = lock(&other.inner.discoveries)
            .clients
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for client in clients {
            if let Err(e) = self.add_shared(client).await {
                debug!(%e, "Discovery not added");
            }
        }
    }

    async fn add_shared(&self, client: SharedClient) -> Result<(), Error> {
        let _guard = self.inner.start_lock.lock().await;

        let id = client.lock().await.id().to_string();

        let running = {
            let mut discoveries = lock(&self.inner.discoveries);
            if discoveries.clients.contains_key(&id) {
                return Err(Error::DuplicateDiscovery(id));
            }
            discoveries.clients.insert(id.clone(), client.clone());
            discoveries.running
        };

        info!(discovery = %id, running, "Added discovery");

        if running {
            if let Err(e) = start_discovery(self.inner.feed.clone(), id, client).await {
                warn!(%e, "Could not start added discovery");
            }
        }

        Ok(())
    }

    /// Start every discovery in sync mode, concurrently.
    ///
    /// Does nothing if already running.
    /// Returns the problems of discoveries which failed to start;
    /// the others keep running.
    pub async fn start(&self) -> Vec<Error> {
        let _guard = self.inner.start_lock.lock().await;

        let clients = {
            let discoveries = lock(&self.inner.discoveries);
            if discoveries.running {
                return vec![];
            }
            discoveries
                .clients
                .iter()
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect::<Vec<_>>()
        };

        if let Some(feed) = lock(&self.inner.feed_receiver).take() {
            tokio::spawn(
                dispatch(Arc::downgrade(&self.inner.watchers), feed)
                    .instrument(info_span!("dispatcher")),
            );
        }

        let results = join_all(
            clients
                .into_iter()
                .map(|(id, client)| start_discovery(self.inner.feed.clone(), id, client)),
        )
        .await;

        lock(&self.inner.discoveries).running = true;

        let errors = results
            .into_iter()
            .filter_map(Result::err)
            .collect::<Vec<_>>();

        for e in &errors {
            warn!(%e, "Discovery did not start");
        }
        info!(failed = errors.len(), "Discovery manager started");

        errors
    }

    /// Watch ports come and go.
    ///
    /// Starts the manager if needed. The watcher first receives an `add`
    /// for every currently known port, then live events.
    pub async fn watch(&self) -> PortWatcher {
        self.start().await;

        let id = WatcherId(Uuid::new_v4());
        let mut watchers = lock(&self.inner.watchers);

        let replay = watchers.cached();
        let (sender, events) = mpsc::channel(WATCHER_CAPACITY + replay.len());
        for event in replay {
            // Capacity covers the whole replay.
            let _ = sender.try_send(event);
        }
        watchers.senders.insert(id, sender);

        debug!(watcher = %id, "Added watcher");

        PortWatcher {
            id,
            events,
            watchers: Arc::downgrade(&self.inner.watchers),
        }
    }

    /// All ports currently known, over all discoveries.
    ///
    /// Starts the manager if needed.
    pub async fn list(&self) -> Vec<Port> {
        self.start().await;

        lock(&self.inner.watchers)
            .cached()
            .into_iter()
            .filter_map(|event| event.port().cloned())
            .collect()
    }

    /// Quit every discovery (if running) and forget about them.
    pub async fn clear(&self) {
        let _guard = self.inner.start_lock.lock().await;

        let (clients, running) = {
            let mut discoveries = lock(&self.inner.discoveries);
            let running = mem::replace(&mut discoveries.running, false);
            (mem::take(&mut discoveries.clients), running)
        };

        if running {
            join_all(clients.into_iter().map(|(id, client)| async move {
                match client.lock().await.quit().await {
                    Ok(()) => info!(discovery = %id, "Closed and removed discovery"),
                    Err(e) => warn!(discovery = %id, %e, "Quitting discovery failed"),
                }
            }))
            .await;
        }
    }
}

async fn start_discovery(
    feed: mpsc::Sender<Event>,
    id: String,
    client: SharedClient,
) -> Result<(), Error> {
    let failed = |source| Error::DiscoveryStart {
        id: id.clone(),
        source: Box::new(source),
    };

    let reader = {
        let mut client = client.lock().await;
        client.start().map_err(failed)?;
        client.run_start().await.map_err(failed)?;
        client.start_sync(SYNC_BUFFER).await.map_err(failed)?
    };

    tokio::spawn(forward(reader, feed).instrument(debug_span!("forward", discovery = %id)));

    Ok(())
}

async fn forward(mut reader: EventReader, feed: mpsc::Sender<Event>) {
    while let Some(event) = reader.next_event().await {
        if feed.send(event).await.is_err() {
            debug!("Feed closed");
            return;
        }
    }
    debug!("Discovery done");
}

async fn dispatch(watchers: Weak<Mutex<Watchers>>, mut feed: mpsc::Receiver<Event>) {
    while let Some(event) = feed.recv().await {
        let Some(shared) = watchers.upgrade() else {
            break;
        };

        let (events, mut snapshot) = {
            let mut watchers = lock(&shared);
            (watchers.apply(event), watchers.snapshot())
        };

        for event in events {
            info!(%event, "Dispatching");
            deliver(&shared, &mut snapshot, event).await;
        }
    }

    debug!("Dispatcher done");
}

async fn deliver(
    watchers: &Mutex<Watchers>,
    snapshot: &mut Vec<(WatcherId, mpsc::Sender<Event>)>,
    event: Event,
) {
    let outcomes = join_all(snapshot.iter().map(|(id, sender)| {
        let event = event.clone();
        async move { (*id, time::timeout(WATCHER_GRACE, sender.send(event)).await) }
    }))
    .await;

    let evicted = outcomes
        .into_iter()
        .filter_map(|(id, outcome)| match outcome {
            Ok(Ok(())) => None,
            Ok(Err(_)) => {
                debug!(watcher = %id, "Watcher is gone");
                Some(id)
            }
            Err(_) => {
                warn!(watcher = %id, "Watcher did not take event in time, removing it");
                Some(id)
            }
        })
        .collect::<Vec<_>>();

    if evicted.is_empty() {
        return;
    }

    snapshot.retain(|(id, _)| !evicted.contains(id));

    let mut watchers = lock(watchers);
    for id in evicted {
        watchers.senders.remove(&id);
    }
}

/// Receives port events from a [`DiscoveryManager`].
///
/// Dropping the watcher unregisters it.
#[derive(Debug)]
pub struct PortWatcher {
    id: WatcherId,
    events: mpsc::Receiver<Event>,
    watchers: Weak<Mutex<Watchers>>,
}

impl PortWatcher {
    /// The next event.
    ///
    /// [`None`] means the watcher was removed, e.g. for being too slow.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Stop watching.
    pub fn close(self) {}
}

impl Stream for PortWatcher {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        if let Some(watchers) = self.watchers.upgrade() {
            lock(&watchers).senders.remove(&self.id);
            debug!(watcher = %self.id, "Removed watcher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLauncher;
    use pretty_assertions::assert_eq;

    fn manager() -> DiscoveryManager {
        DiscoveryManager::new(Arc::new(MockLauncher))
    }

    fn mock_discovery(ports: &[&str]) -> Vec<String> {
        std::iter::once("mock-discovery")
            .chain(ports.iter().copied())
            .map(String::from)
            .collect()
    }

    async fn next(watcher: &mut PortWatcher) -> Event {
        time::timeout(Duration::from_secs(5), watcher.next_event())
            .await
            .expect("Event should arrive")
            .expect("Watcher should be open")
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let manager = manager();
        manager.add("a", mock_discovery(&[])).await.unwrap();

        let err = manager.add("a", mock_discovery(&[])).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateDiscovery(id) if id == "a"));
        assert_eq!(manager.ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let manager = manager();
        manager.add("a", mock_discovery(&["serial:COM1"])).await.unwrap();

        assert!(manager.start().await.is_empty());
        assert!(manager.start().await.is_empty());
        assert!(manager.is_running());
    }

    #[tokio::test]
    async fn start_errors_are_collected() {
        let manager = manager();
        manager.add("good", mock_discovery(&[])).await.unwrap();
        manager
            .add("bad", vec!["no-such-tool".into()])
            .await
            .unwrap();

        let errors = manager.start().await;

        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::DiscoveryStart { id, .. } if id == "bad"));
    }

    #[tokio::test]
    async fn watcher_sees_adds_from_every_discovery() {
        let manager = manager();
        manager.add("a", mock_discovery(&["serial:COM1"])).await.unwrap();
        manager.add("b", mock_discovery(&["network:10.0.0.2"])).await.unwrap();

        let mut watcher = manager.watch().await;

        let mut keys = vec![];
        while keys.len() < 2 {
            let event = next(&mut watcher).await;
            assert_eq!(event.event_type(), "add");
            keys.push(event.port().unwrap().key());
        }
        keys.sort();

        assert_eq!(keys, vec!["10.0.0.2|network", "COM1|serial"]);
    }

    #[tokio::test]
    async fn late_watcher_gets_replay() {
        let manager = manager();
        manager.add("a", mock_discovery(&["serial:COM1"])).await.unwrap();

        let mut first = manager.watch().await;
        next(&mut first).await;

        let mut late = manager.watch().await;
        let replayed = next(&mut late).await;

        assert_eq!(replayed, Event::add("a", Port::new("COM1", "serial")));
    }

    #[tokio::test]
    async fn list_returns_cached_ports() {
        let manager = manager();
        manager.add("a", mock_discovery(&["serial:COM1"])).await.unwrap();

        let mut watcher = manager.watch().await;
        next(&mut watcher).await;

        assert_eq!(manager.list().await, vec![Port::new("COM1", "serial")]);
    }

    #[tokio::test]
    async fn adding_to_running_manager_starts_discovery() {
        let manager = manager();
        let mut watcher = manager.watch().await;

        manager.add("late", mock_discovery(&["serial:COM7"])).await.unwrap();

        let event = next(&mut watcher).await;
        assert_eq!(event.discovery_id, "late");
    }

    #[tokio::test]
    async fn clear_removes_every_port() {
        let manager = manager();
        manager
            .add("a", mock_discovery(&["serial:COM1", "serial:COM2"]))
            .await
            .unwrap();

        let mut watcher = manager.watch().await;
        next(&mut watcher).await;
        next(&mut watcher).await;

        manager.clear().await;
        assert!(manager.ids().is_empty());

        let mut removed = vec![next(&mut watcher).await, next(&mut watcher).await];
        removed.sort_by_key(|event| event.port().unwrap().key());

        assert_eq!(
            removed,
            vec![
                Event::remove("a", Port::new("COM1", "serial")),
                Event::remove("a", Port::new("COM2", "serial")),
            ]
        );
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn stuck_watcher_is_evicted() {
        let ports = (0..WATCHER_CAPACITY + 5)
            .map(|n| format!("serial:COM{n}"))
            .collect::<Vec<_>>();
        let ports = ports.iter().map(String::as_str).collect::<Vec<_>>();

        let manager = manager();
        let mut stuck = manager.watch().await;
        let mut healthy = manager.watch().await;

        manager.add("a", mock_discovery(&ports)).await.unwrap();

        for _ in 0..ports.len() {
            next(&mut healthy).await;
        }

        // The stuck watcher got what fit in its queue, then was closed.
        let mut received = 0;
        while stuck.next_event().await.is_some() {
            received += 1;
        }
        assert_eq!(received, WATCHER_CAPACITY);
    }

    #[test]
    fn stop_turns_cache_into_removes() {
        let mut watchers = Watchers::default();
        watchers.apply(Event::add("a", Port::new("COM1", "serial")));
        watchers.apply(Event::add("b", Port::new("COM2", "serial")));
        watchers.apply(Event::remove("b", Port::new("COM2", "serial")));

        assert_eq!(
            watchers.apply(Event::stop("a")),
            vec![Event::remove("a", Port::new("COM1", "serial"))]
        );
        assert_eq!(watchers.apply(Event::stop("b")), vec![]);
        assert!(watchers.cached().is_empty());
    }
}
