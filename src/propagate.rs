use std::{
    collections::{BTreeMap, btree_map::Entry},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures_util::{FutureExt as _, future::join_all};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::{
    config::{Config, DebounceScope},
    domain::LedPayload,
    id::new_run_id,
    state::JsonSnapshotStore,
    transport::{DeviceTransport, TransportError},
    viewers::ViewerHub,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropagationScope {
    All,
    Device(String),
}

impl std::fmt::Display for PropagationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Device(name) => write!(f, "device:{name}"),
        }
    }
}

impl DebounceScope {
    fn resolve(self, scope: PropagationScope) -> PropagationScope {
        match self {
            Self::PerDevice => scope,
            Self::Global => PropagationScope::All,
        }
    }
}

/// Cheap, cloneable entry point for request handlers. Requests never block and never fail;
/// once the coordinator is gone they are dropped.
#[derive(Debug, Clone)]
pub struct PropagationHandle {
    tx: Option<mpsc::UnboundedSender<PropagationScope>>,
}

impl PropagationHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<PropagationScope>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn request(&self, scope: PropagationScope) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(scope);
        }
    }

    pub fn request_device(&self, name: impl Into<String>) {
        self.request(PropagationScope::Device(name.into()));
    }

    pub fn request_all(&self) {
        self.request(PropagationScope::All);
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub debounce: Duration,
    /// `None` disables the periodic sweep.
    pub sweep_interval: Option<Duration>,
    pub scope: DebounceScope,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            scope: DebounceScope::PerDevice,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            sweep_interval: (config.sweep_interval_ms > 0)
                .then(|| Duration::from_millis(config.sweep_interval_ms)),
            scope: config.debounce_scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub device: String,
    pub address: String,
    pub error: TransportError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    pub scope: PropagationScope,
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
    pub broadcast: bool,
}

impl PropagationReport {
    fn empty(scope: PropagationScope) -> Self {
        Self {
            scope,
            delivered: Vec::new(),
            failed: Vec::new(),
            broadcast: false,
        }
    }
}

/// Everything one propagation run needs; shared by the coordinator and its spawned runs.
#[derive(Clone)]
pub struct PropagationContext {
    pub store: Arc<Mutex<JsonSnapshotStore>>,
    pub transport: Arc<dyn DeviceTransport>,
    pub viewers: ViewerHub,
}

/// Pushes the current desired state of the working set to the devices, then broadcasts the
/// whole registry to viewers. Device state is read here, never at request time.
pub async fn propagate_once(ctx: &PropagationContext, scope: &PropagationScope) -> PropagationReport {
    let span = info_span!("propagate", run_id = %new_run_id(), %scope);
    propagate_inner(ctx, scope).instrument(span).await
}

async fn propagate_inner(ctx: &PropagationContext, scope: &PropagationScope) -> PropagationReport {
    let mut report = PropagationReport::empty(scope.clone());

    let working_set = {
        let store = ctx.store.lock().await;
        match scope {
            PropagationScope::All => store.list_devices(),
            PropagationScope::Device(name) => store.get_device(name).into_iter().collect(),
        }
    };

    if working_set.is_empty() {
        match scope {
            PropagationScope::All => warn!("no devices registered yet; nothing to propagate"),
            PropagationScope::Device(name) => {
                warn!(device = %name, "device not registered; nothing to propagate")
            }
        }
        return report;
    }

    let sends = working_set.iter().map(|device| {
        let pending = ctx
            .transport
            .send(&device.address, LedPayload::from(device));
        async move { (device, pending.await) }
    });

    for (device, result) in join_all(sends).await {
        match result {
            Ok(()) => {
                debug!(device = %device.name, address = %device.address, "pushed state");
                report.delivered.push(device.name.clone());
            }
            Err(error) => {
                info!(
                    device = %device.name,
                    address = %device.address,
                    %error,
                    "could not reach device"
                );
                report.failed.push(DeliveryFailure {
                    device: device.name.clone(),
                    address: device.address.clone(),
                    error,
                });
            }
        }
    }

    let all_devices = ctx.store.lock().await.list_devices();
    ctx.viewers.broadcast_state(all_devices);
    report.broadcast = true;

    report
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Waiting { due: Instant },
    /// The push for this window is executing. `rerun` records a request that arrived after
    /// the registry was read, so the window reopens once the push completes.
    Running { rerun: bool },
}

#[derive(Debug, Default)]
struct Windows {
    by_scope: BTreeMap<PropagationScope, Window>,
}

impl Windows {
    /// Returns true when the request opened a new window, false when it was absorbed.
    fn open(&mut self, scope: PropagationScope, now: Instant, debounce: Duration) -> bool {
        match self.by_scope.entry(scope) {
            Entry::Vacant(entry) => {
                entry.insert(Window::Waiting {
                    due: now + debounce,
                });
                true
            }
            Entry::Occupied(mut entry) => {
                if let Window::Running { rerun } = entry.get_mut() {
                    *rerun = true;
                }
                false
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.by_scope
            .values()
            .filter_map(|w| match w {
                Window::Waiting { due } => Some(*due),
                Window::Running { .. } => None,
            })
            .min()
    }

    /// Marks every window due at `now` as running and returns their scopes.
    fn take_due(&mut self, now: Instant) -> Vec<PropagationScope> {
        let mut out = Vec::new();
        for (scope, window) in self.by_scope.iter_mut() {
            if matches!(*window, Window::Waiting { due } if due <= now) {
                *window = Window::Running { rerun: false };
                out.push(scope.clone());
            }
        }
        out
    }

    fn take_all_waiting(&mut self) -> Vec<PropagationScope> {
        let mut out = Vec::new();
        for (scope, window) in self.by_scope.iter_mut() {
            if matches!(window, Window::Waiting { .. }) {
                *window = Window::Running { rerun: false };
                out.push(scope.clone());
            }
        }
        out
    }

    /// Closes the window; returns true if it was immediately reopened for a follow-up run.
    fn finish(&mut self, scope: &PropagationScope, now: Instant, debounce: Duration) -> bool {
        match self.by_scope.remove(scope) {
            Some(Window::Running { rerun: true }) => {
                self.by_scope.insert(
                    scope.clone(),
                    Window::Waiting {
                        due: now + debounce,
                    },
                );
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Window(PropagationScope),
    Sweep,
}

/// Owns the coordinator task. Dropping it without calling [`Coordinator::shutdown`] stops the
/// task the same way; the detached task still flushes and drains, but nobody waits for it.
pub struct Coordinator {
    handle: PropagationHandle,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Coordinator {
    pub fn handle(&self) -> PropagationHandle {
        self.handle.clone()
    }

    /// Stops the sweep, fires any windows still waiting, and waits for in-flight pushes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "propagation coordinator task failed");
        }
    }
}

pub fn spawn_coordinator(ctx: PropagationContext, options: CoordinatorOptions) -> Coordinator {
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(coordinator_task(Arc::new(ctx), rx, shutdown_rx, options));
    Coordinator {
        handle: PropagationHandle { tx: Some(tx) },
        shutdown_tx,
        task,
    }
}

async fn coordinator_task(
    ctx: Arc<PropagationContext>,
    mut rx: mpsc::UnboundedReceiver<PropagationScope>,
    mut shutdown: watch::Receiver<bool>,
    options: CoordinatorOptions,
) {
    let mut windows = Windows::default();
    let mut tasks = JoinSet::new();
    let mut sweep_running = false;

    let mut sweep = options.sweep_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let next_due = windows.next_due();

        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = rx.recv() => {
                let Some(scope) = maybe else { break };
                let scope = options.scope.resolve(scope);
                if windows.open(scope.clone(), Instant::now(), options.debounce) {
                    debug!(%scope, "debounce window opened");
                }
            }
            _ = async {
                if let Some(ticker) = sweep.as_mut() {
                    ticker.tick().await;
                }
            }, if sweep.is_some() => {
                if sweep_running {
                    debug!("previous sweep still running; skipping tick");
                } else {
                    sweep_running = true;
                    spawn_run(&mut tasks, &ctx, Slot::Sweep);
                }
            }
            _ = async {
                if let Some(at) = next_due {
                    tokio::time::sleep_until(at).await;
                }
            }, if next_due.is_some() => {
                for scope in windows.take_due(Instant::now()) {
                    spawn_run(&mut tasks, &ctx, Slot::Window(scope));
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                Ok(Slot::Sweep) => sweep_running = false,
                Ok(Slot::Window(scope)) => {
                    if windows.finish(&scope, Instant::now(), options.debounce) {
                        debug!(%scope, "state changed during push; window reopened");
                    }
                }
                Err(err) => warn!(error = %err, "propagation task did not complete"),
            },
        }
    }

    // Requests accepted before shutdown still get their push.
    rx.close();
    while let Ok(scope) = rx.try_recv() {
        windows.open(options.scope.resolve(scope), Instant::now(), options.debounce);
    }
    for scope in windows.take_all_waiting() {
        spawn_run(&mut tasks, &ctx, Slot::Window(scope));
    }
    info!(
        in_flight = tasks.len(),
        "propagation coordinator stopping; draining in-flight pushes"
    );
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Slot::Window(scope)) => {
                if windows.finish(&scope, Instant::now(), Duration::ZERO) {
                    debug!(%scope, "state changed during push; running follow-up before exit");
                    for scope in windows.take_all_waiting() {
                        spawn_run(&mut tasks, &ctx, Slot::Window(scope));
                    }
                }
            }
            Ok(Slot::Sweep) => {}
            Err(err) => warn!(error = %err, "propagation task did not complete"),
        }
    }
}

fn spawn_run(tasks: &mut JoinSet<Slot>, ctx: &Arc<PropagationContext>, slot: Slot) {
    let ctx = ctx.clone();
    tasks.spawn(async move {
        let scope = match &slot {
            Slot::Window(scope) => scope.clone(),
            Slot::Sweep => PropagationScope::All,
        };
        // A panicking run must still hand its slot back, or its window would never close.
        if AssertUnwindSafe(propagate_once(&ctx, &scope))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(%scope, "propagation run panicked");
        }
        slot
    });
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::TryRecvError;
    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;
    use crate::{
        domain::Rgb,
        state::StoreInit,
        transport::SendFuture,
        viewers::StateUpdate,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Call {
        address: String,
        payload: LedPayload,
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        completed: Arc<Mutex<usize>>,
        unreachable: BTreeSet<String>,
        delay: Duration,
    }

    impl DeviceTransport for RecordingTransport {
        fn send(&self, address: &str, payload: LedPayload) -> SendFuture {
            let calls = self.calls.clone();
            let completed = self.completed.clone();
            let unreachable = self.unreachable.contains(address);
            let delay = self.delay;
            let address = address.to_string();
            Box::pin(async move {
                calls.lock().await.push(Call {
                    address: address.clone(),
                    payload,
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                *completed.lock().await += 1;
                if unreachable {
                    return Err(TransportError::Connect(format!("{address} refused")));
                }
                Ok(())
            })
        }
    }

    struct Harness {
        ctx: PropagationContext,
        calls: Arc<Mutex<Vec<Call>>>,
        completed: Arc<Mutex<usize>>,
        _tmp: tempfile::TempDir,
    }

    fn harness(transport: RecordingTransport) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::load_or_init(StoreInit {
            data_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        let calls = transport.calls.clone();
        let completed = transport.completed.clone();
        Harness {
            ctx: PropagationContext {
                store: Arc::new(Mutex::new(store)),
                transport: Arc::new(transport),
                viewers: ViewerHub::new(),
            },
            calls,
            completed,
            _tmp: tmp,
        }
    }

    impl Harness {
        async fn add_device(&self, name: &str, address: &str) {
            self.ctx
                .store
                .lock()
                .await
                .create_device(name.to_string(), address.to_string())
                .unwrap();
        }

        async fn set_color(&self, name: &str, color: Rgb) {
            self.ctx
                .store
                .lock()
                .await
                .update_device_state(name, color, true)
                .unwrap();
        }

        async fn calls(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    /// Counts `WARN` events emitted while installed as the thread's default subscriber.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl WarnCounter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn options(debounce_ms: u64, scope: DebounceScope) -> CoordinatorOptions {
        CoordinatorOptions {
            debounce: Duration::from_millis(debounce_ms),
            sweep_interval: None,
            scope,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<StateUpdate>) -> Vec<StateUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    fn payload(color: Rgb) -> LedPayload {
        LedPayload {
            r: color.r,
            g: color.g,
            b: color.b,
            power: true,
        }
    }

    #[tokio::test]
    async fn single_device_push_broadcasts_the_whole_registry() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        h.add_device("shelf", "10.0.0.2").await;
        h.set_color("desk", Rgb::new(9, 8, 7)).await;
        let mut viewer = h.ctx.viewers.subscribe();

        let report =
            propagate_once(&h.ctx, &PropagationScope::Device("desk".to_string())).await;

        assert_eq!(report.delivered, vec!["desk".to_string()]);
        assert!(report.failed.is_empty());
        assert!(report.broadcast);
        assert_eq!(
            h.calls().await,
            vec![Call {
                address: "10.0.0.1".to_string(),
                payload: payload(Rgb::new(9, 8, 7)),
            }]
        );

        let update = viewer.try_recv().unwrap();
        assert_eq!(
            update
                .devices
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>(),
            vec!["desk", "shelf"]
        );
    }

    #[tokio::test]
    async fn unreachable_device_does_not_block_its_siblings() {
        let h = harness(RecordingTransport {
            unreachable: BTreeSet::from(["10.0.0.66".to_string()]),
            ..Default::default()
        });
        h.add_device("bad", "10.0.0.66").await;
        h.add_device("good", "10.0.0.1").await;
        let mut viewer = h.ctx.viewers.subscribe();

        let report = propagate_once(&h.ctx, &PropagationScope::All).await;

        assert_eq!(report.delivered, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].device, "bad");
        assert_eq!(report.failed[0].address, "10.0.0.66");
        assert!(matches!(report.failed[0].error, TransportError::Connect(_)));
        assert_eq!(h.calls().await.len(), 2);
        assert!(report.broadcast);
        assert_eq!(viewer.try_recv().unwrap().devices.len(), 2);
    }

    #[tokio::test]
    async fn empty_registry_is_a_quiet_no_op() {
        let h = harness(RecordingTransport::default());
        let mut viewer = h.ctx.viewers.subscribe();
        let warnings = WarnCounter::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let report = propagate_once(&h.ctx, &PropagationScope::All).await;

        assert_eq!(report, PropagationReport::empty(PropagationScope::All));
        assert!(h.calls().await.is_empty());
        assert!(matches!(viewer.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(warnings.count(), 1);
    }

    #[tokio::test]
    async fn unknown_device_scope_sends_nothing() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let warnings = WarnCounter::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let report =
            propagate_once(&h.ctx, &PropagationScope::Device("ghost".to_string())).await;

        assert!(report.delivered.is_empty());
        assert!(!report.broadcast);
        assert!(h.calls().await.is_empty());
        assert_eq!(warnings.count(), 1);
    }

    #[tokio::test]
    async fn burst_of_requests_collapses_into_one_push_with_latest_state() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let mut viewer = h.ctx.viewers.subscribe();
        let coordinator = spawn_coordinator(h.ctx.clone(), options(150, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        for i in 1..=5u8 {
            h.set_color("desk", Rgb::new(i, i, i)).await;
            handle.request_device("desk");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            h.calls().await,
            vec![Call {
                address: "10.0.0.1".to_string(),
                payload: payload(Rgb::new(5, 5, 5)),
            }]
        );
        let updates = drain(&mut viewer);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].devices[0].color, Rgb::new(5, 5, 5));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn change_after_request_but_before_fire_is_what_gets_pushed() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(200, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        h.set_color("desk", Rgb::new(255, 0, 0)).await;
        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.set_color("desk", Rgb::new(0, 0, 255)).await;
        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(450)).await;

        let calls = h.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload, payload(Rgb::new(0, 0, 255)));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn window_reopens_after_completion() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(50, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(h.calls().await.len(), 2);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn request_during_push_triggers_one_follow_up_run() {
        let h = harness(RecordingTransport {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        h.add_device("desk", "10.0.0.1").await;
        h.set_color("desk", Rgb::new(1, 1, 1)).await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(50, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        handle.request_device("desk");
        // The first push is now in flight.
        tokio::time::sleep(Duration::from_millis(120)).await;
        h.set_color("desk", Rgb::new(2, 2, 2)).await;
        handle.request_device("desk");
        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(700)).await;

        let calls = h.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].payload, payload(Rgb::new(1, 1, 1)));
        assert_eq!(calls[1].payload, payload(Rgb::new(2, 2, 2)));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn per_device_windows_are_independent() {
        let h = harness(RecordingTransport::default());
        h.add_device("x", "10.0.0.1").await;
        h.add_device("y", "10.0.0.2").await;
        let mut viewer = h.ctx.viewers.subscribe();
        let coordinator = spawn_coordinator(h.ctx.clone(), options(100, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        handle.request_device("x");
        handle.request_device("y");
        handle.request_device("x");
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut addresses = h
            .calls()
            .await
            .into_iter()
            .map(|c| c.address)
            .collect::<Vec<_>>();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(drain(&mut viewer).len(), 2);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn global_window_serves_every_device_with_one_run() {
        let h = harness(RecordingTransport::default());
        h.add_device("x", "10.0.0.1").await;
        h.add_device("y", "10.0.0.2").await;
        let mut viewer = h.ctx.viewers.subscribe();
        let coordinator = spawn_coordinator(h.ctx.clone(), options(100, DebounceScope::Global));
        let handle = coordinator.handle();

        h.set_color("x", Rgb::new(10, 0, 0)).await;
        handle.request_device("x");
        h.set_color("y", Rgb::new(0, 20, 0)).await;
        handle.request_device("y");
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut calls = h.calls().await;
        calls.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(
            calls,
            vec![
                Call {
                    address: "10.0.0.1".to_string(),
                    payload: payload(Rgb::new(10, 0, 0)),
                },
                Call {
                    address: "10.0.0.2".to_string(),
                    payload: payload(Rgb::new(0, 20, 0)),
                },
            ]
        );
        assert_eq!(drain(&mut viewer).len(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_runs_on_cadence_and_stops_on_shutdown() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let coordinator = spawn_coordinator(
            h.ctx.clone(),
            CoordinatorOptions {
                debounce: Duration::from_millis(100),
                sweep_interval: Some(Duration::from_millis(100)),
                scope: DebounceScope::PerDevice,
            },
        );

        tokio::time::sleep(Duration::from_millis(450)).await;
        coordinator.shutdown().await;

        let after_shutdown = h.calls().await.len();
        assert!(after_shutdown >= 2, "expected sweeps, got {after_shutdown}");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.calls().await.len(), after_shutdown);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_pushes() {
        let h = harness(RecordingTransport {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        h.add_device("desk", "10.0.0.1").await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(20, DebounceScope::PerDevice));

        coordinator.handle().request_device("desk");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.calls().await.len(), 1);
        assert_eq!(*h.completed.lock().await, 0);

        coordinator.shutdown().await;
        assert_eq!(*h.completed.lock().await, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_waiting_windows() {
        let h = harness(RecordingTransport::default());
        h.add_device("desk", "10.0.0.1").await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(10_000, DebounceScope::PerDevice));

        coordinator.handle().request_device("desk");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.calls().await.is_empty());

        coordinator.shutdown().await;
        assert_eq!(h.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_runs_follow_up_for_change_made_during_push() {
        let h = harness(RecordingTransport {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        h.add_device("desk", "10.0.0.1").await;
        h.set_color("desk", Rgb::new(1, 1, 1)).await;
        let coordinator = spawn_coordinator(h.ctx.clone(), options(20, DebounceScope::PerDevice));
        let handle = coordinator.handle();

        handle.request_device("desk");
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.set_color("desk", Rgb::new(2, 2, 2)).await;
        handle.request_device("desk");
        // Let the coordinator mark the running window for a rerun.
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.shutdown().await;

        let calls = h.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].payload, payload(Rgb::new(2, 2, 2)));
        assert_eq!(*h.completed.lock().await, 2);
    }

    #[tokio::test]
    async fn shutdown_pushes_requests_still_queued() {
        for _ in 0..20 {
            let h = harness(RecordingTransport::default());
            h.add_device("desk", "10.0.0.1").await;
            let coordinator =
                spawn_coordinator(h.ctx.clone(), options(10_000, DebounceScope::PerDevice));

            coordinator.handle().request_device("desk");
            coordinator.shutdown().await;

            assert_eq!(h.calls().await.len(), 1);
        }
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_dropped() {
        let h = harness(RecordingTransport::default());
        let coordinator = spawn_coordinator(h.ctx.clone(), options(10, DebounceScope::PerDevice));
        let handle = coordinator.handle();
        coordinator.shutdown().await;

        handle.request_all();
        PropagationHandle::noop().request_device("desk");
    }

    #[test]
    fn window_check_and_set() {
        let now = Instant::now();
        let debounce = Duration::from_millis(100);
        let desk = PropagationScope::Device("desk".to_string());
        let mut windows = Windows::default();

        assert!(windows.open(desk.clone(), now, debounce));
        assert!(!windows.open(desk.clone(), now, debounce));
        assert_eq!(windows.next_due(), Some(now + debounce));
        assert!(windows.take_due(now).is_empty());

        assert_eq!(windows.take_due(now + debounce), vec![desk.clone()]);
        assert_eq!(windows.next_due(), None);
        assert!(!windows.finish(&desk, now, debounce));
        assert!(windows.by_scope.is_empty());
    }

    #[test]
    fn request_while_running_reopens_on_finish() {
        let now = Instant::now();
        let debounce = Duration::from_millis(100);
        let all = PropagationScope::All;
        let mut windows = Windows::default();

        windows.open(all.clone(), now, debounce);
        windows.take_due(now + debounce);
        assert!(!windows.open(all.clone(), now + debounce, debounce));

        let later = now + debounce * 3;
        assert!(windows.finish(&all, later, debounce));
        assert_eq!(windows.next_due(), Some(later + debounce));
    }

    #[test]
    fn global_scope_folds_every_request_into_all() {
        let desk = PropagationScope::Device("desk".to_string());
        assert_eq!(DebounceScope::Global.resolve(desk.clone()), PropagationScope::All);
        assert_eq!(DebounceScope::PerDevice.resolve(desk.clone()), desk);
        assert_eq!(desk.to_string(), "device:desk");
        assert_eq!(PropagationScope::All.to_string(), "all");
    }
}
