//! Recording stubs for the engine's external collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use vmherd_core::events::{VmEvent, VmEventType};
use vmherd_core::manifest::ManifestSnapshot;

use vmherd_engine::bus::EventBus;
use vmherd_engine::engine::{CreateVmRequest, Engine, EngineConfig};
use vmherd_engine::launcher::{ExitOutcome, Instance, LaunchSpec, Launcher};
use vmherd_engine::network::NetworkManager;
use vmherd_engine::seed::FatSeedBuilder;
use vmherd_engine::store::MemStore;

/// A fake subprocess. Exit is driven by the test (or by `stop`).
pub struct StubInstance {
    name: String,
    pid: u32,
    exit: watch::Sender<Option<ExitOutcome>>,
}

impl StubInstance {
    fn new(name: String, pid: u32) -> Self {
        let (exit, _) = watch::channel(None);
        Self { name, pid, exit }
    }

    /// Simulate a subprocess exit.
    pub fn exit(&self, outcome: ExitOutcome) {
        let _ = self.exit.send(Some(outcome));
    }
}

#[async_trait]
impl Instance for StubInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn api_socket_path(&self) -> Option<PathBuf> {
        None
    }

    async fn stop(&self, _ctx: &CancellationToken) -> Result<()> {
        self.exit(ExitOutcome::Clean);
        Ok(())
    }

    async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return ExitOutcome::Crashed("stub instance dropped".into());
            }
        }
    }
}

/// Records every launch; can be told to fail the next N launches.
#[derive(Default)]
pub struct StubLauncher {
    specs: Mutex<Vec<LaunchSpec>>,
    instances: Mutex<Vec<Arc<StubInstance>>>,
    fail_next: AtomicUsize,
    next_pid: AtomicU32,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1),
            ..Default::default()
        }
    }

    pub fn fail_next_launches(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// The most recent instance launched under `name`.
    pub fn instance_for(&self, name: &str) -> Option<Arc<StubInstance>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|i| i.name == name)
            .cloned()
    }
}

#[async_trait]
impl Launcher for StubLauncher {
    async fn launch(
        &self,
        _ctx: &CancellationToken,
        spec: &LaunchSpec,
    ) -> Result<Arc<dyn Instance>> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            bail!("launch refused (stub)");
        }
        self.specs.lock().unwrap().push(spec.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(StubInstance::new(spec.name.clone(), pid));
        self.instances.lock().unwrap().push(Arc::clone(&instance));
        Ok(instance)
    }
}

/// Counts tap operations and tracks which taps are still live.
#[derive(Default)]
pub struct StubNetwork {
    prepared: AtomicUsize,
    cleaned: AtomicUsize,
    fail_prepare: AtomicBool,
    live: Mutex<Vec<String>>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn cleaned_count(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Taps prepared but not yet cleaned up.
    pub fn live_taps(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkManager for StubNetwork {
    async fn prepare_tap(&self, vm_name: &str, _mac: &str) -> Result<String> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            bail!("tap refused (stub)");
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        let tap = format!("tap-{}", vm_name);
        self.live.lock().unwrap().push(tap.clone());
        Ok(tap)
    }

    async fn cleanup_tap(&self, tap_name: &str) -> Result<()> {
        if tap_name.is_empty() {
            return Ok(());
        }
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().retain(|t| t != tap_name);
        Ok(())
    }
}

/// Captures published events in order.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<VmEvent>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<VmEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event types published for one VM, in order.
    pub fn types_for(&self, name: &str) -> Vec<VmEventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, _topic: &str, event: &VmEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub launcher: Arc<StubLauncher>,
    pub network: Arc<StubNetwork>,
    pub bus: Arc<RecordingBus>,
}

/// Engine over stubs: subnet 192.168.127.0/24, host .1, advertise
/// 127.0.0.1:7777 (so the effective advertise host falls back to the
/// host IP).
pub async fn harness(runtime_dir: &Path) -> Harness {
    harness_with_subnet(runtime_dir, "192.168.127.0/24", "192.168.127.1").await
}

pub async fn harness_with_subnet(runtime_dir: &Path, subnet: &str, host_ip: &str) -> Harness {
    let launcher = Arc::new(StubLauncher::new());
    let network = Arc::new(StubNetwork::new());
    let bus = Arc::new(RecordingBus::new());
    let engine = Engine::with_seed_builder(
        Arc::new(MemStore::new()),
        launcher.clone(),
        network.clone(),
        bus.clone(),
        Arc::new(FatSeedBuilder),
        EngineConfig {
            subnet: subnet.parse().unwrap(),
            host_ip: host_ip.parse().unwrap(),
            api_listen_addr: "0.0.0.0:7777".into(),
            api_advertise_addr: "127.0.0.1:7777".into(),
            runtime_dir: runtime_dir.to_path_buf(),
            event_topic: String::new(),
        },
    )
    .await
    .expect("engine construction");
    Harness {
        engine,
        launcher,
        network,
        bus,
    }
}

pub fn browser_manifest() -> ManifestSnapshot {
    ManifestSnapshot {
        name: "browser".into(),
        runtime: "browser".into(),
        ..Default::default()
    }
}

pub fn browser_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        name: name.into(),
        cpu_cores: 2,
        memory_mb: 2048,
        plugin: "browser".into(),
        runtime: "browser".into(),
        manifest: Some(browser_manifest()),
        ..Default::default()
    }
}
