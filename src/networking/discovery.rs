use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::interface;
use crate::config::ShareConfig;

// mDNS labels are limited to 63 bytes; leave room for prefix and suffix
const MAX_DEVICE_NAME_LEN: usize = 40;

/// A peer offering our service type, resolved to an address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PeerRecord {
    /// `host:port`, bracketing IPv6 hosts
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Events delivered to the discovery observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A new peer resolved; never repeated for the same (name, host, port)
    PeerFound(PeerRecord),
    /// Every peer entry carrying this name is gone
    PeerLost { name: String },
    /// Our own advertisement could not be published
    RegistrationFailed { name: String, message: String },
}

/// Observer for discovery events.
///
/// Called with the manager's state lock held, so it must return quickly and
/// must not call back into the manager.
pub type DiscoveryCallback = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

/// A service record we want published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub instance_name: String,
    pub device_name: String,
    pub port: u16,
}

/// Raw browse output from a backend, before filtering and de-duplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Found { name: String },
    Resolved { name: String, addresses: Vec<IpAddr>, port: u16 },
    ResolveFailed { name: String, reason: String },
    Lost { name: String },
}

/// The network's announce/browse/resolve primitives
pub trait ServiceBackend: Send + Sync {
    fn register(&self, registration: &ServiceRegistration) -> Result<()>;
    fn unregister(&self, instance_name: &str) -> Result<()>;
    /// Start browsing; called inside the manager's runtime context
    fn browse(&self) -> Result<mpsc::UnboundedReceiver<BackendEvent>>;
    fn stop_browse(&self) -> Result<()>;
    fn shutdown(&self) -> Result<()>;
}

/// Multicast DNS backend built on `mdns-sd`
pub struct MdnsBackend {
    mdns: ServiceDaemon,
    service_type: String,
    // instance name -> fullname, needed to unregister
    registered: Mutex<HashMap<String, String>>,
}

impl MdnsBackend {
    pub fn new(service_type: &str) -> Result<Self> {
        let mdns = ServiceDaemon::new()?;
        Ok(Self {
            mdns,
            service_type: service_type.to_string(),
            registered: Mutex::new(HashMap::new()),
        })
    }
}

impl ServiceBackend for MdnsBackend {
    fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let ip_addr = interface::advertise_address()?.to_string();
        let hostname = format!("{}.local.", host_label(&registration.instance_name));

        let mut properties = HashMap::new();
        properties.insert("device".to_string(), registration.device_name.clone());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service_info = ServiceInfo::new(
            &self.service_type,
            &registration.instance_name,
            &hostname,
            &ip_addr,
            registration.port,
            properties,
        )?;
        let fullname = service_info.get_fullname().to_string();

        self.mdns.register(service_info)?;
        info!(
            "Registered service {} on {} port {}",
            fullname, ip_addr, registration.port
        );

        lock(&self.registered).insert(registration.instance_name.clone(), fullname);
        Ok(())
    }

    fn unregister(&self, instance_name: &str) -> Result<()> {
        let fullname = lock(&self.registered)
            .remove(instance_name)
            .ok_or_else(|| anyhow!("Service {} is not registered", instance_name))?;
        match self.mdns.unregister(&fullname) {
            Ok(_) => {
                debug!("Unregistered service {}", fullname);
                Ok(())
            }
            Err(e) => Err(anyhow!("Failed to unregister {}: {}", fullname, e)),
        }
    }

    fn browse(&self) -> Result<mpsc::UnboundedReceiver<BackendEvent>> {
        let receiver = self.mdns.browse(&self.service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let service_type = self.service_type.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                let mapped = match event {
                    ServiceEvent::ServiceFound(_, fullname) => BackendEvent::Found {
                        name: instance_from_fullname(&fullname, &service_type),
                    },
                    ServiceEvent::ServiceResolved(info) => {
                        let name = instance_from_fullname(info.get_fullname(), &service_type);
                        let addresses: Vec<IpAddr> = info
                            .get_addresses()
                            .iter()
                            .map(|ip| IpAddr::from(*ip))
                            .collect();
                        if addresses.is_empty() {
                            BackendEvent::ResolveFailed {
                                name,
                                reason: "record has no address".to_string(),
                            }
                        } else {
                            BackendEvent::Resolved {
                                name,
                                addresses,
                                port: info.get_port(),
                            }
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => BackendEvent::Lost {
                        name: instance_from_fullname(&fullname, &service_type),
                    },
                    other => {
                        debug!("Ignoring mDNS event: {:?}", other);
                        continue;
                    }
                };

                if tx.send(mapped).is_err() {
                    break;
                }
            }
            debug!("mDNS browse channel closed");
        });

        Ok(rx)
    }

    fn stop_browse(&self) -> Result<()> {
        self.mdns
            .stop_browse(&self.service_type)
            .map_err(|e| anyhow!("Failed to stop browsing {}: {}", self.service_type, e))
    }

    fn shutdown(&self) -> Result<()> {
        let names: Vec<String> = lock(&self.registered).keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unregister(&name) {
                warn!("{}", e);
            }
        }
        if let Err(e) = self.mdns.shutdown() {
            return Err(anyhow!("Failed to shut down mDNS daemon: {}", e));
        }
        Ok(())
    }
}

/// `"Name._fileshare._tcp.local."` -> `"Name"`
fn instance_from_fullname(fullname: &str, service_type: &str) -> String {
    match fullname.strip_suffix(service_type) {
        Some(instance) => instance.trim_end_matches('.').to_string(),
        None => fullname.split('.').next().unwrap_or(fullname).to_string(),
    }
}

fn host_label(instance_name: &str) -> String {
    instance_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct DiscoveryState {
    advertised: Vec<String>,
    browse_task: Option<JoinHandle<()>>,
    // bumped on every start/stop so a stale browse loop cannot emit
    browse_generation: u64,
    known: Vec<PeerRecord>,
    torn_down: bool,
}

struct Shared {
    state: Mutex<DiscoveryState>,
    observer: DiscoveryCallback,
    instance_prefix: String,
}

impl Shared {
    fn is_own(&self, name: &str) -> bool {
        name.starts_with(&self.instance_prefix)
    }

    fn handle_event(&self, generation: u64, event: BackendEvent) {
        let mut state = lock(&self.state);
        if state.torn_down || state.browse_generation != generation || state.browse_task.is_none() {
            debug!("Dropping event from inactive browse: {:?}", event);
            return;
        }

        match event {
            BackendEvent::Found { name } => {
                debug!("Service found: {}", name);
            }
            BackendEvent::ResolveFailed { name, reason } => {
                warn!("Service resolution failed - {}: {}", name, reason);
            }
            BackendEvent::Resolved { name, addresses, port } => {
                if self.is_own(&name) {
                    debug!("Skipping own service: {}", name);
                    return;
                }
                let host = match preferred_address(&addresses) {
                    Some(ip) => ip.to_string(),
                    None => {
                        warn!("Resolved service has no host address - {}", name);
                        return;
                    }
                };

                let record = PeerRecord { name, host, port };
                if state.known.contains(&record) {
                    debug!("Peer already known: {} ({})", record.name, record.address());
                    return;
                }

                // A newer resolve on the same host supersedes the old entry
                if let Some(stale) = state.known.iter().find(|p| p.host == record.host).cloned() {
                    state.known.retain(|p| p.name != stale.name);
                    info!(
                        "Peer {} on {} superseded by {}",
                        stale.name, stale.host, record.name
                    );
                    (self.observer)(DiscoveryEvent::PeerLost { name: stale.name });
                }

                info!("✅ Discovered peer: {} ({})", record.name, record.address());
                state.known.push(record.clone());
                (self.observer)(DiscoveryEvent::PeerFound(record));
            }
            BackendEvent::Lost { name } => {
                if self.is_own(&name) {
                    return;
                }
                state.known.retain(|p| p.name != name);
                info!("👋 Peer lost: {}", name);
                (self.observer)(DiscoveryEvent::PeerLost { name });
            }
        }
    }
}

/// Lowest IPv4 address if any, so repeated resolves pick the same host
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .filter(|ip| ip.is_ipv4())
        .min()
        .or_else(|| addresses.iter().min())
        .copied()
}

/// Advertises this device and reports peers offering the same service.
///
/// Advertising and browsing are independent; `tear_down` ends both and the
/// instance cannot be restarted afterwards.
pub struct PeerDiscovery {
    backend: Arc<dyn ServiceBackend>,
    device_name: String,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl PeerDiscovery {
    /// Create a discovery manager backed by mDNS.
    ///
    /// Must be called from within a tokio runtime; background work is
    /// spawned onto that runtime.
    pub fn new(config: &ShareConfig, observer: DiscoveryCallback) -> Result<Self> {
        let backend = MdnsBackend::new(&config.service_type)?;
        info!("Initializing peer discovery for {}", config.service_type);
        Self::with_backend(
            Arc::new(backend),
            &config.instance_prefix,
            &config.device_name,
            observer,
        )
    }

    /// Create a discovery manager on an arbitrary backend
    pub fn with_backend(
        backend: Arc<dyn ServiceBackend>,
        instance_prefix: &str,
        device_name: &str,
        observer: DiscoveryCallback,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("Peer discovery needs a tokio runtime: {}", e))?;

        Ok(Self {
            backend,
            device_name: truncate(device_name, MAX_DEVICE_NAME_LEN),
            runtime,
            shared: Arc::new(Shared {
                state: Mutex::new(DiscoveryState::default()),
                observer,
                instance_prefix: instance_prefix.to_string(),
            }),
        })
    }

    /// Publish a new service record for `port`.
    ///
    /// Every call registers another record. Failures are delivered as
    /// `RegistrationFailed` rather than returned.
    pub fn advertise(&self, port: u16) {
        let mut state = lock(&self.shared.state);
        if state.torn_down {
            warn!("Ignoring advertise after tear down");
            return;
        }

        let registration = ServiceRegistration {
            instance_name: self.new_instance_name(),
            device_name: self.device_name.clone(),
            port,
        };
        info!(
            "Registering service {} on port {}",
            registration.instance_name, port
        );

        match self.backend.register(&registration) {
            Ok(()) => {
                info!("Service registered - {}", registration.instance_name);
                state.advertised.push(registration.instance_name);
            }
            Err(e) => {
                error!(
                    "Service registration failed - {}: {:#}",
                    registration.instance_name, e
                );
                (self.shared.observer)(DiscoveryEvent::RegistrationFailed {
                    name: registration.instance_name,
                    message: format!("{:#}", e),
                });
            }
        }
    }

    /// Start reporting peers; a no-op if already browsing
    pub fn start_browsing(&self) {
        let mut state = lock(&self.shared.state);
        if state.torn_down {
            warn!("Ignoring start_browsing after tear down");
            return;
        }
        if state.browse_task.is_some() {
            debug!("Already browsing");
            return;
        }

        let receiver = {
            let _guard = self.runtime.enter();
            self.backend.browse()
        };
        let mut receiver = match receiver {
            Ok(rx) => rx,
            Err(e) => {
                error!("Start discovery failed: {:#}", e);
                return;
            }
        };

        state.browse_generation += 1;
        let generation = state.browse_generation;
        let shared = self.shared.clone();
        state.browse_task = Some(self.runtime.spawn(async move {
            while let Some(event) = receiver.recv().await {
                shared.handle_event(generation, event);
            }
            debug!("Browse loop {} finished", generation);
        }));
        info!("Discovery started");
    }

    /// Stop reporting peers; a no-op when not browsing
    pub fn stop_browsing(&self) {
        let mut state = lock(&self.shared.state);
        self.stop_browsing_locked(&mut state);
    }

    fn stop_browsing_locked(&self, state: &mut DiscoveryState) {
        let Some(task) = state.browse_task.take() else {
            debug!("stop_browsing called while not browsing");
            return;
        };
        state.browse_generation += 1;
        if let Err(e) = self.backend.stop_browse() {
            warn!("Stop discovery failed: {:#}", e);
        }
        task.abort();
        info!("Discovery stopped");
    }

    /// Withdraw every advertisement, stop browsing and release the backend.
    ///
    /// Safe to call repeatedly and from any thread. No events are delivered
    /// once this returns.
    pub fn tear_down(&self) {
        let mut state = lock(&self.shared.state);
        if state.torn_down {
            debug!("Discovery already torn down");
            return;
        }
        state.torn_down = true;

        for name in std::mem::take(&mut state.advertised) {
            match self.backend.unregister(&name) {
                Ok(()) => debug!("Service unregistered - {}", name),
                Err(e) => warn!("Service unregistration failed - {}: {:#}", name, e),
            }
        }
        self.stop_browsing_locked(&mut state);
        state.known.clear();
        drop(state);

        if let Err(e) = self.backend.shutdown() {
            warn!("{:#}", e);
        }
        info!("Peer discovery torn down");
    }

    pub fn is_advertising(&self) -> bool {
        !lock(&self.shared.state).advertised.is_empty()
    }

    pub fn is_browsing(&self) -> bool {
        lock(&self.shared.state).browse_task.is_some()
    }

    /// Instance names currently published by this manager
    pub fn advertised_names(&self) -> Vec<String> {
        lock(&self.shared.state).advertised.clone()
    }

    /// Snapshot of the de-duplicated peers seen so far
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        lock(&self.shared.state).known.clone()
    }

    fn new_instance_name(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}{}-{}",
            self.shared.instance_prefix,
            self.device_name,
            &suffix[..8]
        )
    }
}

impl Drop for PeerDiscovery {
    fn drop(&mut self) {
        self.tear_down();
    }
}

fn truncate(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let mut end = max_len;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PREFIX: &str = "LanShare-";

    #[derive(Default)]
    struct FakeBackend {
        registered: Mutex<Vec<ServiceRegistration>>,
        unregistered: Mutex<Vec<String>>,
        sender: Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
        stop_calls: AtomicUsize,
        shutdown_calls: AtomicUsize,
        fail_register: bool,
    }

    impl FakeBackend {
        fn failing() -> Self {
            Self {
                fail_register: true,
                ..Self::default()
            }
        }

        fn push(&self, event: BackendEvent) {
            if let Some(tx) = lock(&self.sender).as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    impl ServiceBackend for FakeBackend {
        fn register(&self, registration: &ServiceRegistration) -> Result<()> {
            if self.fail_register {
                return Err(anyhow!("permission denied"));
            }
            lock(&self.registered).push(registration.clone());
            Ok(())
        }

        fn unregister(&self, instance_name: &str) -> Result<()> {
            lock(&self.unregistered).push(instance_name.to_string());
            Ok(())
        }

        fn browse(&self) -> Result<mpsc::UnboundedReceiver<BackendEvent>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *lock(&self.sender) = Some(tx);
            Ok(rx)
        }

        fn stop_browse(&self) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.sender).take();
            Ok(())
        }

        fn shutdown(&self) -> Result<()> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type Events = Arc<Mutex<Vec<DiscoveryEvent>>>;

    fn setup(backend: FakeBackend) -> (Arc<FakeBackend>, PeerDiscovery, Events) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(backend);
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let discovery = PeerDiscovery::with_backend(
            backend.clone(),
            PREFIX,
            "laptop",
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        )
        .unwrap();
        (backend, discovery, events)
    }

    fn resolved(name: &str, ip: [u8; 4], port: u16) -> BackendEvent {
        BackendEvent::Resolved {
            name: name.to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::from(ip))],
            port,
        }
    }

    fn peer(name: &str, host: &str, port: u16) -> PeerRecord {
        PeerRecord {
            name: name.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// Push a marker record and wait until it is delivered, so everything
    /// pushed before it has been processed.
    async fn settle(backend: &FakeBackend, events: &Events) -> Vec<DiscoveryEvent> {
        let marker = peer("marker", "10.255.255.254", 1);
        backend.push(resolved("marker", [10, 255, 255, 254], 1));
        for _ in 0..500 {
            {
                let mut current = events.lock().unwrap();
                if let Some(pos) = current
                    .iter()
                    .position(|e| *e == DiscoveryEvent::PeerFound(marker.clone()))
                {
                    current.remove(pos);
                    return current.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("marker never delivered: {:?}", events.lock().unwrap());
    }

    #[tokio::test]
    async fn test_advertise_uses_marked_unique_names() {
        let (backend, discovery, events) = setup(FakeBackend::default());

        discovery.advertise(8080);
        discovery.advertise(8080);

        let registered = lock(&backend.registered).clone();
        assert_eq!(registered.len(), 2);
        assert!(registered.iter().all(|r| r.instance_name.starts_with("LanShare-laptop-")));
        assert!(registered.iter().all(|r| r.port == 8080));
        assert_ne!(registered[0].instance_name, registered[1].instance_name);
        assert!(discovery.is_advertising());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure_is_signalled() {
        let (_backend, discovery, events) = setup(FakeBackend::failing());

        discovery.advertise(8080);

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DiscoveryEvent::RegistrationFailed { name, message } => {
                assert!(name.starts_with(PREFIX));
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!discovery.is_advertising());
    }

    #[tokio::test]
    async fn test_duplicate_resolve_reported_once() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(BackendEvent::Found { name: "Desk".to_string() });
        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));
        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));

        let delivered = settle(&backend, &events).await;
        assert_eq!(
            delivered,
            vec![DiscoveryEvent::PeerFound(peer("Desk", "192.168.1.10", 8080))]
        );
        assert!(discovery.known_peers().contains(&peer("Desk", "192.168.1.10", 8080)));
    }

    #[tokio::test]
    async fn test_own_records_are_filtered() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(resolved("LanShare-laptop-1a2b3c4d", [192, 168, 1, 5], 8080));
        backend.push(resolved("LanShare-phone-99999999", [192, 168, 1, 6], 8080));
        backend.push(BackendEvent::Lost {
            name: "LanShare-phone-99999999".to_string(),
        });

        let delivered = settle(&backend, &events).await;
        assert!(delivered.is_empty(), "own records leaked: {:?}", delivered);
    }

    #[tokio::test]
    async fn test_resolve_failures_are_dropped() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(BackendEvent::ResolveFailed {
            name: "Broken".to_string(),
            reason: "timeout".to_string(),
        });
        backend.push(BackendEvent::Resolved {
            name: "NoAddress".to_string(),
            addresses: vec![],
            port: 8080,
        });
        backend.push(resolved("Fine", [192, 168, 1, 20], 8080));

        let delivered = settle(&backend, &events).await;
        assert_eq!(
            delivered,
            vec![DiscoveryEvent::PeerFound(peer("Fine", "192.168.1.20", 8080))]
        );
    }

    #[tokio::test]
    async fn test_lost_removes_by_name() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));
        backend.push(BackendEvent::Lost { name: "Desk".to_string() });
        // Seen again after being lost: reported again
        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));

        let delivered = settle(&backend, &events).await;
        assert_eq!(
            delivered,
            vec![
                DiscoveryEvent::PeerFound(peer("Desk", "192.168.1.10", 8080)),
                DiscoveryEvent::PeerLost { name: "Desk".to_string() },
                DiscoveryEvent::PeerFound(peer("Desk", "192.168.1.10", 8080)),
            ]
        );
    }

    #[tokio::test]
    async fn test_newer_resolve_on_same_host_supersedes() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));
        backend.push(resolved("Desk (2)", [192, 168, 1, 10], 9090));

        let delivered = settle(&backend, &events).await;
        assert_eq!(
            delivered,
            vec![
                DiscoveryEvent::PeerFound(peer("Desk", "192.168.1.10", 8080)),
                DiscoveryEvent::PeerLost { name: "Desk".to_string() },
                DiscoveryEvent::PeerFound(peer("Desk (2)", "192.168.1.10", 9090)),
            ]
        );
        let known: Vec<_> = discovery
            .known_peers()
            .into_iter()
            .filter(|p| p.name != "marker")
            .collect();
        assert_eq!(known, vec![peer("Desk (2)", "192.168.1.10", 9090)]);
    }

    #[tokio::test]
    async fn test_prefers_ipv4_address() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.start_browsing();

        backend.push(BackendEvent::Resolved {
            name: "Dual".to_string(),
            addresses: vec![
                "fe80::1".parse().unwrap(),
                "192.168.1.30".parse().unwrap(),
            ],
            port: 8080,
        });

        let delivered = settle(&backend, &events).await;
        assert_eq!(
            delivered,
            vec![DiscoveryEvent::PeerFound(peer("Dual", "192.168.1.30", 8080))]
        );
    }

    #[tokio::test]
    async fn test_stop_browsing_is_idempotent() {
        let (backend, discovery, _events) = setup(FakeBackend::default());

        discovery.stop_browsing();
        assert_eq!(backend.stop_calls.load(Ordering::SeqCst), 0);

        discovery.start_browsing();
        assert!(discovery.is_browsing());
        discovery.stop_browsing();
        discovery.stop_browsing();
        assert!(!discovery.is_browsing());
        assert_eq!(backend.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tear_down_twice_and_from_another_thread() {
        let (backend, discovery, events) = setup(FakeBackend::default());
        discovery.advertise(8080);
        discovery.start_browsing();
        backend.push(resolved("Desk", [192, 168, 1, 10], 8080));
        let _ = settle(&backend, &events).await;

        // Keep a sender alive past tear down to prove late events are dropped
        let late_sender = lock(&backend.sender).clone();

        let discovery = Arc::new(discovery);
        let remote = discovery.clone();
        std::thread::spawn(move || remote.tear_down())
            .join()
            .expect("tear down panicked");
        discovery.tear_down();

        let before = events.lock().unwrap().len();
        if let Some(tx) = late_sender {
            let _ = tx.send(resolved("Late", [192, 168, 1, 99], 8080));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.lock().unwrap().len(), before);

        assert_eq!(lock(&backend.unregistered).len(), 1);
        assert_eq!(backend.shutdown_calls.load(Ordering::SeqCst), 1);
        assert!(!discovery.is_browsing());
        assert!(!discovery.is_advertising());
        assert!(discovery.known_peers().is_empty());

        // Terminal: later calls are ignored
        discovery.advertise(8080);
        discovery.start_browsing();
        assert_eq!(lock(&backend.registered).len(), 1);
        assert!(!discovery.is_browsing());
    }

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("Desk._fileshare._tcp.local.", "_fileshare._tcp.local."),
            "Desk"
        );
        assert_eq!(
            instance_from_fullname("My.Laptop._fileshare._tcp.local.", "_fileshare._tcp.local."),
            "My.Laptop"
        );
        assert_eq!(
            instance_from_fullname("Other._x._tcp.local.", "_fileshare._tcp.local."),
            "Other"
        );
    }

    #[test]
    fn test_peer_address_formatting() {
        assert_eq!(peer("a", "192.168.1.2", 80).address(), "192.168.1.2:80");
        assert_eq!(peer("a", "fe80::1", 80).address(), "[fe80::1]:80");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 40), "short");
        let long = "é".repeat(30);
        let cut = truncate(&long, 41);
        assert!(cut.len() <= 41);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
