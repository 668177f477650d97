//! mDNS-SD (multicast DNS Service Discovery) for feed servers and DVRs.
//!
//! Feed servers advertise themselves as `_<service>._tcp.local.` (the
//! service is `cctv` by default).  The DVR keeps a browse open for that
//! type and turns every resolved peer into an HTTP base URL.  The DVR also
//! registers itself with a sequential instance name like `dvr-01`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

/// How long to scan for existing peers before claiming an instance number.
const DISCOVERY_SCAN: Duration = Duration::from_secs(3);

/// Poll interval of the browse thread (bounds shutdown latency).
const BROWSE_POLL: Duration = Duration::from_millis(500);

/// mDNS service-type string for a logical service name, e.g.
/// `cctv` → `_cctv._tcp.local.`
pub fn service_type(service: &str) -> String {
    format!("_{service}._tcp.local.")
}

// ── Candidate source ─────────────────────────────────────────────────────────

/// Anything that can list the base URLs of the servers currently providing
/// a service.  The poller calls this once per discovery round.
pub trait Discover: Send + Sync {
    fn discovered(&self) -> Vec<String>;
}

/// A fixed list of base URLs (used when mDNS is disabled).
#[derive(Debug, Clone, Default)]
pub struct StaticPeers(pub Vec<String>);

impl Discover for StaticPeers {
    fn discovered(&self) -> Vec<String> {
        self.0.clone()
    }
}

// ── Peer ─────────────────────────────────────────────────────────────────────

/// A service discovered on the network.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Instance name, e.g. `garage`.
    pub instance_name: String,
    /// All advertised IP addresses.
    pub addresses: Vec<IpAddr>,
    /// Listening port.
    pub port: u16,
}

impl Peer {
    /// Build an HTTP base URL for this peer, preferring IPv4 and skipping
    /// loopback addresses when another one is available.
    pub fn http_url(&self) -> Option<String> {
        let addrs = self.non_loopback_addresses();
        let addr = addrs.first().or_else(|| self.addresses.first())?;

        Some(match addr {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.port),
        })
    }

    /// All advertised addresses as non-loopback, preferring IPv4.
    pub fn non_loopback_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self
            .addresses
            .iter()
            .filter(|a| !a.is_loopback())
            .copied()
            .collect();
        addrs.sort_by_key(|a| !a.is_ipv4()); // IPv4 first
        addrs
    }
}

// ── Browser ──────────────────────────────────────────────────────────────────

/// A long-running browse for one service type.  Resolved peers are added,
/// removed peers are dropped; [`Discover::discovered`] returns a snapshot.
pub struct PeerBrowser {
    peers: Arc<Mutex<BTreeMap<String, Peer>>>,
    fixed: Vec<String>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PeerBrowser {
    /// Ask the browse thread to stop.  It exits within one poll interval.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for PeerBrowser {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Discover for PeerBrowser {
    fn discovered(&self) -> Vec<String> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut urls: Vec<String> = peers.values().filter_map(Peer::http_url).collect();
        for url in &self.fixed {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

// ── Discovery handle ─────────────────────────────────────────────────────────

/// Handle returned by [`register`].  Keeps the mDNS daemon alive and
/// provides methods to discover other peers.
pub struct DiscoveryHandle {
    daemon: ServiceDaemon,
    instance_name: String,
    fullname: String,
}

impl DiscoveryHandle {
    /// Our assigned instance name, e.g. `dvr-01`.
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Start browsing for servers providing `service`.  `fixed` URLs are
    /// always part of the result, whether mDNS finds them or not.
    pub fn browse(&self, service: &str, fixed: Vec<String>) -> Result<PeerBrowser> {
        let ty = service_type(service);
        let receiver = self
            .daemon
            .browse(&ty)
            .with_context(|| format!("Cannot browse mDNS for {ty}"))?;

        let peers: Arc<Mutex<BTreeMap<String, Peer>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let peers = peers.clone();
            let stop = stop.clone();
            let daemon = self.daemon.clone();
            let own = self.fullname.clone();
            std::thread::Builder::new()
                .name("mdns-browse".into())
                .spawn(move || {
                    debug!("mDNS: browsing for {ty}");
                    while !stop.load(Ordering::Relaxed) {
                        let event = match receiver.recv_timeout(BROWSE_POLL) {
                            Ok(event) => event,
                            Err(_) => continue,
                        };
                        let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
                        match event {
                            ServiceEvent::ServiceResolved(info) => {
                                let name = info.get_fullname().to_string();
                                if name == own {
                                    continue;
                                }
                                let addrs: Vec<IpAddr> =
                                    info.get_addresses().iter().map(|a| a.to_ip_addr()).collect();
                                let port = info.get_port();
                                if !peers.contains_key(&name) {
                                    info!("mDNS: discovered peer {} at {:?}:{}", name, addrs, port);
                                }
                                peers.insert(
                                    name.clone(),
                                    Peer {
                                        instance_name: extract_instance_name(&name),
                                        addresses: addrs,
                                        port,
                                    },
                                );
                            }
                            ServiceEvent::ServiceRemoved(_, name) => {
                                if peers.remove(&name).is_some() {
                                    info!("mDNS: peer {name} went away");
                                }
                            }
                            event => debug!("mDNS: event {}", format_event(&event)),
                        }
                    }
                    let _ = daemon.stop_browse(&ty);
                })
                .context("Cannot spawn mDNS browse thread")?
        };

        Ok(PeerBrowser {
            peers,
            fixed,
            stop,
            thread: Some(thread),
        })
    }

    /// Unregister from mDNS and shut down the daemon.
    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Register this node on the local network via mDNS.
///
/// The function scans for existing instances of the same service, picks
/// the next available sequential number, and registers an instance like
/// `dvr-01`.
pub fn register(service: &str, port: u16) -> Result<DiscoveryHandle> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;
    let ty = service_type(service);

    // ── scan for existing instances of the same service ─────────────
    let receiver = daemon.browse(&ty).context("Cannot browse mDNS")?;

    let mut existing: BTreeSet<u32> = BTreeSet::new();
    let deadline = Instant::now() + DISCOVERY_SCAN;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(n) = parse_instance_number(info.get_fullname(), service) {
                    debug!("Found existing {} instance #{}", service, n);
                    existing.insert(n);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(&ty);

    // ── pick next sequential number ─────────────────────────────────
    let our_number = next_available(&existing);
    let instance_name = format!("{}-{:02}", service, our_number);
    let host = format!("{}.local.", instance_name);

    let service_info = ServiceInfo::new(
        &ty,
        &instance_name,
        &host,
        "", // auto-detect addresses
        port,
        None,
    )
    .context("Cannot create mDNS ServiceInfo")?
    .enable_addr_auto();

    let fullname = service_info.get_fullname().to_string();

    daemon
        .register(service_info)
        .context("Cannot register mDNS service")?;

    info!(
        "Registered on mDNS as '{}' (type={}, port={})",
        instance_name, ty, port
    );

    Ok(DiscoveryHandle {
        daemon,
        instance_name,
        fullname,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Format a ServiceEvent for debug logging (without dumping the full struct).
fn format_event(event: &ServiceEvent) -> String {
    match event {
        ServiceEvent::ServiceFound(ty, name) => format!("Found({ty}, {name})"),
        ServiceEvent::ServiceResolved(info) => format!("Resolved({})", info.get_fullname()),
        ServiceEvent::ServiceRemoved(ty, name) => format!("Removed({ty}, {name})"),
        ServiceEvent::SearchStarted(ty) => format!("SearchStarted({ty})"),
        ServiceEvent::SearchStopped(ty) => format!("SearchStopped({ty})"),
        _ => "Other".to_string(),
    }
}

/// Extract the instance number from a fullname like
/// `dvr-03._dvr._tcp.local.`
fn parse_instance_number(fullname: &str, prefix: &str) -> Option<u32> {
    let instance = fullname.split('.').next()?;
    let suffix = instance.strip_prefix(prefix)?.strip_prefix('-')?;
    suffix.parse().ok()
}

/// Extract the short instance name from a fullname like
/// `garage._cctv._tcp.local.`
fn extract_instance_name(fullname: &str) -> String {
    fullname
        .split('.')
        .next()
        .unwrap_or(fullname)
        .to_string()
}

/// Return the smallest positive integer not in `used`.
fn next_available(used: &BTreeSet<u32>) -> u32 {
    let mut n = 1;
    while used.contains(&n) {
        n += 1;
    }
    n
}
