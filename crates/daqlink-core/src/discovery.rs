//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Peer discovery and the start-up readiness latch.
//!
//! A device announces itself by multicasting a small JSON beacon at a fixed
//! interval. The database middleman (and any listening peer) learns about the
//! device from those beacons. The first successful announce, or the first
//! beacon heard from a peer, trips the [`ReadinessLatch`] that
//! [`DaqInterface::init`](crate::DaqInterface::init) waits on.
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use daqlink_common::config::DiscoveryConfig;
use daqlink_common::time::unix_millis;
use daqlink_msg::{DaqError, MessagingContext, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STOP_POLL: Duration = Duration::from_millis(50);
const MAX_BEACON_BYTES: usize = 2048;

/// One-shot readiness signal with a bounded wait.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ReadinessLatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the latch as satisfied and wake every waiter. Idempotent.
    pub fn set(&self) {
        let (flag, signal) = &*self.inner;
        let mut ready = flag.lock();
        if !*ready {
            *ready = true;
            signal.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the latch is set or `timeout` elapses. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut ready = flag.lock();
        while !*ready {
            if signal.wait_until(&mut ready, deadline).timed_out() {
                break;
            }
        }
        *ready
    }
}

/// Beacon multicast by announcing devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub uuid: Uuid,
    pub name: String,
    pub service_port: u16,
    pub sent_at: i64,
}

/// A peer seen by a listening discovery instance.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub beacon: Beacon,
    pub source: SocketAddr,
    pub last_seen: Instant,
}

/// Discovery collaborator owned by the interface.
pub trait PeerDiscovery: Send + Sync {
    /// Latch tripped by the first discovery handshake.
    fn readiness(&self) -> ReadinessLatch;

    /// Peers currently in the cache. Announce-only implementations return nothing.
    fn peers(&self) -> Vec<PeerRecord> {
        Vec::new()
    }

    /// Stop background work. Called once from the interface's drop.
    fn shutdown(&mut self);
}

/// Multicast beacon announcer and optional listener.
pub struct MulticastDiscovery {
    latch: ReadinessLatch,
    peers: Arc<Mutex<HashMap<Uuid, PeerRecord>>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl MulticastDiscovery {
    /// Validate the configuration and start the announce and listen threads it enables.
    pub fn start(
        config: &DiscoveryConfig,
        context: Arc<MessagingContext>,
        identity: Uuid,
        name: &str,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| DaqError::Validation(err.to_string()))?;
        let latch = ReadinessLatch::new();
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        if config.announce {
            let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
            socket.set_multicast_ttl_v4(config.ttl)?;
            let announcer = Announcer {
                socket,
                target: config.multicast_target(),
                interval: config.interval,
                beacon: Beacon {
                    uuid: identity,
                    name: name.to_owned(),
                    service_port: config.service_port,
                    sent_at: 0,
                },
                latch: latch.clone(),
                stop: Arc::clone(&stop),
                context: Arc::clone(&context),
            };
            workers.push(
                thread::Builder::new()
                    .name("daqlink-announce".into())
                    .spawn(move || announcer.run())?,
            );
        }

        if config.listen {
            let socket = UdpSocket::bind(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                config.multicast_port,
            )))?;
            socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
            socket.set_read_timeout(Some(STOP_POLL))?;
            let listener = Listener {
                socket,
                identity,
                cache: config.cache,
                peers: Arc::clone(&peers),
                latch: latch.clone(),
                stop: Arc::clone(&stop),
                context,
            };
            workers.push(
                thread::Builder::new()
                    .name("daqlink-discover".into())
                    .spawn(move || listener.run())?,
            );
        }

        info!(
            %identity,
            name,
            announce = config.announce,
            listen = config.listen,
            group = %config.multicast_target(),
            "peer discovery started"
        );
        Ok(Self {
            latch,
            peers,
            stop,
            workers,
        })
    }
}

impl PeerDiscovery for MulticastDiscovery {
    fn readiness(&self) -> ReadinessLatch {
        self.latch.clone()
    }

    fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().values().cloned().collect()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("discovery worker panicked");
            }
        }
        debug!("peer discovery stopped");
    }
}

impl Drop for MulticastDiscovery {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    beacon: Beacon,
    latch: ReadinessLatch,
    stop: Arc<AtomicBool>,
    context: Arc<MessagingContext>,
}

impl Announcer {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.context.is_terminated()
    }

    fn run(mut self) {
        while !self.stopped() {
            self.beacon.sent_at = unix_millis();
            match serde_json::to_vec(&self.beacon) {
                Ok(bytes) => match self.socket.send_to(&bytes, self.target) {
                    Ok(_) => self.latch.set(),
                    Err(err) => warn!(target = %self.target, error = %err, "beacon send failed"),
                },
                Err(err) => warn!(error = %err, "beacon encode failed"),
            }
            let wake = Instant::now() + self.interval;
            while !self.stopped() && Instant::now() < wake {
                thread::sleep(STOP_POLL.min(wake.saturating_duration_since(Instant::now())));
            }
        }
    }
}

struct Listener {
    socket: UdpSocket,
    identity: Uuid,
    cache: Duration,
    peers: Arc<Mutex<HashMap<Uuid, PeerRecord>>>,
    latch: ReadinessLatch,
    stop: Arc<AtomicBool>,
    context: Arc<MessagingContext>,
}

impl Listener {
    fn run(self) {
        let mut buffer = [0u8; MAX_BEACON_BYTES];
        while !self.stop.load(Ordering::SeqCst) && !self.context.is_terminated() {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, source)) => self.observe(&buffer[..len], source),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => {
                    warn!(error = %err, "discovery receive failed");
                    thread::sleep(STOP_POLL);
                }
            }
            expire_peers(&self.peers, self.cache, Instant::now());
        }
    }

    fn observe(&self, bytes: &[u8], source: SocketAddr) {
        let beacon: Beacon = match serde_json::from_slice(bytes) {
            Ok(beacon) => beacon,
            Err(err) => {
                debug!(%source, error = %err, "ignoring malformed beacon");
                return;
            }
        };
        if beacon.uuid == self.identity {
            return;
        }
        let mut peers = self.peers.lock();
        if !peers.contains_key(&beacon.uuid) {
            info!(peer = %beacon.name, uuid = %beacon.uuid, %source, "peer discovered");
        }
        peers.insert(
            beacon.uuid,
            PeerRecord {
                beacon,
                source,
                last_seen: Instant::now(),
            },
        );
        self.latch.set();
    }
}

fn expire_peers(peers: &Mutex<HashMap<Uuid, PeerRecord>>, cache: Duration, now: Instant) {
    peers.lock().retain(|uuid, peer| {
        let fresh = now.saturating_duration_since(peer.last_seen) <= cache;
        if !fresh {
            debug!(%uuid, name = %peer.beacon.name, "peer expired");
        }
        fresh
    });
}
