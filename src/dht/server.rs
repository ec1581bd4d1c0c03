use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::error::DhtError;
use super::{Dht, ListenerId};
use crate::clock::SystemClock;
use crate::config::DhtConfig;
use crate::peer::{Endpoint, PeerInfo, ServicePath};
use crate::send::{select_candidates, SendOptions, SendStats, Transport};
use crate::task::{
    BroadcastEvent, BroadcastResult, Completion, FindPeerResult, GetValueResult, HandshakeResult,
    SaveValueResult,
};

/// How often the server loop polls the DHT for due work.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const MAX_DATAGRAM: usize = 65535;

/// A [`Transport`] over a tokio UDP socket. Sends never wait: a datagram the
/// socket cannot take right now is dropped and left to the resend logic.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, dests: &[Endpoint], data: &[u8], opts: &SendOptions) -> io::Result<()> {
        let mut sent = false;
        let mut last_err = None;
        for ep in select_candidates(dests, opts) {
            match self.socket.try_send_to(data, ep.addr) {
                Ok(_) => sent = true,
                Err(e) => last_err = Some(e),
            }
        }
        if sent {
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no udp endpoint")
        }))
    }
}

type Job = Box<dyn FnOnce(&mut Dht) + Send>;

/// Counters published by the server loop after every event.
#[derive(Debug, Clone, Default)]
pub struct DhtSnapshot {
    pub peer_count: usize,
    pub task_count: usize,
    pub service_count: usize,
    pub stats: SendStats,
}

/// Runs a [`Dht`] on a UDP socket.
///
/// The DHT itself is single-threaded; [`DhtHandle`]s talk to it through a
/// job queue drained by [`run`](Self::run).
pub struct DhtServer {
    socket: Arc<UdpSocket>,
    dht: Dht,
    jobs: mpsc::UnboundedReceiver<Job>,
    jobs_tx: mpsc::UnboundedSender<Job>,
    snapshot: Arc<RwLock<DhtSnapshot>>,
}

impl DhtServer {
    /// Binds the socket. A `local` without endpoints advertises the bound
    /// address unless it is unspecified.
    pub async fn bind(
        config: DhtConfig,
        mut local: PeerInfo,
        addr: impl ToSocketAddrs,
    ) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        if local.eplist.is_empty() && !local_addr.ip().is_unspecified() {
            local = local.with_endpoint(Endpoint::udp(local_addr));
        }

        let transport = UdpTransport::new(socket.clone());
        let dht = Dht::new(config, local, Box::new(transport), Arc::new(SystemClock::new()))?;
        info!("DHT server bound to {} as {}", local_addr, dht.local().peerid());

        let (jobs_tx, jobs) = mpsc::unbounded_channel();
        Ok(Self {
            socket,
            dht,
            jobs,
            jobs_tx,
            snapshot: Arc::new(RwLock::new(DhtSnapshot::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    /// Direct access before the loop starts, e.g. to seed bootstrap peers.
    pub fn dht_mut(&mut self) -> &mut Dht {
        &mut self.dht
    }

    pub fn handle(&self) -> DhtHandle {
        DhtHandle {
            jobs: self.jobs_tx.clone(),
            snapshot: self.snapshot.clone(),
            service: ServicePath::root(),
        }
    }

    /// Serves until a handle calls [`DhtHandle::shutdown`].
    pub async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut poll_interval = tokio::time::interval(POLL_INTERVAL);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => self.dht.process_packet(&buf[..n], Endpoint::udp(addr)),
                        // ICMP errors from earlier sends surface here on some platforms.
                        Err(e) => debug!("DHT recv error: {}", e),
                    }
                }
                _ = poll_interval.tick() => {
                    self.dht.poll();
                }
                job = self.jobs.recv() => {
                    match job {
                        Some(job) => job(&mut self.dht),
                        None => break,
                    }
                }
            }

            self.publish();
            if self.dht.is_stopped() {
                break;
            }
        }
        info!("DHT server for {} exited", self.dht.local().peerid());
    }

    fn publish(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.peer_count = self.dht.routing().len();
        snapshot.task_count = self.dht.task_count();
        snapshot.service_count = self.dht.service_paths().count();
        snapshot.stats = self.dht.stats();
    }
}

/// A cloneable, `Send` front end of a running [`DhtServer`], scoped to one
/// service path (the root by default).
#[derive(Clone)]
pub struct DhtHandle {
    jobs: mpsc::UnboundedSender<Job>,
    snapshot: Arc<RwLock<DhtSnapshot>>,
    service: ServicePath,
}

impl DhtHandle {
    /// The same server, with value, lookup and broadcast calls scoped to `path`.
    pub fn in_service(&self, path: ServicePath) -> Self {
        Self {
            service: path,
            ..self.clone()
        }
    }

    pub fn service(&self) -> &ServicePath {
        &self.service
    }

    /// Runs `f` on the server loop and returns its output.
    async fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Dht) -> T + Send + 'static,
    ) -> Result<T, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |dht| {
                let _ = tx.send(f(dht));
            }))
            .map_err(|_| DhtError::Stopped)?;
        rx.await.map_err(|_| DhtError::Stopped)
    }

    async fn complete<T>(&self, rx: Completion<T>) -> Result<T, DhtError> {
        rx.await.map_err(|_| DhtError::Aborted)
    }

    pub async fn find_peer(&self, peerid: &str) -> Result<FindPeerResult, DhtError> {
        let (service, peerid) = (self.service.clone(), peerid.to_string());
        let rx = self.call(move |dht| dht.find_peer_in(&service, &peerid)).await??;
        self.complete(rx).await
    }

    pub async fn save_value(
        &self,
        table: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<SaveValueResult, DhtError> {
        let (service, table, key, value) =
            (self.service.clone(), table.to_string(), key.to_string(), value.into());
        let rx = self
            .call(move |dht| dht.save_value_in(&service, &table, &key, value))
            .await??;
        self.complete(rx).await
    }

    pub async fn get_value(&self, table: &str, key: &str) -> Result<GetValueResult, DhtError> {
        let (service, table, key) = (self.service.clone(), table.to_string(), key.to_string());
        let rx = self
            .call(move |dht| dht.get_value_in(&service, &table, &key))
            .await??;
        self.complete(rx).await
    }

    pub async fn delete_value(&self, table: &str, key: &str) -> Result<bool, DhtError> {
        let (service, table, key) = (self.service.clone(), table.to_string(), key.to_string());
        self.call(move |dht| dht.delete_value_in(&service, &table, &key))
            .await?
    }

    pub async fn emit_broadcast_event(
        &self,
        name: &str,
        params: impl Into<Bytes>,
        min_arrivals: usize,
    ) -> Result<BroadcastResult, DhtError> {
        let (service, name, params) = (self.service.clone(), name.to_string(), params.into());
        let rx = self
            .call(move |dht| dht.emit_broadcast_event_in(&service, &name, params, min_arrivals))
            .await??;
        self.complete(rx).await
    }

    pub async fn attach_broadcast_event_listener(
        &self,
        name: &str,
    ) -> Result<(ListenerId, mpsc::UnboundedReceiver<BroadcastEvent>), DhtError> {
        let (service, name) = (self.service.clone(), name.to_string());
        self.call(move |dht| dht.attach_listener(&service, &name))
            .await
    }

    pub async fn detach_broadcast_event_listener(&self, name: &str, id: ListenerId) -> Result<bool, DhtError> {
        let (service, name) = (self.service.clone(), name.to_string());
        self.call(move |dht| dht.detach_listener(&service, &name, id))
            .await
    }

    pub async fn active_peer(&self, info: PeerInfo, address: Option<Endpoint>) -> Result<(), DhtError> {
        self.call(move |dht| dht.active_peer(info, address, false, false))
            .await?
    }

    pub async fn handshake(&self, target: PeerInfo, agency: Option<PeerInfo>) -> Result<HandshakeResult, DhtError> {
        let rx = self.call(move |dht| dht.handshake(target, agency)).await??;
        self.complete(rx).await
    }

    pub async fn signin_server(&self, path: ServicePath, info: BTreeMap<String, String>) -> Result<(), DhtError> {
        self.call(move |dht| dht.signin_server(&path, info)).await?
    }

    pub async fn signout_server(&self, path: ServicePath) -> Result<(), DhtError> {
        self.call(move |dht| dht.signout_server(&path)).await?
    }

    pub async fn signin_visitor(&self, path: ServicePath) -> Result<(), DhtError> {
        self.call(move |dht| dht.signin_visitor(&path)).await?
    }

    pub async fn signout_visitor(&self, path: ServicePath) -> Result<(), DhtError> {
        self.call(move |dht| dht.signout_visitor(&path)).await?
    }

    /// The local peer as currently advertised.
    pub async fn local(&self) -> Result<PeerInfo, DhtError> {
        self.call(|dht| dht.local().info().clone()).await
    }

    /// Counters as of the last loop iteration.
    pub fn snapshot(&self) -> DhtSnapshot {
        self.snapshot.read().clone()
    }

    pub fn stats(&self) -> SendStats {
        self.snapshot.read().stats.clone()
    }

    /// Aborts every task and ends the server loop.
    pub async fn shutdown(&self) -> Result<(), DhtError> {
        self.call(|dht| dht.stop()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_node(peerid: &str) -> (DhtHandle, SocketAddr) {
        let server = DhtServer::bind(DhtConfig::fast(), PeerInfo::new(peerid), "127.0.0.1:0")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (handle, addr)
    }

    #[tokio::test]
    async fn test_bind_advertises_bound_address() {
        let (handle, addr) = spawn_node("alice").await;
        let local = handle.local().await.unwrap();
        assert_eq!(local.eplist, vec![Endpoint::udp(addr)]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_save_then_get() {
        let (alice, alice_addr) = spawn_node("alice").await;
        let (bob, _) = spawn_node("bob").await;

        let alice_info = PeerInfo::new("alice").with_endpoint(Endpoint::udp(alice_addr));
        bob.active_peer(alice_info, None).await.unwrap();

        let saved = tokio::time::timeout(Duration::from_secs(5), bob.save_value("scores", "bob", "42"))
            .await
            .unwrap()
            .unwrap();
        assert!(saved.result.is_success());
        assert!(saved.reached.iter().any(|p| p == "alice"));

        // alice holds the replica and has learned bob from the request
        let got = alice.get_value("scores", "bob").await.unwrap();
        assert_eq!(got.values.get("bob").map(|v| v.as_ref()), Some(&b"42"[..]));
        let found = alice.find_peer("bob").await.unwrap();
        assert!(found.result.is_success());

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (handle, _) = spawn_node("carol").await;
        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(handle.find_peer("dave").await, Err(DhtError::Stopped)));
    }
}
