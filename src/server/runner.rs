//! tokio driver for [`ServerCore`]

use super::{Action, ServerCore};
use crate::transport::{DatagramSocket, TunnelDevice, RECV_BUFFER_SIZE};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on datagrams processed concurrently
const DEFAULT_WORKERS: usize = 256;

/// State shared with the tasks the server spawns
struct Shared {
    core: Arc<ServerCore>,
    socket: Arc<dyn DatagramSocket>,
    tunnel: Option<Arc<dyn TunnelDevice>>,
    echo: bool,
    /// Cover-traffic task per session
    dummies: DashMap<u32, JoinHandle<()>>,
}

/// UDP server loop: receives datagrams, sweeps sessions on a timer and
/// moves tunnel packets between sessions and the tunnel device.
pub struct Server {
    core: Arc<ServerCore>,
    socket: Arc<dyn DatagramSocket>,
    tunnel: Option<Arc<dyn TunnelDevice>>,
    echo: bool,
    sweep_interval: Duration,
    workers: Arc<Semaphore>,
}

impl Server {
    pub fn new(core: Arc<ServerCore>, socket: Arc<dyn DatagramSocket>) -> Self {
        Self {
            core,
            socket,
            tunnel: None,
            echo: false,
            sweep_interval: Duration::from_secs(5),
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
        }
    }

    /// Route tunnel traffic through `tunnel`
    pub fn with_tunnel(mut self, tunnel: Arc<dyn TunnelDevice>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Without a tunnel device, send every received DATA payload back to
    /// its session
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = every;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    pub fn local_addr(&self) -> Result<SocketAddr, crate::Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then close every session
    pub async fn run<F>(&self, shutdown: F) -> Result<(), crate::Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let shared = Arc::new(Shared {
            core: self.core.clone(),
            socket: self.socket.clone(),
            tunnel: self.tunnel.clone(),
            echo: self.echo,
            dummies: DashMap::new(),
        });

        let mut sweeper = interval(self.sweep_interval);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let tunnel_task = self
            .tunnel
            .clone()
            .map(|tunnel| tokio::spawn(tunnel_loop(shared.clone(), tunnel)));

        info!("Listening on {}", self.socket.local_addr()?);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = shared.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                                trace!("Workers busy, dropping datagram from {}", peer);
                                continue;
                            };
                            let datagram = buf[..len].to_vec();
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                let actions = shared.process(datagram, peer).await;
                                shared.dispatch(actions).await;
                                drop(permit);
                            });
                        }
                        Err(e) => warn!("Receive error: {}", e),
                    }
                }
                _ = sweeper.tick() => {
                    let actions = shared.core.sweep();
                    shared.dispatch(actions).await;
                }
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        let actions = shared.core.close_all();
        shared.dispatch(actions).await;
        if let Some(task) = tunnel_task {
            task.abort();
        }
        shared.dummies.retain(|_, task| {
            task.abort();
            false
        });
        Ok(())
    }
}

impl Shared {
    /// Run one datagram through the core. Password checks go to the
    /// blocking pool.
    async fn process(&self, datagram: Vec<u8>, peer: SocketAddr) -> Vec<Action> {
        if !self.core.verifies_credentials(&datagram) {
            return self.core.handle_datagram(&datagram, peer);
        }
        let core = self.core.clone();
        match tokio::task::spawn_blocking(move || core.handle_datagram(&datagram, peer)).await {
            Ok(actions) => actions,
            Err(e) => {
                error!("Credential check from {} failed: {}", peer, e);
                Vec::new()
            }
        }
    }

    /// Carry out actions, including any further actions they produce
    async fn dispatch(self: &Arc<Self>, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { peer, datagram, jitter } if jitter.is_zero() => {
                    self.send(&datagram, peer).await;
                }
                Action::Send { peer, datagram, jitter } => {
                    let shared = self.clone();
                    tokio::spawn(async move {
                        sleep(jitter).await;
                        shared.send(&datagram, peer).await;
                    });
                }
                Action::Deliver { session_id, packet } => {
                    if let Some(tunnel) = &self.tunnel {
                        if let Err(e) = tunnel.write_packet(&packet).await {
                            warn!("Tunnel write failed: {}", e);
                        }
                    } else if self.echo {
                        match self.core.send_data(session_id, &packet) {
                            Ok(more) => queue.extend(more),
                            Err(e) => debug!("Echo to {:08x} failed: {}", session_id, e),
                        }
                    } else {
                        trace!("No tunnel device, discarding packet from {:08x}", session_id);
                    }
                }
                Action::Activated { session_id, mode } => {
                    info!("Session {:08x} established ({})", session_id, mode);
                    if self.core.dummy_delay(session_id).is_some() {
                        let shared = self.clone();
                        let task = tokio::spawn(dummy_loop(shared, session_id));
                        if let Some(previous) = self.dummies.insert(session_id, task) {
                            previous.abort();
                        }
                    }
                }
                Action::Closed { session_id, reason } => {
                    info!("Session {:08x} closed ({:?})", session_id, reason);
                    if let Some((_, task)) = self.dummies.remove(&session_id) {
                        task.abort();
                    }
                }
            }
        }
    }

    async fn send(&self, datagram: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(datagram, peer).await {
            debug!("Send to {} failed: {}", peer, e);
        }
    }
}

/// Emit cover traffic for one session until it closes
async fn dummy_loop(shared: Arc<Shared>, session_id: u32) {
    while let Some(delay) = shared.core.dummy_delay(session_id) {
        sleep(delay).await;
        if let Some(Action::Send { peer, datagram, .. }) = shared.core.dummy_packet(session_id) {
            shared.send(&datagram, peer).await;
        }
    }
    shared.dummies.remove(&session_id);
}

/// Read packets from the tunnel device and route them to sessions
async fn tunnel_loop(shared: Arc<Shared>, tunnel: Arc<dyn TunnelDevice>) {
    loop {
        match tunnel.read_packet().await {
            Ok(packet) => {
                let actions = shared.core.handle_tunnel_packet(&packet);
                shared.dispatch(actions).await;
            }
            Err(e) => {
                error!("Tunnel device read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{connect, ClientEvent, ClientOptions, ClientSession};
    use crate::mode::VpnMode;
    use crate::server::ServerSettings;
    use crate::users::ClientManager;
    use crate::session::Ipv4Net;
    use crate::transport::ChannelTunnel;
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    async fn start(server: Server) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<Result<(), crate::Error>>) {
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run(async {
                    let _ = stopped.await;
                })
                .await
        });
        (addr, stop, task)
    }

    async fn recv_event(socket: &UdpSocket, client: &mut ClientSession) -> ClientEvent {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if let Ok(mut events) = client.handle_datagram(&buf[..len]) {
                if !events.is_empty() {
                    return events.remove(0);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_echo_over_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let core = Arc::new(ServerCore::new(ServerSettings::default(), None));
        let server = Server::new(core.clone(), Arc::new(socket)).with_echo(true);
        let (addr, stop, task) = start(server).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = ClientSession::new(ClientOptions::new("semi_ghost"));
        let connected = connect(&client_socket, addr, &mut client, Duration::from_secs(2), 3)
            .await
            .unwrap();
        assert!(matches!(connected, ClientEvent::Connected { .. }));

        let datagram = client.seal_data(b"echo me").unwrap();
        client_socket.send_to(&datagram, addr).await.unwrap();
        assert_eq!(
            recv_event(&client_socket, &mut client).await,
            ClientEvent::Data(b"echo me".to_vec())
        );

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(
            recv_event(&client_socket, &mut client).await,
            ClientEvent::Disconnected
        );
        assert_eq!(core.session_count(), 0);
    }

    #[tokio::test]
    async fn test_password_login_over_udp() {
        let users = Arc::new(ClientManager::in_memory());
        users.create_user("erin", Some("letmein"), VpnMode::SemiGhost).unwrap();
        let settings = ServerSettings {
            require_auth: true,
            ..ServerSettings::default()
        };
        let core = Arc::new(ServerCore::new(settings, Some(users.clone())));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr, stop, task) = start(Server::new(core.clone(), Arc::new(socket))).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = ClientSession::new(ClientOptions::new("normal").with_credentials("erin", "letmein"));
        let connected = connect(&client_socket, addr, &mut client, Duration::from_secs(5), 3)
            .await
            .unwrap();
        assert!(matches!(
            connected,
            ClientEvent::Connected {
                mode: VpnMode::SemiGhost,
                ..
            }
        ));
        assert_eq!(users.get_user_info("erin").unwrap().total_connections, 1);

        let mut intruder = ClientSession::new(ClientOptions::new("normal").with_credentials("erin", "guess"));
        assert!(connect(&client_socket, addr, &mut intruder, Duration::from_secs(2), 1)
            .await
            .is_err());
        assert_eq!(core.session_count(), 1);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_device_routing() {
        let settings = ServerSettings {
            vpn_network: Some(Ipv4Net::new(Ipv4Addr::new(10, 9, 0, 0), 24).unwrap()),
            ..ServerSettings::default()
        };
        let core = Arc::new(ServerCore::new(settings, None));
        let (tunnel, mut ends) = ChannelTunnel::new(8);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(core, Arc::new(socket)).with_tunnel(Arc::new(tunnel));
        let (addr, stop, task) = start(server).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = ClientSession::new(ClientOptions::new("normal"));
        let ClientEvent::Connected { vpn_address, .. } =
            connect(&client_socket, addr, &mut client, Duration::from_secs(2), 3)
                .await
                .unwrap()
        else {
            panic!("not connected");
        };
        let assigned = vpn_address.unwrap();

        // Client to tunnel
        let mut upstream = vec![0u8; 28];
        upstream[0] = 0x45;
        upstream[16..20].copy_from_slice(&[10, 9, 0, 1]);
        client_socket
            .send_to(&client.seal_data(&upstream).unwrap(), addr)
            .await
            .unwrap();
        let delivered = timeout(Duration::from_secs(5), ends.delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, upstream);

        // Tunnel to client, routed by destination address
        let mut downstream = vec![0u8; 28];
        downstream[0] = 0x45;
        downstream[16..20].copy_from_slice(&assigned.octets());
        ends.inject.send(downstream.clone()).await.unwrap();
        assert_eq!(
            recv_event(&client_socket, &mut client).await,
            ClientEvent::Data(downstream)
        );

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
