//! PCP client and its long-running service.
//!
//! The [`Client`] is a cheap handle over a command channel; the actual
//! protocol state (mapping tables, nonce, epoch, transport) is owned by a
//! [`Service`] task. The service multiplexes three concerns in one select
//! loop: datagrams from the gateway, commands from client handles, and a
//! periodic scan for mappings due a refresh.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::epoch::ClientEpoch;
use crate::error::Error;
use crate::event::Event;
use crate::interfaces;
use crate::mapping::{MappingStore, PeerMapping, PortMapping, RefreshTime};
use crate::protocol::{
    DecodeError, MapData, OpcodeData, PeerData, Protocol, Request, Response, ResultCode,
};
use crate::transport::{Transport, UdpTransport};
use crate::util::AbortingJoinHandle;

/// Capacity of the channel to communicate with the long-running service.
const SERVICE_CHANNEL_CAPACITY: usize = 32; // should be plenty
/// Capacity of the event channel handed to the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 32;
/// How often the mapping tables are scanned for due refreshes.
const REFRESH_SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// Lifetimes under two minutes are pointless; user requests are raised to
/// this floor. Deletes (lifetime 0) are exempt.
const MIN_MAPPING_LIFETIME: u32 = 120;
/// Internal port of the short mapping used to learn the external address:
/// UDP discard.
const EXTERNAL_PROBE_PORT: u16 = 9;
/// Lifetime of the external address probe mapping. Not a user mapping, so
/// the two minute floor does not apply.
const EXTERNAL_PROBE_LIFETIME: u32 = 30;

/// Timeouts of a [`Client`].
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for the gateway to answer the startup announce.
    pub announce_timeout: Duration,
    /// How long calls that wait for a confirming response
    /// ([`Client::delete_map`], [`Client::external_address`], …) may block.
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            announce_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands sent from client handles to the service.
#[derive(Debug)]
enum Message {
    Announce {
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    AddMap {
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        lifetime_seconds: u32,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    AddPeer {
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        remote_port: u16,
        remote_addr: IpAddr,
        lifetime_seconds: u32,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    RefreshMap {
        internal_port: u16,
        lifetime_seconds: u32,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    RefreshPeer {
        internal_port: u16,
        lifetime_seconds: u32,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteMap {
        internal_port: u16,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeletePeer {
        internal_port: u16,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    ExternalAddress {
        result_tx: oneshot::Sender<Result<IpAddr, Error>>,
    },
    GetMapping {
        internal_port: u16,
        result_tx: oneshot::Sender<Option<PortMapping>>,
    },
    GetPeerMapping {
        internal_port: u16,
        result_tx: oneshot::Sender<Option<PeerMapping>>,
    },
    Shutdown {
        result_tx: oneshot::Sender<()>,
    },
}

/// PCP client.
///
/// Create one with [`Client::new`]; the returned event channel carries an
/// [`Event`] for every state change the service observes. Dropping the
/// client aborts the service task; [`Client::close`] shuts it down
/// gracefully.
#[derive(Debug)]
pub struct Client {
    /// Channel used to communicate with the service.
    service_tx: mpsc::Sender<Message>,
    gateway: IpAddr,
    internal_addr: IpAddr,
    config: Config,
    /// Aborts the service task when the client is dropped.
    _service_handle: AbortingJoinHandle<()>,
}

impl Client {
    /// Create a client talking to the network's default gateway.
    ///
    /// Discovers the gateway from the routing table, picks the local
    /// interface address on its network, connects a UDP socket to the
    /// gateway's PCP port, and probes it with an announce request. Returns
    /// once the gateway confirms, together with the event channel.
    pub async fn new(config: Config) -> Result<(Client, mpsc::Receiver<Event>), Error> {
        let gateway = interfaces::gateway_address()?;
        let internal_addr = interfaces::internal_address(gateway)?;
        let transport = UdpTransport::connect(gateway).await.map_err(Error::Socket)?;
        Self::with_transport(transport, gateway, internal_addr, config).await
    }

    /// Create a client over an arbitrary [`Transport`].
    ///
    /// `gateway` is the address responses are expected from and
    /// `internal_addr` the address placed in the client field of every
    /// request. Like [`Client::new`], waits for the gateway to answer an
    /// announce probe. This is also the entry point for driving the client
    /// with a scripted transport.
    pub async fn with_transport<T: Transport>(
        transport: T,
        gateway: IpAddr,
        internal_addr: IpAddr,
        config: Config,
    ) -> Result<(Client, mpsc::Receiver<Event>), Error> {
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| Error::NonceGeneration)?;

        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let service = Service {
            transport,
            gateway,
            client_addr: wire_addr(internal_addr),
            rx: service_rx,
            event_tx,
            store: MappingStore::default(),
            epoch: ClientEpoch::default(),
            nonce,
            rng: StdRng::from_entropy(),
            started: Instant::now(),
            pending: Pending::default(),
        };

        let handle =
            tokio::spawn(service.run().instrument(info_span!("pcp.service"))).into();

        let client = Client {
            service_tx,
            gateway,
            internal_addr,
            config,
            _service_handle: handle,
        };

        client.announce().await?;
        Ok((client, event_rx))
    }

    /// Address of the gateway this client converses with.
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Local address placed in the client field of every request.
    pub fn internal_address(&self) -> IpAddr {
        self.internal_addr
    }

    /// Request a mapping of `internal_port` for inbound traffic.
    ///
    /// `external_port` and `external_addr` are suggestions; the server
    /// decides what it assigns. Lifetimes under two minutes are raised to
    /// two minutes. An add for a port that already has a mapping refreshes
    /// it. Returns once the request is on the wire; confirmation arrives as
    /// an [`Event::ReceivedMapping`].
    pub async fn add_map(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        self.request(|result_tx| Message::AddMap {
            protocol,
            internal_port,
            external_port,
            external_addr,
            lifetime_seconds,
            result_tx,
        })
        .await?
    }

    /// Request a pinhole of `internal_port` towards a single remote peer.
    ///
    /// Same contract as [`Client::add_map`]; `remote_addr` is mandatory.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_peer(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        remote_port: u16,
        remote_addr: IpAddr,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        self.request(|result_tx| Message::AddPeer {
            protocol,
            internal_port,
            external_port,
            external_addr,
            remote_port,
            remote_addr,
            lifetime_seconds,
            result_tx,
        })
        .await?
    }

    /// Re-send the mapping for `internal_port` with a new lifetime.
    ///
    /// Lifetime 0 deletes the mapping, per RFC 6887. Fails with
    /// [`Error::MappingNotFound`] when the port has no mapping.
    pub async fn refresh_map(
        &self,
        internal_port: u16,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        self.request(|result_tx| Message::RefreshMap {
            internal_port,
            lifetime_seconds,
            result_tx,
        })
        .await?
    }

    /// Re-send the peer mapping for `internal_port` with a new lifetime.
    ///
    /// Lifetime 0 deletes the mapping, per RFC 6887. Fails with
    /// [`Error::MappingNotFound`] when the port has no peer mapping.
    pub async fn refresh_peer(
        &self,
        internal_port: u16,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        self.request(|result_tx| Message::RefreshPeer {
            internal_port,
            lifetime_seconds,
            result_tx,
        })
        .await?
    }

    /// Delete the mapping for `internal_port` and wait for the gateway to
    /// confirm. A no-op when the port has no mapping.
    pub async fn delete_map(&self, internal_port: u16) -> Result<(), Error> {
        self.timed_request(self.config.response_timeout, |result_tx| {
            Message::DeleteMap {
                internal_port,
                result_tx,
            }
        })
        .await?
    }

    /// Delete the peer mapping for `internal_port` and wait for the gateway
    /// to confirm. A no-op when the port has no peer mapping.
    pub async fn delete_peer(&self, internal_port: u16) -> Result<(), Error> {
        self.timed_request(self.config.response_timeout, |result_tx| {
            Message::DeletePeer {
                internal_port,
                result_tx,
            }
        })
        .await?
    }

    /// Learn this client's externally visible address.
    ///
    /// Creates a 30 second mapping for the UDP discard port and returns the
    /// external address the server reports for it; the probe mapping is
    /// discarded once the answer arrives.
    pub async fn external_address(&self) -> Result<IpAddr, Error> {
        self.timed_request(self.config.response_timeout, |result_tx| {
            Message::ExternalAddress { result_tx }
        })
        .await?
    }

    /// Snapshot of the mapping for `internal_port`, if any.
    pub async fn mapping(&self, internal_port: u16) -> Result<Option<PortMapping>, Error> {
        self.request(|result_tx| Message::GetMapping {
            internal_port,
            result_tx,
        })
        .await
    }

    /// Snapshot of the peer mapping for `internal_port`, if any.
    pub async fn peer_mapping(
        &self,
        internal_port: u16,
    ) -> Result<Option<PeerMapping>, Error> {
        self.request(|result_tx| Message::GetPeerMapping {
            internal_port,
            result_tx,
        })
        .await
    }

    /// Shut the client down: stop the service, close the transport and emit
    /// a final [`Event::Close`]. Operations still in flight resolve to
    /// [`Error::Closed`].
    pub async fn close(self) {
        let (result_tx, rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::Shutdown { result_tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Probe the gateway with an announce request, bounded by the
    /// configured announce timeout.
    async fn announce(&self) -> Result<(), Error> {
        self.timed_request(self.config.announce_timeout, |result_tx| {
            Message::Announce { result_tx }
        })
        .await?
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Message,
    ) -> Result<R, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(build(result_tx))
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)
    }

    async fn timed_request<R>(
        &self,
        deadline: Duration,
        build: impl FnOnce(oneshot::Sender<R>) -> Message,
    ) -> Result<R, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(build(result_tx))
            .await
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(deadline, result_rx).await {
            Err(_elapsed) => Err(Error::NetworkTimeout),
            Ok(Err(_closed)) => Err(Error::Closed),
            Ok(Ok(result)) => Ok(result),
        }
    }
}

/// Callers waiting for a specific response, and mappings marked for removal
/// on their next confirmation.
#[derive(Debug, Default)]
struct Pending {
    announce: Vec<oneshot::Sender<Result<(), Error>>>,
    map_deletes: HashMap<u16, Vec<oneshot::Sender<Result<(), Error>>>>,
    peer_deletes: HashMap<u16, Vec<oneshot::Sender<Result<(), Error>>>>,
    external: Vec<oneshot::Sender<Result<IpAddr, Error>>>,
    /// Ports whose map entry goes away on the next confirming response.
    map_removals: HashSet<u16>,
    /// Ports whose peer entry goes away on the next confirming response.
    peer_removals: HashSet<u16>,
}

/// The long-running half of the client: owns the transport, the mapping
/// tables, the nonce and the epoch tracker. Stops when told to shut down,
/// when every client handle is gone, or when the gateway turns out to speak
/// an incompatible version.
#[derive(Debug)]
struct Service<T> {
    transport: T,
    gateway: IpAddr,
    /// Internal address as sent on the wire.
    client_addr: Ipv6Addr,
    rx: mpsc::Receiver<Message>,
    event_tx: mpsc::Sender<Event>,
    store: MappingStore,
    epoch: ClientEpoch,
    /// Generated once per client; reused for every map and peer operation so
    /// the server can authenticate refreshes and deletes.
    nonce: [u8; 12],
    rng: StdRng,
    started: Instant,
    pending: Pending,
}

impl<T: Transport> Service<T> {
    async fn run(mut self) {
        debug!("pcp service starting");
        let mut scan = tokio::time::interval(REFRESH_SCAN_INTERVAL);
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(Message::Shutdown { result_tx }) => {
                            self.shutdown();
                            let _ = result_tx.send(());
                            return;
                        }
                        Some(msg) => self.handle_msg(msg).await,
                        None => {
                            debug!("all client handles dropped, stopping");
                            self.shutdown();
                            return;
                        }
                    }
                }
                datagram = self.transport.recv() => {
                    match datagram {
                        Ok((buf, from)) => {
                            if self.handle_datagram(&buf, from).await.is_break() {
                                self.shutdown();
                                return;
                            }
                        }
                        // transient: log and keep receiving
                        Err(e) => debug!("error receiving datagram: {e}"),
                    }
                }
                _ = scan.tick() => self.refresh_due_mappings().await,
            }
        }
    }

    /// Resolve everything still waiting and emit the final event.
    fn shutdown(&mut self) {
        debug!("pcp service stopping");
        for tx in self.pending.announce.drain(..) {
            let _ = tx.send(Err(Error::Closed));
        }
        for (_, waiters) in self.pending.map_deletes.drain() {
            for tx in waiters {
                let _ = tx.send(Err(Error::Closed));
            }
        }
        for (_, waiters) in self.pending.peer_deletes.drain() {
            for tx in waiters {
                let _ = tx.send(Err(Error::Closed));
            }
        }
        for tx in self.pending.external.drain(..) {
            let _ = tx.send(Err(Error::Closed));
        }
        // best effort: an undrained consumer loses the close notification
        let _ = self.event_tx.try_send(Event::Close);
    }

    async fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::Announce { result_tx } => {
                let request = Request::announce(self.client_addr);
                match self.send_request(&request).await {
                    Ok(()) => self.pending.announce.push(result_tx),
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                    }
                }
            }
            Message::AddMap {
                protocol,
                internal_port,
                external_port,
                external_addr,
                lifetime_seconds,
                result_tx,
            } => {
                let result = self
                    .add_map(
                        protocol,
                        internal_port,
                        external_port,
                        external_addr,
                        lifetime_seconds,
                    )
                    .await;
                let _ = result_tx.send(result);
            }
            Message::AddPeer {
                protocol,
                internal_port,
                external_port,
                external_addr,
                remote_port,
                remote_addr,
                lifetime_seconds,
                result_tx,
            } => {
                let result = self
                    .add_peer(
                        protocol,
                        internal_port,
                        external_port,
                        external_addr,
                        remote_port,
                        remote_addr,
                        lifetime_seconds,
                    )
                    .await;
                let _ = result_tx.send(result);
            }
            Message::RefreshMap {
                internal_port,
                lifetime_seconds,
                result_tx,
            } => {
                let result = self.refresh_map(internal_port, lifetime_seconds).await;
                let _ = result_tx.send(result);
            }
            Message::RefreshPeer {
                internal_port,
                lifetime_seconds,
                result_tx,
            } => {
                let result = self.refresh_peer(internal_port, lifetime_seconds).await;
                let _ = result_tx.send(result);
            }
            Message::DeleteMap {
                internal_port,
                result_tx,
            } => match self.send_map_delete(internal_port).await {
                Ok(true) => {
                    self.pending
                        .map_deletes
                        .entry(internal_port)
                        .or_default()
                        .push(result_tx);
                }
                // absent: deleting nothing succeeds
                Ok(false) => {
                    let _ = result_tx.send(Ok(()));
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                }
            },
            Message::DeletePeer {
                internal_port,
                result_tx,
            } => match self.send_peer_delete(internal_port).await {
                Ok(true) => {
                    self.pending
                        .peer_deletes
                        .entry(internal_port)
                        .or_default()
                        .push(result_tx);
                }
                Ok(false) => {
                    let _ = result_tx.send(Ok(()));
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                }
            },
            Message::ExternalAddress { result_tx } => {
                match self.send_external_probe().await {
                    Ok(()) => self.pending.external.push(result_tx),
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                    }
                }
            }
            Message::GetMapping {
                internal_port,
                result_tx,
            } => {
                let _ = result_tx.send(self.store.maps.get(&internal_port).cloned());
            }
            Message::GetPeerMapping {
                internal_port,
                result_tx,
            } => {
                let _ = result_tx.send(self.store.peers.get(&internal_port).cloned());
            }
            Message::Shutdown { .. } => unreachable!("handled in the run loop"),
        }
    }

    async fn add_map(
        &mut self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        let lifetime_seconds = lifetime_seconds.max(MIN_MAPPING_LIFETIME);
        if self.store.maps.contains_key(&internal_port) {
            debug!(port = internal_port, "mapping exists, refreshing");
        }
        let external = external_addr.map(wire_addr).unwrap_or(Ipv6Addr::UNSPECIFIED);
        let data = MapData {
            nonce: self.nonce,
            protocol,
            internal_port,
            external_port,
            external_addr: external,
        };
        self.send_map(data, lifetime_seconds).await?;

        let refresh = RefreshTime::next(0, lifetime_seconds, &mut self.rng);
        self.store
            .maps
            .entry(internal_port)
            .and_modify(|m| {
                m.protocol = protocol;
                m.external_port = external_port;
                m.external_addr = external.to_canonical();
                m.lifetime_seconds = lifetime_seconds;
                m.refresh = refresh;
            })
            .or_insert_with(|| PortMapping {
                protocol,
                internal_port,
                external_port,
                external_addr: external.to_canonical(),
                active: false,
                lifetime_seconds,
                refresh,
            });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_peer(
        &mut self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        external_addr: Option<IpAddr>,
        remote_port: u16,
        remote_addr: IpAddr,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        let lifetime_seconds = lifetime_seconds.max(MIN_MAPPING_LIFETIME);
        if self.store.peers.contains_key(&internal_port) {
            debug!(port = internal_port, "peer mapping exists, refreshing");
        }
        let external = external_addr.map(wire_addr).unwrap_or(Ipv6Addr::UNSPECIFIED);
        let data = PeerData {
            map: MapData {
                nonce: self.nonce,
                protocol,
                internal_port,
                external_port,
                external_addr: external,
            },
            remote_port,
            remote_addr: wire_addr(remote_addr),
        };
        self.send_peer(data, lifetime_seconds).await?;

        let refresh = RefreshTime::next(0, lifetime_seconds, &mut self.rng);
        self.store
            .peers
            .entry(internal_port)
            .and_modify(|p| {
                p.mapping.protocol = protocol;
                p.mapping.external_port = external_port;
                p.mapping.external_addr = external.to_canonical();
                p.mapping.lifetime_seconds = lifetime_seconds;
                p.mapping.refresh = refresh;
                p.remote_port = remote_port;
                p.remote_addr = remote_addr;
            })
            .or_insert_with(|| PeerMapping {
                mapping: PortMapping {
                    protocol,
                    internal_port,
                    external_port,
                    external_addr: external.to_canonical(),
                    active: false,
                    lifetime_seconds,
                    refresh,
                },
                remote_port,
                remote_addr,
            });
        Ok(())
    }

    async fn refresh_map(
        &mut self,
        internal_port: u16,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        let Some(mapping) = self.store.maps.get(&internal_port).cloned() else {
            return Err(Error::MappingNotFound);
        };
        if lifetime_seconds == 0 {
            // lifetime 0 deletes the mapping, per RFC 6887
            return self.send_map_delete(internal_port).await.map(|_| ());
        }
        let data = MapData {
            nonce: self.nonce,
            protocol: mapping.protocol,
            internal_port,
            external_port: mapping.external_port,
            external_addr: wire_addr(mapping.external_addr),
        };
        self.send_map(data, lifetime_seconds).await?;

        let refresh = RefreshTime::next(0, lifetime_seconds, &mut self.rng);
        let mapping = self
            .store
            .maps
            .get_mut(&internal_port)
            .expect("presence checked above");
        mapping.lifetime_seconds = lifetime_seconds;
        mapping.refresh = refresh;
        Ok(())
    }

    async fn refresh_peer(
        &mut self,
        internal_port: u16,
        lifetime_seconds: u32,
    ) -> Result<(), Error> {
        let Some(peer) = self.store.peers.get(&internal_port).cloned() else {
            return Err(Error::MappingNotFound);
        };
        if lifetime_seconds == 0 {
            return self.send_peer_delete(internal_port).await.map(|_| ());
        }
        let data = peer_data(&peer, self.nonce);
        self.send_peer(data, lifetime_seconds).await?;

        let refresh = RefreshTime::next(0, lifetime_seconds, &mut self.rng);
        let peer = self
            .store
            .peers
            .get_mut(&internal_port)
            .expect("presence checked above");
        peer.mapping.lifetime_seconds = lifetime_seconds;
        peer.mapping.refresh = refresh;
        Ok(())
    }

    /// Send a lifetime-0 request for the mapping of `internal_port` and
    /// mark the entry for removal on confirmation. Returns false when the
    /// port has no mapping.
    async fn send_map_delete(&mut self, internal_port: u16) -> Result<bool, Error> {
        let Some(mapping) = self.store.maps.get(&internal_port).cloned() else {
            return Ok(false);
        };
        let data = MapData {
            nonce: self.nonce,
            protocol: mapping.protocol,
            internal_port,
            external_port: mapping.external_port,
            external_addr: wire_addr(mapping.external_addr),
        };
        self.send_map(data, 0).await?;

        let mapping = self
            .store
            .maps
            .get_mut(&internal_port)
            .expect("presence checked above");
        mapping.active = false;
        self.pending.map_removals.insert(internal_port);
        Ok(true)
    }

    /// Peer counterpart of [`Service::send_map_delete`].
    async fn send_peer_delete(&mut self, internal_port: u16) -> Result<bool, Error> {
        let Some(peer) = self.store.peers.get(&internal_port).cloned() else {
            return Ok(false);
        };
        let data = peer_data(&peer, self.nonce);
        self.send_peer(data, 0).await?;

        let peer = self
            .store
            .peers
            .get_mut(&internal_port)
            .expect("presence checked above");
        peer.mapping.active = false;
        self.pending.peer_removals.insert(internal_port);
        Ok(true)
    }

    /// Send the short discard-port mapping whose response carries our
    /// external address.
    async fn send_external_probe(&mut self) -> Result<(), Error> {
        let data = MapData {
            nonce: self.nonce,
            protocol: Protocol::Udp,
            internal_port: EXTERNAL_PROBE_PORT,
            external_port: 0,
            external_addr: Ipv6Addr::UNSPECIFIED,
        };
        self.send_map(data, EXTERNAL_PROBE_LIFETIME).await?;

        let refresh = RefreshTime::next(0, EXTERNAL_PROBE_LIFETIME, &mut self.rng);
        self.store
            .maps
            .entry(EXTERNAL_PROBE_PORT)
            .or_insert_with(|| PortMapping {
                protocol: Protocol::Udp,
                internal_port: EXTERNAL_PROBE_PORT,
                external_port: 0,
                external_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                active: false,
                lifetime_seconds: EXTERNAL_PROBE_LIFETIME,
                refresh,
            });
        self.pending.map_removals.insert(EXTERNAL_PROBE_PORT);
        Ok(())
    }

    async fn send_map(&mut self, data: MapData, lifetime_seconds: u32) -> Result<(), Error> {
        let request = Request::map(data, self.client_addr, lifetime_seconds);
        self.send_request(&request).await
    }

    async fn send_peer(&mut self, data: PeerData, lifetime_seconds: u32) -> Result<(), Error> {
        let request = Request::peer(data, self.client_addr, lifetime_seconds);
        self.send_request(&request).await
    }

    async fn send_request(&mut self, request: &Request) -> Result<(), Error> {
        // encode first: codec failures must leave the store and the
        // transport untouched
        let encoded = request.encode()?;
        trace!(
            opcode = %request.opcode_data.opcode(),
            lifetime = request.lifetime_seconds,
            len = encoded.len(),
            "sending request"
        );
        self.transport
            .send(&encoded)
            .await
            .map_err(Error::NetworkSend)
    }

    /// Scan both tables and re-send every active mapping whose refresh is
    /// due. A refresh counts as unanswered until the response arrives,
    /// whether the send succeeded or not, so the attempt counter climbs and
    /// the retry interval shrinks per RFC 6887 §11.2.1 instead of
    /// hot-looping at the scan cadence.
    async fn refresh_due_mappings(&mut self) {
        let now = Instant::now();
        for port in self.store.due_maps(now) {
            let mapping = self.store.maps.get(&port).expect("due port is present").clone();
            debug!(port, attempt = mapping.refresh.attempt, "refreshing mapping");
            let data = MapData {
                nonce: self.nonce,
                protocol: mapping.protocol,
                internal_port: port,
                external_port: mapping.external_port,
                external_addr: wire_addr(mapping.external_addr),
            };
            if let Err(e) = self.send_map(data, mapping.lifetime_seconds).await {
                warn!(port, "failed to refresh mapping: {e}");
            }
            // a failed send backs off like an unanswered one
            let refresh = RefreshTime::next(
                mapping.refresh.attempt + 1,
                mapping.lifetime_seconds,
                &mut self.rng,
            );
            self.store.maps.get_mut(&port).expect("present").refresh = refresh;
        }
        for port in self.store.due_peers(now) {
            let peer = self.store.peers.get(&port).expect("due port is present").clone();
            debug!(port, attempt = peer.mapping.refresh.attempt, "refreshing peer mapping");
            let data = peer_data(&peer, self.nonce);
            if let Err(e) = self.send_peer(data, peer.mapping.lifetime_seconds).await {
                warn!(port, "failed to refresh peer mapping: {e}");
            }
            let refresh = RefreshTime::next(
                peer.mapping.refresh.attempt + 1,
                peer.mapping.lifetime_seconds,
                &mut self.rng,
            );
            self.store.peers.get_mut(&port).expect("present").mapping.refresh = refresh;
        }
    }

    /// Process one datagram. Breaks out of the service loop only when the
    /// gateway turns out to speak an incompatible version.
    async fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) -> ControlFlow<()> {
        if from.ip().to_canonical() != self.gateway.to_canonical() {
            debug!(%from, "dropping datagram: {}", Error::AddressMismatch);
            return ControlFlow::Continue(());
        }

        let response = match Response::decode(buf) {
            Ok(response) => response,
            Err(DecodeError::UnsupportedVersion) => {
                warn!("gateway speaks an unsupported PCP version, shutting down");
                self.fail_announce_waiters();
                return ControlFlow::Break(());
            }
            Err(e) => {
                debug!("dropping datagram: {e}");
                return ControlFlow::Continue(());
            }
        };
        trace!(
            opcode = %response.opcode,
            result = %response.result_code,
            epoch = response.epoch_time,
            "received response"
        );

        match response.result_code {
            ResultCode::Success => self.on_success(&response).await,
            ResultCode::UnsupportedVersion => {
                warn!("gateway rejected our PCP version, shutting down");
                self.fail_announce_waiters();
                return ControlFlow::Break(());
            }
            code => self.on_failure(&response, code).await,
        }

        // every response feeds the epoch check, including failures
        let client_time = self.started.elapsed().as_secs() as i64;
        if !self.epoch.validate(client_time, response.epoch_time) {
            debug!("server lost state, re-sending active mappings");
            self.resend_active_mappings().await;
        }
        ControlFlow::Continue(())
    }

    async fn on_success(&mut self, response: &Response) {
        match &response.data {
            Some(OpcodeData::Announce) => {
                for tx in self.pending.announce.drain(..) {
                    let _ = tx.send(Ok(()));
                }
                self.publish(Event::ReceivedAnnounce).await;
            }
            Some(OpcodeData::Map(data)) => {
                self.on_map_response(data, response.lifetime_seconds).await
            }
            Some(OpcodeData::Peer(data)) => {
                self.on_peer_response(data, response.lifetime_seconds).await
            }
            None => debug!("ignoring response with unrecognized {}", response.opcode),
        }
    }

    async fn on_map_response(&mut self, data: &MapData, lifetime_seconds: u32) {
        if data.nonce != self.nonce {
            debug!("dropping map response carrying a foreign nonce");
            return;
        }
        let port = data.internal_port;
        let mapping = PortMapping {
            protocol: data.protocol,
            internal_port: port,
            external_port: data.external_port,
            external_addr: data.external_addr.to_canonical(),
            active: true,
            lifetime_seconds,
            refresh: RefreshTime::next(0, lifetime_seconds, &mut self.rng),
        };

        if self.pending.map_removals.remove(&port) {
            self.store.maps.remove(&port);
            debug!(port, "mapping deleted");
            if let Some(waiters) = self.pending.map_deletes.remove(&port) {
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
            if port == EXTERNAL_PROBE_PORT {
                for tx in self.pending.external.drain(..) {
                    let _ = tx.send(Ok(mapping.external_addr));
                }
            }
        } else {
            debug!(
                port,
                external_port = mapping.external_port,
                external = %mapping.external_addr,
                lifetime = lifetime_seconds,
                "mapping active"
            );
            self.store.maps.insert(port, mapping.clone());
        }
        self.publish(Event::ReceivedMapping(mapping)).await;
    }

    async fn on_peer_response(&mut self, data: &PeerData, lifetime_seconds: u32) {
        if data.map.nonce != self.nonce {
            debug!("dropping peer response carrying a foreign nonce");
            return;
        }
        let port = data.map.internal_port;
        let peer = PeerMapping {
            mapping: PortMapping {
                protocol: data.map.protocol,
                internal_port: port,
                external_port: data.map.external_port,
                external_addr: data.map.external_addr.to_canonical(),
                active: true,
                lifetime_seconds,
                refresh: RefreshTime::next(0, lifetime_seconds, &mut self.rng),
            },
            remote_port: data.remote_port,
            remote_addr: data.remote_addr.to_canonical(),
        };

        if self.pending.peer_removals.remove(&port) {
            self.store.peers.remove(&port);
            debug!(port, "peer mapping deleted");
            if let Some(waiters) = self.pending.peer_deletes.remove(&port) {
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
        } else {
            debug!(
                port,
                external_port = peer.mapping.external_port,
                remote = %peer.remote_addr,
                lifetime = lifetime_seconds,
                "peer mapping active"
            );
            self.store.peers.insert(port, peer.clone());
        }
        self.publish(Event::ReceivedPeer(peer)).await;
    }

    /// A non-success result code. The mapping, if any, survives with a
    /// bumped attempt counter and a sooner retry; callers waiting on the
    /// operation get the code as their result. Never terminates the client.
    async fn on_failure(&mut self, response: &Response, code: ResultCode) {
        debug!(opcode = %response.opcode, "gateway answered: {code}");
        match &response.data {
            Some(OpcodeData::Announce) => {
                for tx in self.pending.announce.drain(..) {
                    let _ = tx.send(Err(Error::Result(code)));
                }
            }
            Some(OpcodeData::Map(data)) => {
                let port = data.internal_port;
                if let Some(mapping) = self.store.maps.get_mut(&port) {
                    let attempt = mapping.refresh.attempt + 1;
                    mapping.refresh =
                        RefreshTime::next(attempt, mapping.lifetime_seconds, &mut self.rng);
                }
                self.pending.map_removals.remove(&port);
                if let Some(waiters) = self.pending.map_deletes.remove(&port) {
                    for tx in waiters {
                        let _ = tx.send(Err(Error::Result(code)));
                    }
                }
                if port == EXTERNAL_PROBE_PORT {
                    for tx in self.pending.external.drain(..) {
                        let _ = tx.send(Err(Error::Result(code)));
                    }
                }
            }
            Some(OpcodeData::Peer(data)) => {
                let port = data.map.internal_port;
                if let Some(peer) = self.store.peers.get_mut(&port) {
                    let attempt = peer.mapping.refresh.attempt + 1;
                    peer.mapping.refresh =
                        RefreshTime::next(attempt, peer.mapping.lifetime_seconds, &mut self.rng);
                }
                self.pending.peer_removals.remove(&port);
                if let Some(waiters) = self.pending.peer_deletes.remove(&port) {
                    for tx in waiters {
                        let _ = tx.send(Err(Error::Result(code)));
                    }
                }
            }
            None => {}
        }
    }

    /// The server lost its state: re-send every active mapping with its
    /// current parameters. Responses reschedule the refreshes as usual.
    async fn resend_active_mappings(&mut self) {
        let maps: Vec<PortMapping> =
            self.store.maps.values().filter(|m| m.active).cloned().collect();
        for mapping in maps {
            let data = MapData {
                nonce: self.nonce,
                protocol: mapping.protocol,
                internal_port: mapping.internal_port,
                external_port: mapping.external_port,
                external_addr: wire_addr(mapping.external_addr),
            };
            if let Err(e) = self.send_map(data, mapping.lifetime_seconds).await {
                warn!(port = mapping.internal_port, "failed to re-send mapping: {e}");
            }
        }
        let peers: Vec<PeerMapping> = self
            .store
            .peers
            .values()
            .filter(|p| p.mapping.active)
            .cloned()
            .collect();
        for peer in peers {
            let data = peer_data(&peer, self.nonce);
            if let Err(e) = self.send_peer(data, peer.mapping.lifetime_seconds).await {
                warn!(
                    port = peer.mapping.internal_port,
                    "failed to re-send peer mapping: {e}"
                );
            }
        }
    }

    fn fail_announce_waiters(&mut self) {
        for tx in self.pending.announce.drain(..) {
            let _ = tx.send(Err(Error::UnsupportedVersion));
        }
    }

    async fn publish(&mut self, event: Event) {
        // an undrained consumer intentionally back-pressures this loop
        if self.event_tx.send(event).await.is_err() {
            trace!("event consumer gone");
        }
    }
}

/// Wire requests for a stored peer mapping.
fn peer_data(peer: &PeerMapping, nonce: [u8; 12]) -> PeerData {
    PeerData {
        map: MapData {
            nonce,
            protocol: peer.mapping.protocol,
            internal_port: peer.mapping.internal_port,
            external_port: peer.mapping.external_port,
            external_addr: wire_addr(peer.mapping.external_addr),
        },
        remote_port: peer.remote_port,
        remote_addr: wire_addr(peer.remote_addr),
    }
}

/// Render an address the way it goes on the wire: IPv4 becomes v4-mapped.
fn wire_addr(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(addr) => addr.to_ipv6_mapped(),
        IpAddr::V6(addr) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use crate::protocol::{self, Opcode};
    use crate::test_utils::{scripted, setup_logging, ScriptedServer};

    const GATEWAY: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
    const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
    const EXTERNAL_IP: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0xFFFF, 0xC633, 0x6407);

    fn from_gateway() -> SocketAddr {
        SocketAddr::new(GATEWAY, protocol::SERVER_PORT)
    }

    fn success_response(data: OpcodeData, lifetime_seconds: u32, epoch_time: u32) -> Vec<u8> {
        Response {
            opcode: data.opcode(),
            result_code: ResultCode::Success,
            lifetime_seconds,
            epoch_time,
            data: Some(data),
            options: Vec::new(),
        }
        .encode()
    }

    /// A success map response answering `request`, with the external fields
    /// the server assigned. The request's nonce is echoed back.
    fn map_response(
        request: &[u8],
        external_port: u16,
        external_addr: Ipv6Addr,
        lifetime_seconds: u32,
        epoch_time: u32,
    ) -> Vec<u8> {
        let request = Request::decode(request);
        let OpcodeData::Map(mut data) = request.opcode_data else {
            panic!("not a map request");
        };
        data.external_port = external_port;
        data.external_addr = external_addr;
        success_response(OpcodeData::Map(data), lifetime_seconds, epoch_time)
    }

    fn peer_response(
        request: &[u8],
        external_port: u16,
        external_addr: Ipv6Addr,
        lifetime_seconds: u32,
        epoch_time: u32,
    ) -> Vec<u8> {
        let request = Request::decode(request);
        let OpcodeData::Peer(mut data) = request.opcode_data else {
            panic!("not a peer request");
        };
        data.map.external_port = external_port;
        data.map.external_addr = external_addr;
        success_response(OpcodeData::Peer(data), lifetime_seconds, epoch_time)
    }

    /// An error map response echoing the opcode data of `request`.
    fn error_map_response(request: &[u8], code: ResultCode, epoch_time: u32) -> Vec<u8> {
        let request = Request::decode(request);
        let OpcodeData::Map(data) = request.opcode_data else {
            panic!("not a map request");
        };
        Response {
            opcode: Opcode::Map,
            result_code: code,
            lifetime_seconds: 0,
            epoch_time,
            data: Some(OpcodeData::Map(data)),
            options: Vec::new(),
        }
        .encode()
    }

    /// Connect a scripted client, answering the startup announce with
    /// epoch 100, and drain the announce event.
    async fn connect() -> (Client, mpsc::Receiver<Event>, ScriptedServer) {
        let (transport, mut server) = scripted();
        let connecting = Client::with_transport(transport, GATEWAY, CLIENT_IP, Config::default());
        let script = async move {
            let request = server.request().await;
            let announce = Request::decode(&request);
            assert_eq!(announce.opcode_data, OpcodeData::Announce);
            server.reply(
                from_gateway(),
                success_response(OpcodeData::Announce, 0, 100),
            );
            server
        };
        let (connected, server) = tokio::join!(connecting, script);
        let (client, mut events) = connected.expect("failed to connect");
        assert_eq!(events.recv().await, Some(Event::ReceivedAnnounce));
        (client, events, server)
    }

    /// Add a TCP mapping for `port` and answer it with external port 49152
    /// at [`EXTERNAL_IP`]. Returns the raw request bytes.
    async fn establish_mapping(
        client: &Client,
        events: &mut mpsc::Receiver<Event>,
        server: &mut ScriptedServer,
        port: u16,
        epoch_time: u32,
    ) -> Vec<u8> {
        let add = client.add_map(Protocol::Tcp, port, 0, None, 3600);
        let script = async {
            let request = server.request().await;
            let response = map_response(&request, 49152, EXTERNAL_IP, 3600, epoch_time);
            server.reply(from_gateway(), response);
            request
        };
        let (added, request) = tokio::join!(add, script);
        added.expect("add_map failed");
        match events.recv().await {
            Some(Event::ReceivedMapping(_)) => {}
            other => panic!("expected a mapping event, got {other:?}"),
        }
        request
    }

    #[tokio::test]
    async fn announce_round_trip() {
        setup_logging();
        let (transport, mut server) = scripted();
        let connecting = Client::with_transport(transport, GATEWAY, CLIENT_IP, Config::default());
        let script = async move {
            let request = server.request().await;
            assert_eq!(request[0], 2);
            // announce opcode, response indicator clear
            assert_eq!(request[1], 0);
            assert_eq!(&request[4..8], &[0; 4]);
            assert_eq!(
                &request[8..24],
                &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 192, 0, 2, 10]
            );
            server.reply(
                from_gateway(),
                success_response(OpcodeData::Announce, 0, 100),
            );
            server
        };
        let (connected, _server) = tokio::join!(connecting, script);
        let (client, mut events) = connected.unwrap();
        assert_eq!(events.recv().await, Some(Event::ReceivedAnnounce));
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_announce_times_out() {
        let (transport, _server) = scripted();
        let err = Client::with_transport(transport, GATEWAY, CLIENT_IP, Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NetworkTimeout));
    }

    #[tokio::test]
    async fn map_success_populates_the_store() {
        setup_logging();
        let (client, mut events, mut server) = connect().await;

        let before = Instant::now();
        let add = client.add_map(Protocol::Tcp, 8080, 0, None, 3600);
        let script = async {
            let request = server.request().await;
            // protocol, reserved, internal port, external suggestion
            assert_eq!(&request[36..40], &[6, 0, 0, 0]);
            assert_eq!(&request[40..42], &[0x1F, 0x90]);
            assert_eq!(&request[42..44], &[0, 0]);
            assert_eq!(&request[44..60], &[0; 16]);
            let response = map_response(&request, 49152, EXTERNAL_IP, 3600, 101);
            server.reply(from_gateway(), response);
        };
        let (added, ()) = tokio::join!(add, script);
        added.unwrap();

        let Some(Event::ReceivedMapping(mapping)) = events.recv().await else {
            panic!("expected a mapping event");
        };
        let stored = client.mapping(8080).await.unwrap().expect("mapping stored");
        assert_eq!(stored, mapping);
        assert!(stored.active);
        assert_eq!(stored.protocol, Protocol::Tcp);
        assert_eq!(stored.external_port, 49152);
        assert_eq!(
            stored.external_addr,
            "198.51.100.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(stored.lifetime_seconds, 3600);
        // first refresh lands between half and five eighths of the lifetime
        assert_eq!(stored.refresh.attempt, 0);
        let delay = stored.refresh.time.duration_since(before).as_secs();
        assert!((1800..2252).contains(&delay), "refresh in {delay}s");

        client.close().await;
    }

    #[tokio::test]
    async fn epoch_reset_resends_active_mappings() {
        let (client, mut events, mut server) = connect().await;
        let request = establish_mapping(&client, &mut events, &mut server, 8080, 101).await;

        // a later response whose epoch collapsed: the server restarted
        server.reply(from_gateway(), map_response(&request, 49152, EXTERNAL_IP, 3600, 5));

        // the engine re-sends the stored mapping with its current values
        let resent = server.request().await;
        let resent = Request::decode(&resent);
        assert_eq!(resent.lifetime_seconds, 3600);
        let OpcodeData::Map(data) = resent.opcode_data else {
            panic!("expected a map request");
        };
        assert_eq!(data.internal_port, 8080);
        assert_eq!(data.external_port, 49152);
        assert_eq!(data.external_addr, EXTERNAL_IP);
    }

    #[tokio::test]
    async fn peer_delete_removes_the_mapping() {
        let (client, mut events, mut server) = connect().await;

        let add = client.add_peer(
            Protocol::Udp,
            5060,
            0,
            None,
            9000,
            "203.0.113.4".parse().unwrap(),
            600,
        );
        let script = async {
            let request = server.request().await;
            let response = peer_response(&request, 40000, EXTERNAL_IP, 600, 101);
            server.reply(from_gateway(), response);
        };
        let (added, ()) = tokio::join!(add, script);
        added.unwrap();
        let Some(Event::ReceivedPeer(peer)) = events.recv().await else {
            panic!("expected a peer event");
        };
        assert!(peer.mapping.active);
        assert_eq!(peer.remote_port, 9000);
        assert_eq!(peer.remote_addr, "203.0.113.4".parse::<IpAddr>().unwrap());

        let delete = client.delete_peer(5060);
        let script = async {
            let request = server.request().await;
            // lifetime 0, remote endpoint of the stored mapping
            assert_eq!(&request[4..8], &[0; 4]);
            assert_eq!(&request[60..62], &9000u16.to_be_bytes());
            assert_eq!(
                &request[64..80],
                &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 203, 0, 113, 4]
            );
            let response = peer_response(&request, 40000, EXTERNAL_IP, 0, 102);
            server.reply(from_gateway(), response);
        };
        let (deleted, ()) = tokio::join!(delete, script);
        deleted.unwrap();

        assert_eq!(client.peer_mapping(5060).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_requests_touch_neither_store_nor_wire() {
        let (client, _events, mut server) = connect().await;

        let err = client
            .add_map(Protocol::Tcp, 0, 0, None, 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortNotSpecified));
        assert_eq!(client.mapping(0).await.unwrap(), None);

        let err = client
            .add_peer(
                Protocol::Udp,
                5060,
                0,
                None,
                9000,
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                600,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAddress));
        assert_eq!(client.peer_mapping(5060).await.unwrap(), None);

        // nothing was sent: the next datagram on the wire is a later add
        let add = client.add_map(Protocol::Tcp, 8080, 0, None, 3600);
        let script = async {
            let request = Request::decode(&server.request().await);
            let OpcodeData::Map(data) = request.opcode_data else {
                panic!("expected a map request");
            };
            assert_eq!(data.internal_port, 8080);
        };
        let (added, ()) = tokio::join!(add, script);
        added.unwrap();
    }

    #[tokio::test]
    async fn foreign_datagrams_are_dropped() {
        let (client, mut events, mut server) = connect().await;

        // valid bytes, wrong source: silently dropped
        let foreign: SocketAddr = "203.0.113.9:5351".parse().unwrap();
        server.reply(foreign, success_response(OpcodeData::Announce, 0, 101));

        establish_mapping(&client, &mut events, &mut server, 8080, 101).await;
        // the mapping event was the first event published: the foreign
        // announce produced neither an event nor a store mutation
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_adds_keep_one_entry() {
        let (client, _events, mut server) = connect().await;

        for _ in 0..2 {
            let add = client.add_map(Protocol::Tcp, 8080, 0, None, 3600);
            let script = server.request();
            let (added, request) = tokio::join!(add, script);
            added.unwrap();
            let request = Request::decode(&request);
            assert!(matches!(request.opcode_data, OpcodeData::Map(_)));
        }

        let mapping = client.mapping(8080).await.unwrap().expect("one entry");
        assert!(!mapping.active);
    }

    #[tokio::test]
    async fn short_lifetimes_are_clamped() {
        let (client, _events, mut server) = connect().await;

        let add = client.add_map(Protocol::Udp, 7000, 0, None, 60);
        let script = server.request();
        let (added, request) = tokio::join!(add, script);
        added.unwrap();
        assert_eq!(Request::decode(&request).lifetime_seconds, 120);
    }

    #[tokio::test]
    async fn external_address_probe() {
        let (client, mut events, mut server) = connect().await;

        let probe = client.external_address();
        let script = async {
            let request = server.request().await;
            let decoded = Request::decode(&request);
            // a 30 second discard-port mapping, exempt from the clamp
            assert_eq!(decoded.lifetime_seconds, 30);
            let OpcodeData::Map(data) = decoded.opcode_data else {
                panic!("expected a map request");
            };
            assert_eq!(data.internal_port, 9);
            assert_eq!(data.protocol, Protocol::Udp);
            let response = map_response(&request, 51820, EXTERNAL_IP, 30, 101);
            server.reply(from_gateway(), response);
        };
        let (addr, ()) = tokio::join!(probe, script);
        assert_eq!(addr.unwrap(), "198.51.100.7".parse::<IpAddr>().unwrap());

        // the probe mapping is gone, but its event was still published
        assert!(matches!(
            events.recv().await,
            Some(Event::ReceivedMapping(_))
        ));
        assert_eq!(client.mapping(9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresh_of_unknown_port_fails() {
        let (client, _events, _server) = connect().await;
        assert!(matches!(
            client.refresh_map(4242, 600).await,
            Err(Error::MappingNotFound)
        ));
        assert!(matches!(
            client.refresh_peer(4242, 600).await,
            Err(Error::MappingNotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_with_zero_lifetime_deletes() {
        let (client, mut events, mut server) = connect().await;
        establish_mapping(&client, &mut events, &mut server, 8080, 101).await;

        let refresh = client.refresh_map(8080, 0);
        let script = async {
            let request = server.request().await;
            assert_eq!(&request[4..8], &[0; 4]);
            let response = map_response(&request, 49152, EXTERNAL_IP, 0, 102);
            server.reply(from_gateway(), response);
        };
        let (refreshed, ()) = tokio::join!(refresh, script);
        refreshed.unwrap();

        // the confirming response removes the entry and is published
        assert!(matches!(
            events.recv().await,
            Some(Event::ReceivedMapping(_))
        ));
        assert_eq!(client.mapping(8080).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failure_bumps_the_retry_attempt() {
        let (client, mut events, mut server) = connect().await;
        let request = establish_mapping(&client, &mut events, &mut server, 8080, 101).await;

        server.reply(
            from_gateway(),
            error_map_response(&request, ResultCode::NoResources, 102),
        );
        // an announce right after guarantees the failure was processed
        server.reply(from_gateway(), success_response(OpcodeData::Announce, 0, 102));
        assert_eq!(events.recv().await, Some(Event::ReceivedAnnounce));

        let mapping = client.mapping(8080).await.unwrap().expect("preserved");
        assert!(mapping.active);
        assert_eq!(mapping.refresh.attempt, 1);
    }

    #[tokio::test]
    async fn failed_delete_surfaces_the_result_code() {
        let (client, mut events, mut server) = connect().await;
        establish_mapping(&client, &mut events, &mut server, 8080, 101).await;

        let delete = client.delete_map(8080);
        let script = async {
            let request = server.request().await;
            let response = error_map_response(&request, ResultCode::NotAuthorized, 102);
            server.reply(from_gateway(), response);
        };
        let (deleted, ()) = tokio::join!(delete, script);
        assert!(matches!(
            deleted,
            Err(Error::Result(ResultCode::NotAuthorized))
        ));

        // the mapping survives the failed delete
        assert!(client.mapping(8080).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_of_unknown_port_is_a_no_op() {
        let (client, _events, _server) = connect().await;
        client.delete_map(4242).await.unwrap();
        client.delete_peer(4242).await.unwrap();
    }

    #[tokio::test]
    async fn close_emits_a_final_event() {
        let (client, mut events, _server) = connect().await;
        client.close().await;
        assert_eq!(events.recv().await, Some(Event::Close));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn incompatible_server_version_is_fatal() {
        let (client, mut events, server) = connect().await;

        // a version 1 header; everything else is irrelevant
        let mut stale = vec![0u8; Response::HEADER_SIZE];
        stale[0] = 1;
        stale[1] = Response::RESPONSE_INDICATOR;
        server.reply(from_gateway(), stale);

        assert_eq!(events.recv().await, Some(Event::Close));
        assert_eq!(events.recv().await, None);
        // the service is gone; calls resolve to closed
        assert!(matches!(client.mapping(8080).await, Err(Error::Closed)));
    }
}
