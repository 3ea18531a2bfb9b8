//! The event loop
//!
//! One task owns all mutable state: the peer table, the learned-address
//! table, the timer queue. Sockets, the tunnel device, the resolver and
//! the verify hook feed it through channels; nothing else mutates a peer.
//! Incoming datagrams are demultiplexed on their leading byte: data
//! packets go to the session layer, handshake packets to the key-exchange
//! state machine.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::buffer::Buffer;
use crate::config::{Config, ConfigError, PeerConfig};
use crate::eth::EthAddrTable;
use crate::handshake::fhmqvc::{
    confirmation_tag, derive_keys, verify_confirmation_tag, AcceptedHandshake, IdentityKey,
    InitiatedHandshake, Role,
};
use crate::handshake::records::{RecordType, ReplyCode};
use crate::handshake::{
    build_error_reply, build_finish, build_init, build_response, HandshakeContext, HandshakeError,
    HandshakePacket, HANDSHAKE_FINISH, HANDSHAKE_INIT, HANDSHAKE_RESPONSE,
};
use crate::hooks::{run_hook, spawn_verify, HookEnv, VerifyCache, VerifyReply};
use crate::iface::TunnelDevice;
use crate::method::{create_method, MethodError};
use crate::peer::{Peer, PeerId, PeerInfo, PeerState, Session};
use crate::resolve::{spawn_resolver, ResolveReply, ResolveRequest};
use crate::socket::{bind_sockets, spawn_readers, InboundDatagram};
use crate::types::{key_fingerprint, EthAddr, Mode, PacketType, PublicKeyBytes};

/// Datagrams queued from the socket readers to the loop.
const DATAGRAM_QUEUE: usize = 256;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
}

/// External control of a running daemon.
pub enum Command {
    Shutdown,
    /// Swap in a freshly scanned peer set (reload).
    ReloadPeers(Vec<PeerConfig>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    HandshakeRetry,
    Keepalive,
}

/// Timer queue entry; the heap orders by deadline first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    at: Instant,
    peer: PeerId,
    kind: TimerKind,
}

pub struct Daemon {
    config: Arc<Config>,
    identity: IdentityKey,
    sockets: Vec<Arc<UdpSocket>>,
    device: TunnelDevice,

    peers: HashMap<PeerId, Peer>,
    by_key: HashMap<PublicKeyBytes, PeerId>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_peer_id: u64,

    eth_table: EthAddrTable,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    verify_cache: VerifyCache,

    datagram_rx: mpsc::Receiver<InboundDatagram>,
    resolve_tx: mpsc::Sender<ResolveRequest>,
    resolve_rx: mpsc::Receiver<ResolveReply>,
    verify_tx: mpsc::Sender<VerifyReply>,
    verify_rx: mpsc::Receiver<VerifyReply>,
}

impl Daemon {
    pub async fn new(config: Arc<Config>, device: TunnelDevice) -> Result<Daemon, DaemonError> {
        config.validate()?;
        let secret = config.secret.ok_or(ConfigError::NoSecret)?;
        let identity = IdentityKey::from_secret_bytes(secret);

        let sockets = bind_sockets(&config.bind_addrs).await?;
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE);
        spawn_readers(&sockets, datagram_tx);

        let (resolve_tx, resolve_rx) = spawn_resolver();
        let (verify_tx, verify_rx) = mpsc::channel(32);

        let mut daemon = Daemon {
            config: config.clone(),
            identity,
            sockets,
            device,
            peers: HashMap::new(),
            by_key: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer_id: 1,
            eth_table: EthAddrTable::new(),
            timers: BinaryHeap::new(),
            verify_cache: VerifyCache::new(),
            datagram_rx,
            resolve_tx,
            resolve_rx,
            verify_tx,
            verify_rx,
        };

        let now = Instant::now();
        for peer_config in config.peers.clone() {
            daemon.create_peer(peer_config, false, now);
        }

        info!(
            "ready: {} mode, {} peers, identity {}",
            config.mode,
            daemon.peers.len(),
            key_fingerprint(&daemon.identity.public_bytes())
        );
        Ok(daemon)
    }

    /// Our identity public key.
    pub fn public_key(&self) -> PublicKeyBytes {
        self.identity.public_bytes()
    }

    /// Local address of the first socket (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.sockets[0].local_addr()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.values().map(PeerInfo::from).collect()
    }

    // =========================================================================
    // MAIN LOOP
    // =========================================================================

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Kick off connection attempts to everyone with a known endpoint.
        let now = Instant::now();
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.trigger_handshake(id, now).await;
        }

        loop {
            let deadline = self.timers.peek().map(|Reverse(entry)| entry.at);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(Command::ReloadPeers(peers)) => self.apply_peer_configs(peers).await,
                },
                Some(datagram) = self.datagram_rx.recv() => {
                    self.handle_datagram(datagram).await;
                }
                Some(frame) = self.device.read_frame() => {
                    self.handle_tunnel_frame(frame).await;
                }
                Some(reply) = self.resolve_rx.recv() => {
                    self.handle_resolve_reply(reply).await;
                }
                Some(reply) = self.verify_rx.recv() => {
                    self.handle_verify_reply(reply);
                }
                _ = maintenance.tick() => {
                    self.maintenance().await;
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.run_timers().await;
                }
            }
        }

        self.shutdown();
    }

    fn schedule(&mut self, at: Instant, peer: PeerId, kind: TimerKind) {
        self.timers.push(Reverse(TimerEntry { at, peer, kind }));
    }

    async fn run_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timers.peek().copied() {
            if entry.at > now {
                break;
            }
            self.timers.pop();
            if !self.peers.contains_key(&entry.peer) {
                continue;
            }
            match entry.kind {
                TimerKind::HandshakeRetry => self.handshake_retry(entry.peer, now).await,
                TimerKind::Keepalive => self.keepalive_due(entry.peer, now).await,
            }
        }
    }

    // =========================================================================
    // PEER TABLE
    // =========================================================================

    fn create_peer(&mut self, config: PeerConfig, dynamic: bool, now: Instant) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let peer = Peer::new(id, config, dynamic, now);
        self.by_key.insert(peer.config.key, id);
        if let Some(addr) = peer.address {
            self.by_addr.insert(addr, id);
        }
        debug!("peer {} added ({})", peer.log_name(), if dynamic { "dynamic" } else { "static" });
        self.peers.insert(id, peer);
        id
    }

    fn remove_peer(&mut self, id: PeerId) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        if peer.is_established() {
            self.disestablish_hook(&peer);
        }
        self.by_key.remove(&peer.config.key);
        if let Some(addr) = peer.address {
            if self.by_addr.get(&addr) == Some(&id) {
                self.by_addr.remove(&addr);
            }
        }
        self.eth_table.purge_peer(id);
        info!("peer {} removed", peer.log_name());
    }

    /// Reload: diff the freshly scanned peer set against the running one.
    /// Peers whose source file vanished or whose contents changed are
    /// replaced; unchanged peers keep their sessions.
    async fn apply_peer_configs(&mut self, new_configs: Vec<PeerConfig>) {
        let now = Instant::now();

        if new_configs.is_empty() && self.peers.values().any(|p| !p.dynamic) {
            warn!("peer reload removes all configured peers");
        }

        let mut new_by_key: HashMap<PublicKeyBytes, PeerConfig> =
            new_configs.into_iter().map(|c| (c.key, c)).collect();

        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| !peer.dynamic)
            .filter(|peer| match new_by_key.get(&peer.config.key) {
                None => true,
                Some(new) => {
                    new.remotes != peer.config.remotes || new.floating != peer.config.floating
                }
            })
            .map(|peer| peer.id)
            .collect();

        for id in stale {
            self.remove_peer(id);
        }

        let mut added = Vec::new();
        for (key, config) in new_by_key.drain() {
            if !self.by_key.contains_key(&key) {
                added.push(self.create_peer(config, false, now));
            }
        }
        for id in added {
            self.trigger_handshake(id, now).await;
        }
    }

    // =========================================================================
    // INBOUND DATAGRAMS
    // =========================================================================

    async fn handle_datagram(&mut self, datagram: InboundDatagram) {
        let Some(&first) = datagram.data.first() else {
            return;
        };
        match PacketType::from_byte(first) {
            Some(PacketType::Data) => {
                self.handle_data(datagram.from, &datagram.data[1..]).await;
            }
            Some(PacketType::Handshake) => {
                self.handle_handshake(datagram.socket, datagram.from, &datagram.data[1..])
                    .await;
            }
            None => {
                debug!("unknown packet type {:#x} from {}", first, datagram.from);
            }
        }
    }

    async fn handle_data(&mut self, from: SocketAddr, packet: &[u8]) {
        let now = Instant::now();

        if let Some(&id) = self.by_addr.get(&from) {
            let result = match self.peers.get_mut(&id) {
                Some(peer) => peer.decrypt(packet, now),
                None => return,
            };
            match result {
                Ok(decrypted) => {
                    self.deliver(id, from, decrypted.payload.into_vec(), decrypted.reordered, now)
                        .await;
                }
                Err(err) => {
                    debug!("dropping data packet from {}: {}", from, err);
                }
            }
            return;
        }

        // Unknown source address: a floating peer may have moved. The
        // session MAC decides which peer, so forged packets cannot move
        // anyone.
        if self.config.mode == Mode::Tun {
            debug!("data packet from unknown address {}", from);
            return;
        }
        let candidates: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.config.floating && peer.session().is_some())
            .map(|peer| peer.id)
            .collect();
        for id in candidates {
            let result = match self.peers.get_mut(&id) {
                Some(peer) => peer.decrypt(packet, now),
                None => continue,
            };
            if let Ok(decrypted) = result {
                self.deliver(id, from, decrypted.payload.into_vec(), decrypted.reordered, now)
                    .await;
                return;
            }
        }
        debug!("data packet from unknown address {}", from);
    }

    /// A packet authenticated: account it, roam if needed, hand the frame
    /// to the forwarding plane.
    async fn deliver(
        &mut self,
        id: PeerId,
        from: SocketAddr,
        frame: Vec<u8>,
        reordered: bool,
        now: Instant,
    ) {
        let (roamed_from, learn) = {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            peer.last_rx = now;

            let roamed_from = if peer.address != Some(from) {
                let old = peer.address;
                peer.address = Some(from);
                Some(old)
            } else {
                None
            };

            let learn = if self.config.mode == Mode::Tap && !frame.is_empty() {
                EthAddr::source(&frame)
            } else {
                None
            };
            (roamed_from, learn)
        };

        if let Some(old) = roamed_from {
            if let Some(old_addr) = old {
                if self.by_addr.get(&old_addr) == Some(&id) {
                    self.by_addr.remove(&old_addr);
                }
            }
            self.by_addr.insert(from, id);
            if let Some(peer) = self.peers.get(&id) {
                info!("peer {} roamed to {}", peer.log_name(), from);
            }
        }

        if frame.is_empty() {
            trace!("keepalive from peer {}", id);
            return;
        }

        if let Some(source) = learn {
            if !source.is_multicast() {
                self.eth_table.learn(source, id, now);
            }
        }

        if reordered {
            trace!("delivering reordered frame from peer {}", id);
        }
        self.device.write_frame(frame).await;
    }

    // =========================================================================
    // FORWARDING PLANE (TUNNEL -> PEERS)
    // =========================================================================

    async fn handle_tunnel_frame(&mut self, frame: Vec<u8>) {
        let now = Instant::now();
        match self.config.mode {
            Mode::Tun => {
                let Some(&id) = self.peers.keys().next() else {
                    return;
                };
                self.send_to_peer(id, &frame, now).await;
            }
            Mode::Tap => {
                let Some(dst) = EthAddr::destination(&frame) else {
                    debug!("dropping malformed frame from tunnel device");
                    return;
                };
                if !dst.is_multicast() {
                    if let Some(id) =
                        self.eth_table.lookup(&dst, now, self.config.eth_addr_stale_time)
                    {
                        self.send_to_peer(id, &frame, now).await;
                        return;
                    }
                }
                // Broadcast, multicast, or unknown destination: every
                // established peer gets a copy.
                let established: Vec<PeerId> = self
                    .peers
                    .values()
                    .filter(|peer| peer.is_established())
                    .map(|peer| peer.id)
                    .collect();
                for id in established {
                    self.send_to_peer(id, &frame, now).await;
                }
            }
        }
    }

    async fn send_to_peer(&mut self, id: PeerId, frame: &[u8], now: Instant) {
        let (packet, target, refresh) = {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            if !peer.is_established() {
                // No session yet: the pending traffic is the trigger.
                drop(peer);
                self.trigger_handshake(id, now).await;
                return;
            }
            let Some(target) = peer.address else {
                return;
            };
            let Some(session) = peer.session() else {
                return;
            };
            let space = session.space;
            // One extra head byte for the packet-type prefix.
            let buffer = Buffer::from_slice(frame, space.encrypt_head + 1, space.encrypt_tail);
            match peer.encrypt(buffer) {
                Ok(mut packet) => {
                    packet.push_head(&[PacketType::Data as u8]);
                    peer.last_tx = now;
                    (packet.into_vec(), target, peer.want_refresh(now))
                }
                Err(MethodError::NonceExhausted) => {
                    warn!("peer {}: nonce space exhausted, rekeying", peer.log_name());
                    drop(peer);
                    self.trigger_handshake(id, now).await;
                    return;
                }
                Err(err) => {
                    debug!("encrypt failed for peer {}: {}", id, err);
                    return;
                }
            }
        };

        self.send_packet(0, target, &packet).await;
        if refresh {
            self.trigger_handshake(id, now).await;
        }
    }

    async fn send_packet(&self, socket: usize, target: SocketAddr, packet: &[u8]) {
        if let Err(e) = self.sockets[socket].send_to(packet, target).await {
            warn!("send to {} failed: {}", target, e);
        }
    }

    // =========================================================================
    // HANDSHAKE DRIVING
    // =========================================================================

    fn handshake_context(&self) -> HandshakeContext {
        HandshakeContext {
            mode: self.config.mode,
            mtu: self.config.mtu,
            our_key: self.identity.public_bytes(),
        }
    }

    /// Start (or continue) a key exchange towards a peer. Triggers:
    /// explicit connect, pending tunnel traffic, refresh deadlines, and
    /// handshakes received from the peer.
    async fn trigger_handshake(&mut self, id: PeerId, now: Instant) {
        let (packet, target) = {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            if peer.initiated.is_some() {
                return;
            }
            let Some(target) = peer.address else {
                self.request_resolve(id, now);
                return;
            };
            // Failed attempts stretch the gate exponentially.
            let gate = self.config.min_handshake_interval
                * 2u32.saturating_pow(peer.handshake_backoff.min(5));
            if !peer.may_handshake(target, now, gate) {
                return;
            }

            let attempt = InitiatedHandshake::new(target, now, self.config.min_handshake_interval);
            let packet = build_init(
                &HandshakeContext {
                    mode: self.config.mode,
                    mtu: self.config.mtu,
                    our_key: self.identity.public_bytes(),
                },
                Some(&peer.config.key),
                &attempt.eph.public_bytes(),
            );
            peer.note_handshake(target, now);
            peer.initiated = Some(attempt);
            if peer.state == PeerState::Inactive {
                peer.state = PeerState::Handshake;
            }
            debug!("starting handshake with peer {}", peer.log_name());
            (packet, target)
        };

        run_hook(
            &self.config.hooks.on_connect,
            self.hook_env_for(id),
        );
        self.send_packet(0, target, &packet).await;
        self.schedule(
            now + self.config.min_handshake_interval,
            id,
            TimerKind::HandshakeRetry,
        );
    }

    async fn handshake_retry(&mut self, id: PeerId, now: Instant) {
        let action = {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            let Some(attempt) = peer.initiated.as_mut() else {
                return;
            };
            if attempt.exhausted() {
                warn!("handshake with peer {} timed out", peer.log_name());
                peer.initiated = None;
                peer.handshake_backoff = peer.handshake_backoff.saturating_add(1);
                if peer.state == PeerState::Handshake {
                    peer.state = PeerState::Inactive;
                }
                None
            } else if attempt.should_retry(now, self.config.min_handshake_interval) {
                let target = attempt.remote;
                let eph = attempt.eph.public_bytes();
                let key = peer.config.key;
                Some((target, eph, key))
            } else {
                None
            }
        };

        if let Some((target, eph, key)) = action {
            let packet = build_init(&self.handshake_context(), Some(&key), &eph);
            self.send_packet(0, target, &packet).await;
            self.schedule(
                now + self.config.min_handshake_interval,
                id,
                TimerKind::HandshakeRetry,
            );
        }
    }

    async fn handle_handshake(&mut self, socket: usize, from: SocketAddr, data: &[u8]) {
        let now = Instant::now();

        let packet = match crate::handshake::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("malformed handshake from {}: {}", from, err);
                return;
            }
        };

        // Error replies terminate the attempt; nothing to answer.
        if let Some((code, detail)) = packet.error_reply() {
            self.handle_error_reply(&packet, from, code, detail);
            return;
        }

        let sender_key = match packet.require_key(RecordType::SenderKey) {
            Ok(key) => key,
            Err(err) => {
                self.reply_error(socket, from, &packet, &err).await;
                return;
            }
        };
        if sender_key == self.identity.public_bytes() {
            debug!("dropping handshake from ourselves");
            return;
        }

        // Addressed to some other identity (or anonymous when secure
        // handshakes require one): not for us.
        match packet.records.get_key(RecordType::RecipientKey) {
            Some(recipient) if recipient != self.identity.public_bytes() => {
                debug!("handshake from {} for another identity", from);
                return;
            }
            None if self.config.secure_handshakes
                && packet.handshake_type == HANDSHAKE_INIT =>
            {
                debug!("ignoring anonymous handshake from {}", from);
                return;
            }
            _ => {}
        }

        if let Err(err) = packet.validate_common(self.config.mode, self.config.mtu) {
            warn!("unacceptable handshake from {}: {}", from, err);
            self.reply_error(socket, from, &packet, &err).await;
            return;
        }

        let Some(&id) = self.by_key.get(&sender_key) else {
            self.handle_unknown_sender(sender_key, from, now);
            return;
        };

        match packet.handshake_type {
            HANDSHAKE_INIT => self.handle_init(id, socket, from, &packet, now).await,
            HANDSHAKE_RESPONSE => self.handle_response(id, socket, from, &packet, now).await,
            HANDSHAKE_FINISH => self.handle_finish(id, socket, from, &packet, now).await,
            _ => {}
        }
    }

    fn handle_error_reply(
        &mut self,
        packet: &HandshakePacket,
        from: SocketAddr,
        code: ReplyCode,
        detail: Option<u8>,
    ) {
        let Ok(sender_key) = packet.require_key(RecordType::SenderKey) else {
            return;
        };
        let Some(&id) = self.by_key.get(&sender_key) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&id) {
            warn!(
                "peer {} rejected our handshake from {}: {:?} (record {:?})",
                peer.log_name(),
                from,
                code,
                detail
            );
            peer.initiated = None;
            peer.handshake_backoff = peer.handshake_backoff.saturating_add(1);
            if peer.state == PeerState::Handshake {
                peer.state = PeerState::Inactive;
            }
        }
    }

    async fn reply_error(
        &self,
        socket: usize,
        from: SocketAddr,
        packet: &HandshakePacket,
        err: &HandshakeError,
    ) {
        // A reply to a Finish would carry a stage number out of range;
        // there is no fourth message, so there is nobody to inform.
        if packet.handshake_type >= HANDSHAKE_FINISH {
            return;
        }
        let reply = build_error_reply(
            &self.handshake_context(),
            packet.handshake_type,
            err.reply_code(),
            err.detail(),
        );
        self.send_packet(socket, from, &reply).await;
    }

    /// Handshake from a key we do not know. With a verify hook the peer
    /// may be admitted dynamically; its retry will pass once the verdict
    /// is cached.
    fn handle_unknown_sender(&mut self, key: PublicKeyBytes, from: SocketAddr, now: Instant) {
        let Some(command) = self.config.hooks.on_verify.clone() else {
            debug!("handshake from unknown key {} at {}", key_fingerprint(&key), from);
            return;
        };

        match self.verify_cache.lookup(&key, now, self.config.verify_valid_time) {
            Some(true) => {
                let config = PeerConfig {
                    name: None,
                    key,
                    remotes: Vec::new(),
                    floating: true,
                    group: self.config.peer_group.name.clone(),
                    source: None,
                };
                let id = self.create_peer(config, true, now);
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.address = Some(from);
                }
                self.by_addr.insert(from, id);
                info!("peer {} admitted by verify hook", key_fingerprint(&key));
            }
            Some(false) => {
                debug!("verify hook denied {}", key_fingerprint(&key));
            }
            None => {
                if !self.verify_cache.may_verify(from, now, self.config.min_verify_interval) {
                    return;
                }
                spawn_verify(
                    &command,
                    HookEnv {
                        interface: self.config.interface.clone(),
                        peer_key: Some(key),
                        peer_address: Some(from),
                    },
                    key,
                    from,
                    self.verify_tx.clone(),
                );
            }
        }
    }

    fn handle_verify_reply(&mut self, reply: VerifyReply) {
        let now = Instant::now();
        self.verify_cache.store(reply.key, reply.allowed, now);
        if reply.allowed {
            // Admission happens when the peer's next handshake arrives.
            debug!("verify verdict cached for {}", key_fingerprint(&reply.key));
        }
    }

    /// Established dynamic connections in a peer group.
    fn group_connections(&self, group: &str) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.dynamic && peer.is_established() && peer.config.group == group)
            .count()
    }

    async fn handle_init(
        &mut self,
        id: PeerId,
        socket: usize,
        from: SocketAddr,
        packet: &HandshakePacket,
        now: Instant,
    ) {
        let peer_eph = match packet.require_key(RecordType::SenderEphemeral) {
            Ok(key) => key,
            Err(err) => {
                self.reply_error(socket, from, packet, &err).await;
                return;
            }
        };

        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let peer_key = peer.config.key;
        let peer_group = peer.config.group.clone();
        let gate_open = peer.may_handshake(from, now, self.config.min_handshake_interval);
        let check_group = peer.dynamic && !peer.is_established();

        if check_group {
            let at_cap = match self.config.peer_group.find(&peer_group) {
                Some(group) => match group.max_connections {
                    Some(max) => self.group_connections(&peer_group) >= max,
                    None => false,
                },
                None => false,
            };
            if at_cap {
                warn!("rejecting handshake: peer group `{}` connection limit reached", peer_group);
                return;
            }
        }
        if !gate_open {
            debug!("handshake from {} rate-limited", from);
            return;
        }

        let accepted = AcceptedHandshake {
            eph: crate::handshake::fhmqvc::EphemeralKey::generate(),
            peer_eph,
            remote: from,
            started: now,
        };

        // Confirmation tag only; the session key waits for the method
        // named in the Finish.
        let Some(keys) =
            derive_keys(Role::Responder, &self.identity, &accepted.eph, &peer_key, &peer_eph, 0)
        else {
            debug!("degenerate handshake key from {}", from);
            return;
        };
        let tag = confirmation_tag(&keys, Role::Responder);

        let reply = build_response(
            &self.handshake_context(),
            &peer_key,
            &accepted.eph.public_bytes(),
            &peer_eph,
            &tag,
        );

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.note_handshake(from, now);
            peer.accepting = Some(accepted);
            if peer.state == PeerState::Inactive {
                peer.state = PeerState::Handshake;
            }
            debug!("answering handshake from peer {}", peer.log_name());
        }
        self.send_packet(socket, from, &reply).await;
    }

    async fn handle_response(
        &mut self,
        id: PeerId,
        socket: usize,
        from: SocketAddr,
        packet: &HandshakePacket,
        now: Instant,
    ) {
        let (peer_eph, echoed) = match (
            packet.require_key(RecordType::SenderEphemeral),
            packet.require_key(RecordType::RecipientEphemeral),
        ) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => {
                self.reply_error(socket, from, packet, &err).await;
                return;
            }
        };
        let Some(wire_tag) = packet.records.get(RecordType::ConfirmationTag) else {
            let err = HandshakeError::MissingRecord(RecordType::ConfirmationTag);
            self.reply_error(socket, from, packet, &err).await;
            return;
        };
        let wire_tag = wire_tag.to_vec();

        let method_name = self.config.methods[0].clone();
        let Ok(provider) = create_method(&method_name, &self.config.impl_selection) else {
            return;
        };

        let derived = {
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            let Some(attempt) = peer.initiated.as_ref() else {
                debug!("unexpected handshake response from {}", from);
                return;
            };
            if attempt.eph.public_bytes() != echoed {
                debug!("handshake response from {} echoes a stale exchange", from);
                return;
            }
            derive_keys(
                Role::Initiator,
                &self.identity,
                &attempt.eph,
                &peer.config.key,
                &peer_eph,
                provider.key_length(),
            )
        };
        let Some(keys) = derived else {
            debug!("degenerate handshake key from {}", from);
            return;
        };

        if !verify_confirmation_tag(&keys, Role::Responder, &wire_tag) {
            warn!("handshake response from {} failed authentication", from);
            return;
        }

        let finish = {
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            let Some(attempt) = peer.initiated.as_ref() else {
                return;
            };
            build_finish(
                &self.handshake_context(),
                &peer.config.key,
                &attempt.eph.public_bytes(),
                &peer_eph,
                &confirmation_tag(&keys, Role::Initiator),
                &method_name,
            )
        };
        self.send_packet(socket, from, &finish).await;

        let Some(state) =
            provider.session_init(keys.material(), true, now, &self.config.session_timing())
        else {
            warn!("method `{}` rejected the negotiated key", method_name);
            return;
        };
        let session = Session { method: method_name, space: provider.space(), state };
        self.establish(id, session, from, now);
    }

    async fn handle_finish(
        &mut self,
        id: PeerId,
        socket: usize,
        from: SocketAddr,
        packet: &HandshakePacket,
        now: Instant,
    ) {
        let (peer_eph, echoed) = match (
            packet.require_key(RecordType::SenderEphemeral),
            packet.require_key(RecordType::RecipientEphemeral),
        ) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => {
                self.reply_error(socket, from, packet, &err).await;
                return;
            }
        };
        let Some(wire_tag) = packet.records.get(RecordType::ConfirmationTag) else {
            let err = HandshakeError::MissingRecord(RecordType::ConfirmationTag);
            self.reply_error(socket, from, packet, &err).await;
            return;
        };
        let wire_tag = wire_tag.to_vec();

        let Some(method_name) = packet.records.get_str(RecordType::MethodName) else {
            let err = HandshakeError::MissingRecord(RecordType::MethodName);
            self.reply_error(socket, from, packet, &err).await;
            return;
        };
        if !self.config.methods.iter().any(|m| m == method_name) {
            let err = HandshakeError::UnacceptableValue(RecordType::MethodName);
            warn!("peer at {} proposed unconfigured method `{}`", from, method_name);
            self.reply_error(socket, from, packet, &err).await;
            return;
        }
        let method_name = method_name.to_string();
        let Ok(provider) = create_method(&method_name, &self.config.impl_selection) else {
            return;
        };

        let derived = {
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            let Some(accepted) = peer.accepting.as_ref() else {
                debug!("unexpected handshake finish from {}", from);
                return;
            };
            if accepted.eph.public_bytes() != echoed || accepted.peer_eph != peer_eph {
                debug!("handshake finish from {} echoes a stale exchange", from);
                return;
            }
            derive_keys(
                Role::Responder,
                &self.identity,
                &accepted.eph,
                &peer.config.key,
                &peer_eph,
                provider.key_length(),
            )
        };
        let Some(keys) = derived else {
            return;
        };

        if !verify_confirmation_tag(&keys, Role::Initiator, &wire_tag) {
            warn!("handshake finish from {} failed authentication", from);
            return;
        }

        let Some(state) =
            provider.session_init(keys.material(), false, now, &self.config.session_timing())
        else {
            warn!("method `{}` rejected the negotiated key", method_name);
            return;
        };
        let session = Session { method: method_name, space: provider.space(), state };
        self.establish(id, session, from, now);
    }

    fn establish(&mut self, id: PeerId, session: Session, from: SocketAddr, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let old_addr = peer.address;
        let was_established = peer.is_established();
        peer.install_session(session, now);
        peer.address = Some(from);
        let name = peer.log_name();
        let method = peer.session().map(|s| s.method.clone()).unwrap_or_default();

        if old_addr != Some(from) {
            if let Some(old) = old_addr {
                if self.by_addr.get(&old) == Some(&id) {
                    self.by_addr.remove(&old);
                }
            }
        }
        self.by_addr.insert(from, id);

        info!("connection with {} established ({} via {})", name, method, from);
        run_hook(&self.config.hooks.on_establish, self.hook_env_for(id));
        // Rekeys keep the existing keepalive chain alive.
        if !was_established {
            self.schedule(now + self.config.keepalive_timeout, id, TimerKind::Keepalive);
        }
    }

    // =========================================================================
    // TIMED WORK
    // =========================================================================

    async fn keepalive_due(&mut self, id: PeerId, now: Instant) {
        let send = {
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            if !peer.is_established() {
                return;
            }
            now.duration_since(peer.last_tx) >= self.config.keepalive_timeout
        };

        if send {
            trace!("sending keepalive to peer {}", id);
            self.send_to_peer(id, &[], now).await;
        }

        let next = {
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            peer.last_tx + self.config.keepalive_timeout
        };
        self.schedule(next.max(now + self.config.keepalive_timeout / 2), id, TimerKind::Keepalive);
    }

    async fn maintenance(&mut self) {
        let now = Instant::now();

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        let mut to_remove = Vec::new();
        let mut to_refresh = Vec::new();

        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };

            peer.reap_sessions(now);

            if let Some(accepted) = &peer.accepting {
                if accepted.expired(now, self.config.min_handshake_interval) {
                    peer.accepting = None;
                }
            }

            if peer.is_stale(now, self.config.peer_stale_time) {
                info!("peer {} is stale, dropping session", peer.log_name());
                let was_dynamic = peer.dynamic;
                peer.reset();
                self.eth_table.purge_peer(id);
                run_hook(&self.config.hooks.on_disestablish, self.hook_env_for(id));
                if was_dynamic {
                    to_remove.push(id);
                }
                continue;
            }

            if peer.is_established() && peer.want_refresh(now) {
                to_refresh.push(id);
            }
        }

        for id in to_remove {
            self.remove_peer(id);
        }
        for id in to_refresh {
            self.trigger_handshake(id, now).await;
        }

        // Inactive configured peers keep trying, with backoff.
        let retry: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| {
                peer.state == PeerState::Inactive
                    && !peer.dynamic
                    && peer.initiated.is_none()
                    && (peer.address.is_some() || peer.hostname_remotes().next().is_some())
            })
            .map(|peer| peer.id)
            .collect();
        for id in retry {
            self.trigger_handshake(id, now).await;
        }

        self.eth_table.purge_stale(now, self.config.eth_addr_stale_time);
        self.verify_cache.purge(
            now,
            self.config.verify_valid_time,
            self.config.min_verify_interval,
        );
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    fn request_resolve(&mut self, id: PeerId, now: Instant) {
        let request = {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            if !peer.may_resolve(now, self.config.min_resolve_interval) {
                return;
            }
            let Some((host, port)) = peer.hostname_remotes().next().map(|(h, p)| (h.to_string(), p))
            else {
                return;
            };
            peer.note_resolve(now);
            ResolveRequest { peer: id, host, port }
        };
        if self.resolve_tx.try_send(request).is_err() {
            debug!("resolver queue full");
        }
    }

    async fn handle_resolve_reply(&mut self, reply: ResolveReply) {
        let now = Instant::now();
        let Some(addr) = reply.addr else {
            return;
        };
        {
            let Some(peer) = self.peers.get_mut(&reply.peer) else {
                return;
            };
            // Never move an established peer off a roamed address.
            if peer.is_established() {
                return;
            }
            peer.address = Some(addr);
        }
        self.by_addr.insert(addr, reply.peer);
        self.trigger_handshake(reply.peer, now).await;
    }

    // =========================================================================
    // HOOKS AND SHUTDOWN
    // =========================================================================

    fn hook_env_for(&self, id: PeerId) -> HookEnv {
        let peer = self.peers.get(&id);
        HookEnv {
            interface: self.config.interface.clone(),
            peer_key: peer.map(|p| p.config.key),
            peer_address: peer.and_then(|p| p.address),
        }
    }

    fn disestablish_hook(&self, peer: &Peer) {
        run_hook(
            &self.config.hooks.on_disestablish,
            HookEnv {
                interface: self.config.interface.clone(),
                peer_key: Some(peer.config.key),
                peer_address: peer.address,
            },
        );
    }

    /// Walk every peer, fire disestablish hooks, and drop sessions.
    fn shutdown(&mut self) {
        info!("shutting down, {} peers", self.peers.len());
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(peer) = self.peers.get(&id) {
                if peer.is_established() {
                    self.disestablish_hook(peer);
                }
            }
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.reset();
            }
        }
        self.peers.clear();
        self.by_key.clear();
        self.by_addr.clear();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}
