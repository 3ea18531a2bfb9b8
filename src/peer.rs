//! Per-peer runtime state
//!
//! A peer is a remote identified by its public key. The peer owns its
//! cryptographic sessions and in-flight handshake state; the event loop is
//! the only mutator. Sessions come in pairs during rekey: the fresh one
//! encrypts, the superseded one keeps decrypting until its grace period
//! runs out.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Buffer;
use crate::config::PeerConfig;
use crate::handshake::fhmqvc::{AcceptedHandshake, InitiatedHandshake};
use crate::method::{DecryptedPacket, MethodError, MethodSession};
use crate::types::key_fingerprint;

/// Stable handle for a peer within the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Peer connection state machine.
///
/// ```text
///                 trigger (connect, inbound handshake,
///                          refresh, pending traffic)
///     ┌───────────┐               ┌───────────┐
///     │ Inactive  │──────────────►│ Handshake │
///     └───────────┘               └─────┬─────┘
///           ▲                           │ exchange completes,
///           │ stale / retries           │ session installed
///           │ exhausted                 ▼
///           │                     ┌─────────────┐
///           └─────────────────────│ Established │◄─┐
///                                 └──────┬──────┘  │ rekey installs
///                                        └─────────┘ a fresh session
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No usable session and no handshake in flight.
    Inactive,
    /// Key exchange in progress.
    Handshake,
    /// A session is installed and traffic flows.
    Established,
}

/// One installed cryptographic session.
pub struct Session {
    pub method: String,
    /// Buffer space contract of the provider that created the session.
    pub space: crate::method::MethodSpace,
    pub state: Box<dyn MethodSession>,
}

/// Runtime record for a configured (or verify-admitted) peer.
pub struct Peer {
    pub id: PeerId,
    pub config: PeerConfig,
    /// Admitted at runtime through the verify hook rather than configured
    /// statically; evicted first when a group hits its connection cap.
    pub dynamic: bool,

    /// Current remote endpoint; floating peers start without one.
    pub address: Option<SocketAddr>,
    pub state: PeerState,

    /// Last time a packet from this peer authenticated successfully.
    pub last_rx: Instant,
    /// Last time we sent anything under a session (keepalive clock).
    pub last_tx: Instant,
    /// Handshake rate gate, per remote address.
    last_handshake: Option<(SocketAddr, Instant)>,
    /// Resolve rate gate.
    last_resolve: Option<Instant>,
    /// Backoff applied when a whole handshake attempt (all retries) fails.
    pub handshake_backoff: u32,

    /// Outbound exchange in flight (we sent Init).
    pub initiated: Option<InitiatedHandshake>,
    /// Inbound exchange in flight (we sent Response).
    pub accepting: Option<AcceptedHandshake>,

    session: Option<Session>,
    old_session: Option<Session>,
}

impl Peer {
    pub fn new(id: PeerId, config: PeerConfig, dynamic: bool, now: Instant) -> Self {
        let address = config.remotes.iter().find_map(|r| match r {
            crate::config::RemoteEndpoint::Addr(addr) => Some(*addr),
            crate::config::RemoteEndpoint::Hostname { .. } => None,
        });
        Peer {
            id,
            config,
            dynamic,
            address,
            state: PeerState::Inactive,
            last_rx: now,
            last_tx: now,
            last_handshake: None,
            last_resolve: None,
            handshake_backoff: 0,
            initiated: None,
            accepting: None,
            session: None,
            old_session: None,
        }
    }

    /// Peer name for logs: configured name or key fingerprint.
    pub fn log_name(&self) -> String {
        match &self.config.name {
            Some(name) => name.clone(),
            None => key_fingerprint(&self.config.key),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Install a freshly negotiated session. The previous one stays
    /// around, superseded, for in-flight packets.
    pub fn install_session(&mut self, session: Session, now: Instant) {
        if let Some(mut old) = self.session.take() {
            old.state.set_superseded(now);
            self.old_session = Some(old);
        }
        self.session = Some(session);
        self.state = PeerState::Established;
        self.initiated = None;
        self.accepting = None;
        self.handshake_backoff = 0;
        self.last_rx = now;
        self.last_tx = now;
    }

    /// Encrypt a payload under the current session.
    pub fn encrypt(&mut self, buffer: Buffer) -> Result<Buffer, MethodError> {
        match &mut self.session {
            Some(session) => session.state.encrypt(buffer),
            None => Err(MethodError::SessionExpired),
        }
    }

    /// Try to decrypt against the current session, then the superseded
    /// one. Each failed try leaves the sessions untouched.
    pub fn decrypt(&mut self, packet: &[u8], now: Instant) -> Result<DecryptedPacket, MethodError> {
        let mut last_err = MethodError::SessionExpired;

        for session in [&mut self.session, &mut self.old_session].into_iter().flatten() {
            if !session.state.is_valid(now) {
                continue;
            }
            let buffer =
                Buffer::from_slice(packet, session.space.decrypt_head, session.space.decrypt_tail);
            match session.state.decrypt(buffer) {
                Ok(out) => return Ok(out),
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }

    /// True when the current session should be replaced soon.
    pub fn want_refresh(&self, now: Instant) -> bool {
        match &self.session {
            Some(session) => session.state.want_refresh(now),
            None => false,
        }
    }

    /// Drop the superseded session once its grace period has passed, and
    /// drop expired sessions entirely. Returns true if the peer lost its
    /// last session.
    pub fn reap_sessions(&mut self, now: Instant) -> bool {
        if let Some(old) = &self.old_session {
            if old.state.ready_to_drop(now) || !old.state.is_valid(now) {
                debug!("peer {}: dropping superseded session", self.log_name());
                self.old_session = None;
            }
        }
        if let Some(session) = &self.session {
            if !session.state.is_valid(now) {
                debug!("peer {}: session expired", self.log_name());
                self.session = None;
                self.old_session = None;
                self.state = PeerState::Inactive;
                return true;
            }
        }
        false
    }

    /// Stale: established but silent past the configured limit.
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        self.is_established() && now.duration_since(self.last_rx) >= stale_time
    }

    /// Tear down sessions but keep the configuration; the peer may come
    /// back with a handshake.
    pub fn reset(&mut self) {
        self.session = None;
        self.old_session = None;
        self.initiated = None;
        self.accepting = None;
        self.state = PeerState::Inactive;
    }

    /// Handshake rate gate: one exchange per remote address per interval.
    pub fn may_handshake(&self, addr: SocketAddr, now: Instant, interval: Duration) -> bool {
        match self.last_handshake {
            Some((gated_addr, at)) if gated_addr == addr => now.duration_since(at) >= interval,
            _ => true,
        }
    }

    pub fn note_handshake(&mut self, addr: SocketAddr, now: Instant) {
        self.last_handshake = Some((addr, now));
    }

    /// Resolve rate gate.
    pub fn may_resolve(&self, now: Instant, interval: Duration) -> bool {
        match self.last_resolve {
            Some(at) => now.duration_since(at) >= interval,
            None => true,
        }
    }

    pub fn note_resolve(&mut self, now: Instant) {
        self.last_resolve = Some(now);
    }

    /// Hostnames needing resolution before we can send an Init.
    pub fn hostname_remotes(&self) -> impl Iterator<Item = (&str, u16)> {
        self.config.remotes.iter().filter_map(|r| match r {
            crate::config::RemoteEndpoint::Hostname { host, port } => Some((host.as_str(), *port)),
            crate::config::RemoteEndpoint::Addr(_) => None,
        })
    }
}

/// Peer info for status logs.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub address: Option<SocketAddr>,
    pub state: PeerState,
    pub dynamic: bool,
    pub method: Option<String>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        PeerInfo {
            id: peer.id,
            name: peer.log_name(),
            address: peer.address,
            state: peer.state,
            dynamic: peer.dynamic,
            method: peer.session().map(|s| s.method.clone()),
        }
    }
}
