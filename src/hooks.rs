//! Shell hook execution
//!
//! Hooks are fire-and-forget subprocesses; their absence or failure never
//! blocks the core. The one exception is the verify hook, which gates
//! admission of unknown peers: it runs asynchronously and reports its
//! verdict back over a channel, with verdicts cached and per-address rate
//! limiting applied by the caller through `VerifyCache`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{key_fingerprint, PublicKeyBytes};

/// Environment a hook sees, mirroring the daemon's view of the peer.
pub struct HookEnv {
    pub interface: Option<String>,
    pub peer_key: Option<PublicKeyBytes>,
    pub peer_address: Option<SocketAddr>,
}

impl HookEnv {
    fn to_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(interface) = &self.interface {
            vars.push(("INTERFACE".to_string(), interface.clone()));
        }
        if let Some(key) = &self.peer_key {
            vars.push(("PEER_KEY".to_string(), hex::encode(key)));
        }
        if let Some(addr) = &self.peer_address {
            vars.push(("PEER_ADDRESS".to_string(), addr.ip().to_string()));
            vars.push(("PEER_PORT".to_string(), addr.port().to_string()));
        }
        vars
    }
}

/// Run a hook without waiting for it. Absent commands are a no-op.
pub fn run_hook(command: &Option<String>, env: HookEnv) {
    let Some(command) = command.clone() else {
        return;
    };
    let vars = env.to_vars();
    tokio::spawn(async move {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        for (key, value) in vars {
            cmd.env(key, value);
        }
        match cmd.status().await {
            Ok(status) if !status.success() => {
                warn!("hook `{}` exited with {}", command, status);
            }
            Ok(_) => {}
            Err(e) => warn!("failed to run hook `{}`: {}", command, e),
        }
    });
}

// =============================================================================
// VERIFY HOOK
// =============================================================================

/// Verdict of a verify hook run, delivered to the main loop.
pub struct VerifyReply {
    pub key: PublicKeyBytes,
    pub remote: SocketAddr,
    pub allowed: bool,
}

/// Run the verify hook for an unknown peer; the exit status decides.
pub fn spawn_verify(
    command: &str,
    env: HookEnv,
    key: PublicKeyBytes,
    remote: SocketAddr,
    reply_tx: mpsc::Sender<VerifyReply>,
) {
    let command = command.to_string();
    let vars = env.to_vars();
    tokio::spawn(async move {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        for (k, v) in vars {
            cmd.env(k, v);
        }
        let allowed = match cmd.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("failed to run verify hook: {}", e);
                false
            }
        };
        debug!(
            "verify hook for {}: {}",
            key_fingerprint(&key),
            if allowed { "allowed" } else { "denied" }
        );
        let _ = reply_tx.send(VerifyReply { key, remote, allowed }).await;
    });
}

/// Verdict cache plus per-address rate gate for the verify hook.
#[derive(Default)]
pub struct VerifyCache {
    verdicts: HashMap<PublicKeyBytes, (bool, Instant)>,
    last_attempt: HashMap<SocketAddr, Instant>,
}

impl VerifyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached verdict for a key, if still fresh.
    pub fn lookup(&self, key: &PublicKeyBytes, now: Instant, valid_time: Duration) -> Option<bool> {
        let (allowed, at) = self.verdicts.get(key)?;
        if now.duration_since(*at) >= valid_time {
            return None;
        }
        Some(*allowed)
    }

    pub fn store(&mut self, key: PublicKeyBytes, allowed: bool, now: Instant) {
        self.verdicts.insert(key, (allowed, now));
    }

    /// Per-address rate gate; records the attempt when it passes.
    pub fn may_verify(&mut self, remote: SocketAddr, now: Instant, interval: Duration) -> bool {
        match self.last_attempt.get(&remote) {
            Some(at) if now.duration_since(*at) < interval => false,
            _ => {
                self.last_attempt.insert(remote, now);
                true
            }
        }
    }

    /// Maintenance: forget stale verdicts and gates.
    pub fn purge(&mut self, now: Instant, valid_time: Duration, interval: Duration) {
        self.verdicts.retain(|_, (_, at)| now.duration_since(*at) < valid_time);
        self.last_attempt.retain(|_, at| now.duration_since(*at) < interval);
    }
}
