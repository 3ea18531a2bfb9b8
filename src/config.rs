//! Configuration snapshot and peer files
//!
//! The daemon receives one immutable `Config` at startup; reload builds a
//! fresh snapshot and swaps it at a quiescent point. Everything here is
//! validated before the event loop starts — configuration problems are
//! fatal, runtime problems never are.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::crypto::{CryptoError, ImplSelection};
use crate::method::common::SessionTiming;
use crate::method::{create_method, MethodCreateError};
use crate::types::{Mode, PublicKeyBytes};

// =============================================================================
// DEFAULTS
// =============================================================================
// Kept in one place so the Default impl and the documentation cannot
// drift apart.

pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_KEY_VALID_SECS: u64 = 3600;
pub const DEFAULT_KEY_VALID_OLD_SECS: u64 = 60;
pub const DEFAULT_KEY_REFRESH_SECS: u64 = 3300;
pub const DEFAULT_KEY_REFRESH_SPLAY_SECS: u64 = 300;
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_PEER_STALE_TIME_SECS: u64 = 90;
pub const DEFAULT_ETH_ADDR_STALE_TIME_SECS: u64 = 300;
pub const DEFAULT_REORDER_TIME_SECS: u64 = 10;
pub const DEFAULT_MIN_HANDSHAKE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MIN_RESOLVE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MIN_VERIFY_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_VERIFY_VALID_TIME_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{0}")]
    Crypto(#[from] CryptoError),
    #[error("{0}")]
    Method(#[from] MethodCreateError),
    #[error("no methods configured")]
    NoMethods,
    #[error("no secret key configured")]
    NoSecret,
    #[error("invalid MTU {0}")]
    InvalidMtu(u16),
    #[error("TUN mode supports exactly one peer")]
    TunPeerCount,
    #[error("duplicate peer key {0}")]
    DuplicatePeerKey(String),
    #[error("{file}: invalid statement `{statement}`")]
    BadStatement { file: String, statement: String },
    #[error("{file}: invalid key material")]
    BadKey { file: String },
    #[error("{file}: invalid remote `{remote}`")]
    BadRemote { file: String, remote: String },
    #[error("{file}: unterminated string")]
    UnterminatedString { file: String },
}

// =============================================================================
// PEERS AND GROUPS
// =============================================================================

/// A configured remote endpoint: a literal socket address or a hostname
/// that the resolver worker turns into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEndpoint {
    Addr(SocketAddr),
    Hostname { host: String, port: u16 },
}

/// Static peer definition, from a peer file or built-in configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: Option<String>,
    pub key: PublicKeyBytes,
    pub remotes: Vec<RemoteEndpoint>,
    pub floating: bool,
    /// Peer group this peer belongs to.
    pub group: String,
    /// Source file, for reload diffing.
    pub source: Option<PathBuf>,
}

/// Peer group tree node. Groups apply a shared connection cap and own
/// peer-directory sources.
#[derive(Debug, Clone)]
pub struct PeerGroup {
    pub name: String,
    /// None = unlimited.
    pub max_connections: Option<usize>,
    pub peer_dirs: Vec<PathBuf>,
    pub children: Vec<PeerGroup>,
}

impl PeerGroup {
    pub fn root() -> Self {
        PeerGroup {
            name: "default".to_string(),
            max_connections: None,
            peer_dirs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Find a group by name anywhere in the tree.
    pub fn find(&self, name: &str) -> Option<&PeerGroup> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}

/// Shell hook commands; absent hooks are skipped without blocking.
#[derive(Debug, Clone, Default)]
pub struct HookCommands {
    pub on_pre_up: Option<String>,
    pub on_up: Option<String>,
    pub on_down: Option<String>,
    pub on_post_down: Option<String>,
    pub on_connect: Option<String>,
    pub on_establish: Option<String>,
    pub on_disestablish: Option<String>,
    pub on_verify: Option<String>,
}

/// One UDP bind address, optionally tied to a device (IPv6 link-local).
#[derive(Debug, Clone)]
pub struct BindAddress {
    pub addr: SocketAddr,
    pub device: Option<String>,
}

// =============================================================================
// CONFIG SNAPSHOT
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub interface: Option<String>,
    pub mode: Mode,
    pub mtu: u16,
    pub bind_addrs: Vec<BindAddress>,
    /// Our long-term identity secret.
    pub secret: Option<[u8; 32]>,
    /// Ordered method list; the first entry is what we propose.
    pub methods: Vec<String>,
    pub impl_selection: ImplSelection,
    pub secure_handshakes: bool,

    pub key_valid: Duration,
    pub key_valid_old: Duration,
    pub key_refresh: Duration,
    pub key_refresh_splay: Duration,
    pub maintenance_interval: Duration,
    pub keepalive_timeout: Duration,
    pub peer_stale_time: Duration,
    pub eth_addr_stale_time: Duration,
    /// Hint for downstream reorder buffers; the replay window itself has a
    /// fixed span.
    pub reorder_time: Duration,
    pub min_handshake_interval: Duration,
    pub min_resolve_interval: Duration,
    pub min_verify_interval: Duration,
    pub verify_valid_time: Duration,

    pub peer_group: PeerGroup,
    pub peers: Vec<PeerConfig>,
    pub hooks: HookCommands,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: None,
            mode: Mode::Tap,
            mtu: DEFAULT_MTU,
            bind_addrs: Vec::new(),
            secret: None,
            methods: Vec::new(),
            impl_selection: ImplSelection::default(),
            secure_handshakes: true,
            key_valid: Duration::from_secs(DEFAULT_KEY_VALID_SECS),
            key_valid_old: Duration::from_secs(DEFAULT_KEY_VALID_OLD_SECS),
            key_refresh: Duration::from_secs(DEFAULT_KEY_REFRESH_SECS),
            key_refresh_splay: Duration::from_secs(DEFAULT_KEY_REFRESH_SPLAY_SECS),
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            keepalive_timeout: Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS),
            peer_stale_time: Duration::from_secs(DEFAULT_PEER_STALE_TIME_SECS),
            eth_addr_stale_time: Duration::from_secs(DEFAULT_ETH_ADDR_STALE_TIME_SECS),
            reorder_time: Duration::from_secs(DEFAULT_REORDER_TIME_SECS),
            min_handshake_interval: Duration::from_secs(DEFAULT_MIN_HANDSHAKE_INTERVAL_SECS),
            min_resolve_interval: Duration::from_secs(DEFAULT_MIN_RESOLVE_INTERVAL_SECS),
            min_verify_interval: Duration::from_secs(DEFAULT_MIN_VERIFY_INTERVAL_SECS),
            verify_valid_time: Duration::from_secs(DEFAULT_VERIFY_VALID_TIME_SECS),
            peer_group: PeerGroup::root(),
            peers: Vec::new(),
            hooks: HookCommands::default(),
        }
    }
}

impl Config {
    /// Validate the snapshot. Called once before the event loop; any
    /// error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_none() {
            return Err(ConfigError::NoSecret);
        }
        if self.methods.is_empty() {
            return Err(ConfigError::NoMethods);
        }
        if self.mtu < 576 {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        self.impl_selection.validate()?;
        for method in &self.methods {
            create_method(method, &self.impl_selection)?;
        }
        if self.mode == Mode::Tun && self.peers.len() > 1 {
            return Err(ConfigError::TunPeerCount);
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.key) {
                return Err(ConfigError::DuplicatePeerKey(hex::encode(peer.key)));
            }
        }
        Ok(())
    }

    /// Add a method name, ignoring duplicates.
    pub fn add_method(&mut self, name: &str) {
        if self.methods.iter().any(|m| m == name) {
            tracing::debug!("duplicate method name `{}', ignoring", name);
            return;
        }
        self.methods.push(name.to_string());
    }

    pub fn session_timing(&self) -> SessionTiming {
        SessionTiming {
            key_valid: self.key_valid,
            key_valid_old: self.key_valid_old,
            key_refresh: self.key_refresh,
            key_refresh_splay: self.key_refresh_splay,
        }
    }

    /// Payload bytes a tunnel frame may occupy.
    pub fn max_payload(&self) -> usize {
        match self.mode {
            Mode::Tap => self.mtu as usize + crate::types::ETH_HLEN,
            Mode::Tun => self.mtu as usize,
        }
    }
}

// =============================================================================
// PEER FILES
// =============================================================================
// Format: `key "value";` statements, `#` comments, blank lines tolerated.
// Example:
//
//     # backbone gateway
//     key "d8f8c567...";
//     remote "gw.example.org":10000;
//     float yes;

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
}

/// Split one statement (text before a `;`) into words and quoted strings.
fn tokenize(statement: &str, file: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => value.push(ch),
                    None => {
                        return Err(ConfigError::UnterminatedString { file: file.to_string() })
                    }
                }
            }
            tokens.push(Token::Quoted(value));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '"' {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }

    Ok(tokens)
}

fn parse_remote(tokens: &[Token], file: &str) -> Result<RemoteEndpoint, ConfigError> {
    let bad = |remote: String| ConfigError::BadRemote { file: file.to_string(), remote };
    match tokens {
        // remote "host":port;  — hostname, resolved later
        [Token::Quoted(host), Token::Word(port)] => {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| bad(format!("{}{}", host, port)))?;
            Ok(RemoteEndpoint::Hostname { host: host.clone(), port })
        }
        // remote 192.0.2.1:10000;  or  remote [2001:db8::1]:10000;
        [Token::Word(literal)] => literal
            .parse::<SocketAddr>()
            .map(RemoteEndpoint::Addr)
            .map_err(|_| bad(literal.clone())),
        _ => Err(bad(String::new())),
    }
}

/// Parse one peer file's contents.
pub fn parse_peer_file(
    file_name: &str,
    content: &str,
    group: &str,
    source: Option<PathBuf>,
) -> Result<PeerConfig, ConfigError> {
    let mut key: Option<PublicKeyBytes> = None;
    let mut remotes = Vec::new();
    let mut floating = false;

    // Strip comments line-wise, then statements end at `;`.
    let stripped: String = content
        .lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n");

    for statement in stripped.split(';') {
        let tokens = tokenize(statement, file_name)?;
        if tokens.is_empty() {
            continue;
        }

        let bad_statement = || ConfigError::BadStatement {
            file: file_name.to_string(),
            statement: statement.trim().to_string(),
        };

        match &tokens[0] {
            Token::Word(word) if word == "key" => match &tokens[1..] {
                [Token::Quoted(hex_key)] => {
                    let bytes = hex::decode(hex_key)
                        .map_err(|_| ConfigError::BadKey { file: file_name.to_string() })?;
                    let parsed: PublicKeyBytes = bytes
                        .try_into()
                        .map_err(|_| ConfigError::BadKey { file: file_name.to_string() })?;
                    key = Some(parsed);
                }
                _ => return Err(bad_statement()),
            },
            Token::Word(word) if word == "remote" => {
                remotes.push(parse_remote(&tokens[1..], file_name)?);
            }
            Token::Word(word) if word == "float" => match &tokens[1..] {
                [] | [Token::Word(_)] => {
                    floating = !matches!(&tokens[1..], [Token::Word(w)] if w == "no");
                }
                _ => return Err(bad_statement()),
            },
            _ => return Err(bad_statement()),
        }
    }

    let key = key.ok_or(ConfigError::BadKey { file: file_name.to_string() })?;

    Ok(PeerConfig {
        name: Some(file_name.to_string()),
        key,
        remotes,
        floating,
        group: group.to_string(),
        source,
    })
}

/// Load every peer file in a directory. Dotfiles and editor backups
/// (trailing `~`) are skipped, as are subdirectories.
pub fn load_peer_dir(dir: &Path, group: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;

    let mut peers = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || name.ends_with('~') {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        peers.push(parse_peer_file(&name, &content, group, Some(path))?);
    }

    Ok(peers)
}
