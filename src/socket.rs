//! UDP socket set and address handling
//!
//! One socket per configured bind address. Each socket gets a small reader
//! task feeding the main loop's datagram channel; the loop itself never
//! blocks on a single socket. Addresses are simplified on ingestion so the
//! peer table sees one canonical form.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::BindAddress;

/// Largest datagram we accept; fits any MTU plus method overhead.
pub const MAX_DATAGRAM: usize = 65_536;

/// One datagram delivered to the main loop.
pub struct InboundDatagram {
    /// Index into the socket set, so replies leave the same socket.
    pub socket: usize,
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

/// Canonicalise a remote address: IPv4-mapped IPv6 becomes plain IPv4.
pub fn simplify(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// IPv6 link-local addresses need a bound device to be routable.
pub fn is_v6_link_local(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

/// Bind every configured address.
pub async fn bind_sockets(binds: &[BindAddress]) -> std::io::Result<Vec<Arc<UdpSocket>>> {
    let mut sockets = Vec::with_capacity(binds.len());
    for bind in binds {
        let socket = UdpSocket::bind(bind.addr).await?;
        if let Some(device) = &bind.device {
            bind_to_device(&socket, device)?;
        }
        debug!("listening on {}", socket.local_addr()?);
        sockets.push(Arc::new(socket));
    }
    Ok(sockets)
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &UdpSocket, device: &str) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            device.as_ptr() as *const libc::c_void,
            device.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &UdpSocket, _device: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "device bind is not supported on this system",
    ))
}

/// Consecutive receive failures tolerated before giving up. A socket
/// failing this persistently will not recover on its own; exiting lets a
/// supervisor restart the daemon.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 20;

/// Spawn one reader task per socket; datagrams land in `tx`.
pub fn spawn_readers(sockets: &[Arc<UdpSocket>], tx: mpsc::Sender<InboundDatagram>) {
    for (index, socket) in sockets.iter().enumerate() {
        let socket = socket.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut errors = 0u32;
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        errors = 0;
                        let datagram = InboundDatagram {
                            socket: index,
                            from: simplify(from),
                            data: buf[..len].to_vec(),
                        };
                        if tx.send(datagram).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("socket receive error: {}", e);
                        errors += 1;
                        if errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                            tracing::error!("socket unusable, giving up");
                            std::process::exit(1);
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_v4_simplified() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:10000".parse().unwrap();
        assert_eq!(simplify(mapped), "192.0.2.1:10000".parse().unwrap());

        let native: SocketAddr = "[2001:db8::1]:10000".parse().unwrap();
        assert_eq!(simplify(native), native);
    }

    #[test]
    fn test_link_local_detection() {
        let ll: SocketAddr = "[fe80::1]:10000".parse().unwrap();
        assert!(is_v6_link_local(&ll));
        let global: SocketAddr = "[2001:db8::1]:10000".parse().unwrap();
        assert!(!is_v6_link_local(&global));
        let v4: SocketAddr = "192.0.2.1:10000".parse().unwrap();
        assert!(!is_v6_link_local(&v4));
    }

    #[tokio::test]
    async fn test_reader_task_delivers_datagrams() {
        let binds = vec![BindAddress { addr: "127.0.0.1:0".parse().unwrap(), device: None }];
        let sockets = bind_sockets(&binds).await.unwrap();
        let local = sockets[0].local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        spawn_readers(&sockets, tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", local).await.unwrap();

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.socket, 0);
    }
}
