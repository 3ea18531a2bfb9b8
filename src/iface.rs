//! Tunnel device seam
//!
//! The OS-specific open/read/write primitives stay outside the core; the
//! daemon only sees a pair of frame channels. The Linux tun/tap backend
//! pumps those channels from blocking reader/writer threads; tests attach
//! a channel backend and inject frames directly.

use tokio::sync::mpsc;
use tracing::warn;

#[cfg(target_os = "linux")]
use crate::types::Mode;

/// Frames queued towards/from the OS before backpressure applies.
const DEVICE_QUEUE: usize = 64;

/// The daemon's view of a tunnel device.
pub struct TunnelDevice {
    pub name: String,
    /// Largest frame the daemon will write; longer ones are truncated.
    pub max_frame: usize,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl TunnelDevice {
    /// Next frame read from the device. None when the backend is gone.
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Hand a decrypted frame to the device.
    pub async fn write_frame(&self, mut frame: Vec<u8>) {
        if frame.len() > self.max_frame {
            warn!(
                "truncating over-sized frame on {}: {} > {}",
                self.name,
                frame.len(),
                self.max_frame
            );
            frame.truncate(self.max_frame);
        }
        // Device gone: shutdown is in progress, drop silently.
        let _ = self.tx.send(frame).await;
    }
}

/// Test-side handle of a channel-backed device.
pub struct DeviceTestHandle {
    /// Inject a frame as if the OS delivered it.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Frames the daemon wrote to the device.
    pub written: mpsc::Receiver<Vec<u8>>,
}

/// A device backed by in-memory channels, for tests and loopback setups.
pub fn channel_device(name: &str, max_frame: usize) -> (TunnelDevice, DeviceTestHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(DEVICE_QUEUE);
    let (write_tx, write_rx) = mpsc::channel(DEVICE_QUEUE);
    (
        TunnelDevice {
            name: name.to_string(),
            max_frame,
            rx: inject_rx,
            tx: write_tx,
        },
        DeviceTestHandle { inject: inject_tx, written: write_rx },
    )
}

/// Open a Linux tun/tap interface and pump it through blocking threads.
#[cfg(target_os = "linux")]
pub fn open_tuntap(
    name: Option<&str>,
    mode: Mode,
    mtu: u16,
) -> std::io::Result<TunnelDevice> {
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    let mut req = IfReq {
        ifr_name: [0u8; libc::IFNAMSIZ],
        ifr_flags: match mode {
            Mode::Tap => IFF_TAP | IFF_NO_PI,
            Mode::Tun => IFF_TUN | IFF_NO_PI,
        },
        _pad: [0u8; 22],
    };
    if let Some(name) = name {
        let bytes = name.as_bytes();
        if bytes.len() >= libc::IFNAMSIZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        req.ifr_name[..bytes.len()].copy_from_slice(bytes);
    }

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ifname = String::from_utf8_lossy(
        &req.ifr_name[..req.ifr_name.iter().position(|&b| b == 0).unwrap_or(libc::IFNAMSIZ)],
    )
    .to_string();

    set_mtu(&ifname, mtu)?;

    let max_frame = match mode {
        Mode::Tap => mtu as usize + crate::types::ETH_HLEN,
        Mode::Tun => mtu as usize,
    };

    let (inject_tx, inject_rx) = mpsc::channel::<Vec<u8>>(DEVICE_QUEUE);
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(DEVICE_QUEUE);

    let mut reader = file.try_clone()?;
    let mut writer = file;

    std::thread::spawn(move || {
        let mut buf = vec![0u8; 65_536];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if inject_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("tunnel read error: {}", e);
                    break;
                }
            }
        }
    });

    std::thread::spawn(move || {
        while let Some(frame) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&frame) {
                warn!("tunnel write error: {}", e);
            }
        }
    });

    Ok(TunnelDevice { name: ifname, max_frame, rx: inject_rx, tx: write_tx })
}

#[cfg(target_os = "linux")]
fn set_mtu(ifname: &str, mtu: u16) -> std::io::Result<()> {
    #[repr(C)]
    struct IfReqMtu {
        ifr_name: [u8; libc::IFNAMSIZ],
        ifr_mtu: libc::c_int,
        _pad: [u8; 20],
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut req = IfReqMtu {
        ifr_name: [0u8; libc::IFNAMSIZ],
        ifr_mtu: mtu as libc::c_int,
        _pad: [0u8; 20],
    };
    let bytes = ifname.as_bytes();
    let n = bytes.len().min(libc::IFNAMSIZ - 1);
    req.ifr_name[..n].copy_from_slice(&bytes[..n]);

    let rc = unsafe { libc::ioctl(fd, libc::SIOCSIFMTU as libc::c_ulong, &req) };
    let result = if rc < 0 { Err(std::io::Error::last_os_error()) } else { Ok(()) };
    unsafe { libc::close(fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_device_roundtrip() {
        let (mut device, mut handle) = channel_device("test0", 1514);

        handle.inject.send(b"inbound frame".to_vec()).await.unwrap();
        assert_eq!(device.read_frame().await.unwrap(), b"inbound frame");

        device.write_frame(b"outbound frame".to_vec()).await;
        assert_eq!(handle.written.recv().await.unwrap(), b"outbound frame");
    }

    #[tokio::test]
    async fn test_oversized_write_truncated() {
        let (device, mut handle) = channel_device("test0", 10);
        device.write_frame(vec![7u8; 32]).await;
        assert_eq!(handle.written.recv().await.unwrap().len(), 10);
    }
}
