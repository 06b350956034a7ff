//! The TUN device boundary.
//!
//! The relay never touches a TUN interface directly. It reads and writes whole
//! IPv6 packets through [`TunDevice`], which has two implementations:
//!
//! - [`FdDevice`]: a non-blocking file descriptor registered with the tokio
//!   reactor, for descriptors inherited from a parent process.
//! - `NamedDevice` (Linux): an interface attached by name through `tun-rs`.
//! - [`ChannelDevice`]: an in-memory device driven through a [`DeviceHandle`],
//!   used by tests and embedders that bring their own packet source.

use async_trait::async_trait;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::{Mutex, mpsc};

/// A packet-oriented virtual network interface
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    ///
    /// Packets longer than `buf` are truncated. `Ok(0)` means the device is
    /// closed and no further packets will arrive.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete packet.
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Interface name for diagnostics
    fn name(&self) -> &str;
}

/// Descriptor-backed device
pub struct FdDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl FdDevice {
    /// Wrap an already-attached descriptor.
    ///
    /// The descriptor is switched to non-blocking mode and registered with the
    /// current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if `fcntl` fails or there is no reactor to register with.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: name.into(),
        })
    }
}

impl std::fmt::Debug for FdDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdDevice")
            .field("fd", &self.fd.get_ref().as_raw_fd())
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl TunDevice for FdDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < packet.len() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| raw_write(inner.get_ref().as_raw_fd(), &packet[written..])) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "device accepted zero bytes",
                    ));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid descriptor owned by `fd` for the duration of the calls
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn raw_read(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn raw_write(fd: i32, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for reads of `buf.len()` bytes
    let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Interface attached by name
#[cfg(target_os = "linux")]
pub struct NamedDevice {
    device: tun_rs::AsyncDevice,
    name: String,
}

#[cfg(target_os = "linux")]
impl NamedDevice {
    /// Attach to TUN interface `name` without packet info.
    ///
    /// An empty `name` lets the kernel choose one; [`TunDevice::name`] then
    /// reports the assigned name.
    ///
    /// # Errors
    ///
    /// Fails if the name is too long or the kernel rejects the attach
    /// (typically missing `CAP_NET_ADMIN`).
    pub fn attach(name: &str) -> io::Result<Self> {
        let mut builder = tun_rs::DeviceBuilder::new();
        if !name.is_empty() {
            builder = builder.name(name);
        }
        let device = builder.build_async()?;
        let name = device.name()?;
        tracing::debug!(interface = %name, "Attached to TUN interface");
        Ok(Self { device, name })
    }
}

#[cfg(target_os = "linux")]
impl std::fmt::Debug for NamedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedDevice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TunDevice for NamedDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let n = self.device.send(packet).await?;
        if n < packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("device took {n} of {} bytes", packet.len()),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory device.
///
/// Packets injected through the paired [`DeviceHandle`] come out of
/// `read_packet`; packets passed to `write_packet` are collected by the handle.
#[derive(Debug)]
pub struct ChannelDevice {
    name: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side end of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelDevice {
    /// Create a device and the handle that drives it
    pub fn pair(name: impl Into<String>) -> (Self, DeviceHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();

        let device = Self {
            name: name.into(),
            inbound: Mutex::new(inject_rx),
            outbound: written_tx,
        };
        let handle = DeviceHandle {
            inject: inject_tx,
            written: Mutex::new(written_rx),
        };
        (device, handle)
    }
}

#[async_trait]
impl TunDevice for ChannelDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self.inbound.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "device handle dropped")
        })?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device handle dropped"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl DeviceHandle {
    /// Make `packet` readable from the device.
    ///
    /// Returns `false` if the device has been dropped.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> bool {
        self.inject.send(packet.into()).is_ok()
    }

    /// Next packet written to the device, or `None` once the device is dropped
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }

    /// A written packet if one is already waiting
    pub async fn try_next_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.try_recv().ok()
    }
}
