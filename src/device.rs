//! Capture device contract
//!
//! The packet router treats the capture device as an opaque byte-oriented
//! device: one IP packet per read/write unit, plus subnet management calls
//! that control which destinations the host routes into it.
//!
//! # Ownership
//!
//! The router's single reader is the only component that reads from the
//! device, and all writes go through the router's single writer queue.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::{mpsc, Mutex, Notify};

/// Byte-oriented capture device with subnet management
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IP packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP packet
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Route `net` into the device
    async fn add_subnet(&self, net: IpNet) -> io::Result<()>;

    /// Stop routing `net` into the device
    async fn remove_subnet(&self, net: IpNet) -> io::Result<()>;

    /// Close the device; pending and subsequent reads/writes fail
    fn close(&self);
}

/// In-memory device over a pair of bounded channels
///
/// Packets sent on the injector end show up in `read`; packets passed to
/// `write` come out of the drain end. Subnet calls are recorded so tests
/// and local wiring can observe the installed set.
pub struct ChannelDevice {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
    subnets: parking_lot::Mutex<HashSet<IpNet>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ChannelDevice {
    /// Create a device plus its injector and drain ends
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (drain_tx, drain_rx) = mpsc::channel(capacity);
        let device = Arc::new(Self {
            rx: Mutex::new(inject_rx),
            tx: drain_tx,
            subnets: parking_lot::Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        (device, inject_tx, drain_rx)
    }

    /// Snapshot of the currently installed subnets
    #[must_use]
    pub fn installed_subnets(&self) -> HashSet<IpNet> {
        self.subnets.lock().clone()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl TunDevice for ChannelDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut rx = self.rx.lock().await;
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "injector gone")),
            },
            () = self.closed_notify.notified() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
            }
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "drain gone"))?;
        Ok(packet.len())
    }

    async fn add_subnet(&self, net: IpNet) -> io::Result<()> {
        self.check_open()?;
        self.subnets.lock().insert(net);
        Ok(())
    }

    async fn remove_subnet(&self, net: IpNet) -> io::Result<()> {
        self.check_open()?;
        self.subnets.lock().remove(&net);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_and_drain() {
        let (device, inject, mut drain) = ChannelDevice::new(4);

        inject.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        device.write(&[4, 5]).await.unwrap();
        assert_eq!(drain.recv().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_subnet_bookkeeping() {
        let (device, _inject, _drain) = ChannelDevice::new(1);
        let net: IpNet = "10.0.0.0/16".parse().unwrap();
        device.add_subnet(net).await.unwrap();
        assert!(device.installed_subnets().contains(&net));
        device.remove_subnet(net).await.unwrap();
        assert!(device.installed_subnets().is_empty());
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (device, _inject, _drain) = ChannelDevice::new(1);
        let reader = {
            let device = Arc::clone(&device);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                device.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        device.close();
        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(device.write(&[1]).await.is_err());
    }
}
