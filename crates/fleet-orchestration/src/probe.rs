//! Reachability probe and local address discovery

use async_io::Timer;
use async_net::TcpStream;
use futures_lite::FutureExt;
use if_addrs::get_if_addrs;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Whether a TCP connection to `address:port` opens within `timeout`
pub async fn port_open(address: IpAddr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(address, port);
    let connect = async { TcpStream::connect(addr).await.map(drop) };
    let deadline = async {
        Timer::after(timeout).await;
        Err(io::Error::new(io::ErrorKind::TimedOut, "probe timed out"))
    };

    match connect.or(deadline).await {
        Ok(()) => true,
        Err(e) => {
            debug!(%addr, error = %e, "port probe failed");
            false
        }
    }
}

/// This machine's interface addresses, resolved once per run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddresses(HashSet<IpAddr>);

impl LocalAddresses {
    /// Enumerate the machine's interfaces
    pub fn discover() -> Result<Self> {
        let interfaces = get_if_addrs()
            .map_err(|e| Error::Network(format!("failed to enumerate interfaces: {}", e)))?;
        let addresses: HashSet<IpAddr> = interfaces.iter().map(|iface| iface.ip()).collect();
        debug!(count = addresses.len(), "discovered local addresses");
        Ok(Self(addresses))
    }

    /// Whether `address` belongs to this machine
    pub fn contains(&self, address: &IpAddr) -> bool {
        self.0.contains(address)
    }
}

impl FromIterator<IpAddr> for LocalAddresses {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
