//! # Datagram Transport
//!
//! The session talks to the network through [`MessageSocket`], one bound
//! socket per address family. A [`Subnet`] wraps one of them and refuses to
//! send to a peer of the other family before any bytes leave the process.
//!
//! ```text
//!   Subnet(v4) ──► reader task ──┐
//!                                ├──► mpsc<Inbound> ──► session loop
//!   Subnet(v6) ──► reader task ──┘
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::SessionError;

/// Minimal datagram socket the session needs.
#[async_trait]
pub trait MessageSocket: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl MessageSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, bytes, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// A bound socket serving one address family.
#[derive(Clone)]
pub struct Subnet {
    socket: Arc<dyn MessageSocket>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subnet").field("local_addr", &self.local_addr).finish()
    }
}

impl Subnet {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(Arc::new(socket))
    }

    pub fn from_socket(socket: Arc<dyn MessageSocket>) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether `peer` is reachable through this socket's address family.
    pub fn accepts(&self, peer: &SocketAddr) -> bool {
        self.local_addr.is_ipv4() == peer.is_ipv4()
    }

    pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<(), SessionError> {
        if !self.accepts(&peer) {
            return Err(SessionError::AddressFamilyMismatch(peer));
        }
        self.socket
            .send_to(bytes, peer)
            .await
            .map_err(SessionError::Transport)?;
        Ok(())
    }

    pub fn socket(&self) -> Arc<dyn MessageSocket> {
        self.socket.clone()
    }
}

/// The local subnets, at most one per address family.
#[derive(Debug, Default)]
pub struct Subnets {
    subnets: Vec<Subnet>,
}

impl Subnets {
    /// Bind one socket per listen address. A second address of an already
    /// bound family is skipped.
    pub async fn bind(listen: &[SocketAddr]) -> Result<Self, SessionError> {
        let mut subnets = Self::default();
        for addr in listen {
            if subnets.for_peer(addr).is_ok() {
                warn!(addr = %addr, "address family already bound, skipping listen address");
                continue;
            }
            subnets.subnets.push(Subnet::bind(*addr).await?);
        }
        if subnets.subnets.is_empty() {
            return Err(SessionError::NoListenAddress);
        }
        Ok(subnets)
    }

    /// The subnet whose family matches `peer`.
    pub fn for_peer(&self, peer: &SocketAddr) -> Result<&Subnet, SessionError> {
        self.subnets
            .iter()
            .find(|s| s.accepts(peer))
            .ok_or(SessionError::AddressFamilyMismatch(*peer))
    }

    pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<(), SessionError> {
        self.for_peer(&peer)?.send(peer, bytes).await
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.subnets.iter().map(Subnet::local_addr).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter()
    }
}

/// What a reader task forwards to the session.
#[derive(Debug)]
pub enum Inbound {
    Datagram { from: SocketAddr, bytes: Vec<u8> },
    /// The socket failed irrecoverably; the reader has stopped.
    Failed(io::Error),
}

/// Forward every datagram received on `socket` to `tx` until the receiver is
/// dropped or the socket fails.
pub fn spawn_reader(socket: Arc<dyn MessageSocket>, tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let inbound = Inbound::Datagram {
                        from,
                        bytes: buf[..len].to_vec(),
                    };
                    if tx.send(inbound).await.is_err() {
                        return;
                    }
                }
                // ICMP unreachable from an earlier send surfaces here on some platforms.
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                    trace!(error = %e, "ignoring transient receive error");
                }
                Err(e) => {
                    let _ = tx.send(Inbound::Failed(e)).await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_other_family_fails_before_sending() {
        let subnet = Subnet::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let v6: SocketAddr = "[::1]:9".parse().unwrap();
        assert!(!subnet.accepts(&v6));
        assert!(matches!(
            subnet.send(v6, b"x").await,
            Err(SessionError::AddressFamilyMismatch(addr)) if addr == v6
        ));
    }

    #[tokio::test]
    async fn one_subnet_per_family() {
        let subnets = Subnets::bind(&["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()])
            .await
            .unwrap();
        assert_eq!(subnets.local_addrs().len(), 1);
        assert!(subnets.for_peer(&"10.0.0.1:1".parse().unwrap()).is_ok());
        assert!(subnets.for_peer(&"[::1]:1".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn empty_listen_list_is_rejected() {
        assert!(matches!(Subnets::bind(&[]).await, Err(SessionError::NoListenAddress)));
    }

    #[tokio::test]
    async fn reader_forwards_datagrams() {
        let receiver = Subnet::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = Subnet::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let reader = spawn_reader(receiver.socket(), tx);

        sender.send(receiver.local_addr(), b"hello").await.unwrap();
        match rx.recv().await {
            Some(Inbound::Datagram { from, bytes }) => {
                assert_eq!(from, sender.local_addr());
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        reader.abort();
    }
}
