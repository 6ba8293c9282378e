//! SIP UDP Transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::{ToSocketAddrs, UdpSocket};

use super::{Packet, Payload, Transport, TransportEvent, TransportStartup, TransportTx};
use crate::error::Result;
use crate::message::TransportKind;

#[derive(Debug)]
struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
}

/// UDP transport implementation.
#[derive(Debug, Clone)]
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;
        let addr = sock.local_addr()?;

        Ok(Self(Arc::new(Inner { sock, addr })))
    }

    /// Receive loop feeding packets into the endpoint event channel.
    pub(crate) async fn recv_from(udp: Arc<Self>, sender: TransportTx) -> Result<()> {
        let mut buf = vec![0u8; 4000];

        loop {
            let (len, addr) = udp.0.sock.recv_from(&mut buf).await?;

            let payload = Payload::new(bytes::Bytes::copy_from_slice(&buf[..len]));
            let packet = Packet {
                payload,
                addr,
                time: SystemTime::now(),
            };
            let transport = udp.clone() as Arc<dyn Transport>;

            sender
                .send(TransportEvent::Packet { transport, packet })
                .await
                .map_err(|_| crate::error::Error::ChannelClosed)?;
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn reliable(&self) -> bool {
        false
    }
}

/// Binds a UDP listener when the endpoint starts.
pub(crate) struct UdpStartup {
    addr: SocketAddr,
}

impl UdpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for UdpStartup {
    async fn start(&self, sender: TransportTx) -> Result<()> {
        let udp = UdpTransport::bind(self.addr).await?;

        tracing::debug!("SIP {} transport started, listening on {}", TransportKind::Udp, udp.addr());

        let arc_udp = Arc::new(udp.clone());
        let transport = Arc::new(udp) as Arc<dyn Transport>;

        sender
            .send(TransportEvent::Created(transport))
            .await
            .map_err(|_| crate::error::Error::ChannelClosed)?;

        tokio::spawn(Box::pin(UdpTransport::recv_from(arc_udp, sender)));

        Ok(())
    }
}
