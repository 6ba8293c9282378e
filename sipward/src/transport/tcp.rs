//! SIP TCP Transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use super::{Factory, Packet, StreamingDecoder, Transport, TransportEvent, TransportStartup, TransportTx};
use crate::error::{Error, Result};
use crate::message::TransportKind;

type TcpRead = FramedRead<ReadHalf<TcpStream>, StreamingDecoder>;
type TcpWrite = Arc<Mutex<WriteHalf<TcpStream>>>;

/// TCP transport implementation, one per connection.
#[derive(Clone)]
pub struct TcpTransport {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    write: TcpWrite,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.write.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;

        Ok(buf.len())
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn reliable(&self) -> bool {
        true
    }
}

/// A TCP server accepting incoming connections.
pub struct TcpServer {
    sock: TcpListener,
    addr: SocketAddr,
}

impl TcpServer {
    /// Creates a new TCP server.
    pub async fn create<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;

        Ok(Self { sock, addr })
    }

    /// Returns the listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming TCP connections by accepting and handling them.
    pub(crate) async fn handle_incoming(self, sender: TransportTx) -> Result<()> {
        loop {
            let (stream, addr) = match self.sock.accept().await {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::error!("Failed to accept connection: {:#}", err);
                    continue;
                }
            };

            tracing::debug!("Got incoming TCP connection from {}", addr);
            tokio::spawn(handle_connection(stream, addr, sender.clone()));
        }
    }
}

/// Splits a connected stream, registers the transport and spawns its read
/// loop. Shared by the accept path and the outbound factory.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, sender: TransportTx) -> Result<Arc<dyn Transport>> {
    let local_addr = stream.local_addr()?;
    let (read, write) = split(stream);

    let reader = FramedRead::new(read, StreamingDecoder);
    let write = Arc::new(Mutex::new(write));

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport {
        addr: local_addr,
        remote_addr: addr,
        write,
    });

    sender
        .send(TransportEvent::Created(transport.clone()))
        .await
        .map_err(|_| Error::ChannelClosed)?;

    {
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(err) = stream_read(reader, addr, transport, sender).await {
                tracing::warn!("TCP read loop ended; error = {:#}", err);
            }
        });
    }

    Ok(transport)
}

async fn stream_read(
    mut reader: TcpRead,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    sender: TransportTx,
) -> Result<()> {
    let key = transport.key();

    loop {
        match reader.next().await {
            Some(Ok(payload)) => {
                let time = SystemTime::now();
                let packet = Packet { payload, addr, time };
                let transport = transport.clone();

                sender
                    .send(TransportEvent::Packet { transport, packet })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
            }
            Some(Err(err)) => {
                sender
                    .send(TransportEvent::Closed(key))
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                return Err(Error::Io(err));
            }
            None => {
                sender
                    .send(TransportEvent::Closed(key))
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                return Ok(());
            }
        };
    }
}

/// Factory for outbound TCP connections.
#[derive(Clone, Copy, Default)]
pub struct TcpFactory;

#[async_trait::async_trait]
impl Factory for TcpFactory {
    async fn create(&self, addr: SocketAddr, sender: TransportTx) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr).await?;
        handle_connection(stream, addr, sender).await
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

/// Binds a TCP listener when the endpoint starts.
pub(crate) struct TcpStartup {
    addr: SocketAddr,
}

impl TcpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TcpStartup {
    async fn start(&self, sender: TransportTx) -> Result<()> {
        let tcp_server = TcpServer::create(self.addr).await?;

        tracing::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tcp,
            tcp_server.addr()
        );

        sender
            .send(TransportEvent::FactoryCreated(Box::new(TcpFactory)))
            .await
            .map_err(|_| Error::ChannelClosed)?;

        tokio::spawn(tcp_server.handle_incoming(sender));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpSocket;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Expires: 7200\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_accept_and_frame() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let server = TcpServer::create(addr).await.unwrap();
        let server_addr = server.addr();

        tokio::spawn(server.handle_incoming(tx));

        let socket = TcpSocket::new_v4().unwrap();
        let mut client = socket.connect(server_addr).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        client.write_all(MSG_TEST).await.unwrap();
        client.flush().await.unwrap();

        let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);
    }

    #[tokio::test]
    async fn test_close_is_reported() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let server = TcpServer::create(addr).await.unwrap();
        let server_addr = server.addr();

        tokio::spawn(server.handle_incoming(tx));

        let socket = TcpSocket::new_v4().unwrap();
        let client = socket.connect(server_addr).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        drop(client);

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed(_)));
    }
}
