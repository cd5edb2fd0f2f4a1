//! Stream-socket transport (`mtcp://host:port`).
//!
//! Stream sockets have no separate channel handshake: the logical channel
//! is up the moment the connection exists, so the transport delivers
//! `ChannelUp` right after `ConnectionUp` and `request_channel` is a
//! no-op. The reader task turns socket bytes into RX-callback pushes and
//! socket close into a `ConnectionDown` event.

use crate::instance::{ClaInstance, Connection, LifecycleEvent};
use crate::pool::PoolBuf;
use crate::{address, ClaError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// One TCP connection implementing the transport side of the op table.
pub struct TcpConnection {
    peer: String,
    initiator: bool,
    mtu: usize,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: Notify,
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer_identifier(&self) -> String {
        self.peer.clone()
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn request_channel(&self) -> Result<(), ClaError> {
        Ok(())
    }

    async fn submit(&self, buf: PoolBuf) -> Result<(), ClaError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf.data).await?;
        // The kernel owns the bytes now; release the pool slot.
        buf.complete();
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.writer.lock().await.shutdown().await;
            self.close_notify.notify_one();
        }
    }
}

/// Launch the TCP transport for a CLA instance.
///
/// Binds `listen_addr` (when given) and dials every address in `peers`.
/// Returns the bound local address so callers can learn an ephemeral
/// port.
pub async fn launch(
    instance: Arc<ClaInstance>,
    listen_addr: Option<String>,
    peers: Vec<String>,
) -> Result<Option<SocketAddr>, ClaError> {
    let mut local_addr = None;
    if let Some(addr) = listen_addr {
        let listener = TcpListener::bind(&addr).await?;
        local_addr = Some(listener.local_addr()?);
        info!("{}: listening on {}", instance.name(), local_addr.unwrap());
        let accept_instance = instance.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("{}: accepted {}", accept_instance.name(), peer);
                        tokio::spawn(run_connection(
                            accept_instance.clone(),
                            stream,
                            peer.to_string(),
                            false,
                        ));
                    }
                    Err(e) => {
                        warn!("{}: accept failed: {}", accept_instance.name(), e);
                        break;
                    }
                }
            }
        });
    }

    for peer in peers {
        let dial_instance = instance.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&peer).await {
                Ok(stream) => run_connection(dial_instance, stream, peer, true).await,
                Err(e) => warn!("{}: dial {} failed: {}", dial_instance.name(), peer, e),
            }
        });
    }
    Ok(local_addr)
}

async fn run_connection(
    instance: Arc<ClaInstance>,
    stream: TcpStream,
    peer: String,
    initiator: bool,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let conn = Arc::new(TcpConnection {
        peer: peer.clone(),
        initiator,
        mtu: instance.config().mtu,
        writer: Mutex::new(write_half),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });
    let addr = address::make_cla_addr(instance.name(), &peer);

    instance
        .enqueue_event(LifecycleEvent::ConnectionUp(conn.clone()))
        .await;
    instance
        .enqueue_event(LifecycleEvent::ChannelUp(conn.clone()))
        .await;

    read_loop(&instance, &conn, read_half, &addr).await;

    conn.close().await;
    instance
        .enqueue_event(LifecycleEvent::ConnectionDown(conn))
        .await;
}

async fn read_loop(
    instance: &ClaInstance,
    conn: &TcpConnection,
    mut read_half: OwnedReadHalf,
    cla_addr: &str,
) {
    let mut buf = [0u8; 2048];
    loop {
        if conn.closed.load(Ordering::Acquire) {
            return;
        }
        tokio::select! {
            _ = conn.close_notify.notified() => return,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("{}: peer closed the stream", cla_addr);
                    return;
                }
                Ok(n) => instance.handle_rx(cla_addr, &buf[..n]).await,
                Err(e) => {
                    debug!("{}: read failed: {}", cla_addr, e);
                    return;
                }
            }
        }
    }
}
