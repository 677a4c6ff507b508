//! TCP listen server for the EDI bytestream output.
//!
//! Every accepted client receives the same frame stream through its own
//! bounded queue; a client that cannot keep up is dropped rather than
//! allowed to stall the transmitter.

use crate::TcpServerConfig;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, mpsc::error::TrySendError, watch};

#[derive(Debug, Clone, Copy)]
pub struct TcpServerStats {
    pub listen_port: u16,
    pub num_connections: usize,
}

#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<TcpServerInner>,
}

struct TcpServerInner {
    listen_port: u16,
    queue_frames: usize,
    next_client_id: AtomicU64,
    clients: Mutex<Vec<Client>>,
}

struct Client {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl TcpServer {
    pub async fn bind(config: &TcpServerConfig, shutdown: watch::Receiver<bool>) -> io::Result<TcpServer> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let listen_port = listener.local_addr()?.port();
        info!("EDI TCP output listening on port {listen_port}");
        let inner = Arc::new(TcpServerInner {
            listen_port,
            queue_frames: config.client_queue_frames.max(1),
            next_client_id: AtomicU64::new(0),
            clients: Mutex::new(Vec::new()),
        });
        tokio::spawn(accept_loop(listener, inner.clone(), shutdown));
        Ok(TcpServer { inner })
    }

    /// Queues `frame` towards every connected client. Clients with a full
    /// queue are disconnected.
    pub fn broadcast(&self, frame: Bytes) {
        self.inner.clients.lock().retain(|client| match client.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("dropping slow EDI TCP client {} on port {}", client.peer, self.inner.listen_port);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn stats(&self) -> TcpServerStats {
        TcpServerStats { listen_port: self.inner.listen_port, num_connections: self.inner.clients.lock().len() }
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<TcpServerInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = mpsc::channel(inner.queue_frames);
                    inner.clients.lock().push(Client { id, peer, tx });
                    debug!("EDI TCP client {peer} connected on port {}", inner.listen_port);
                    tokio::spawn(client_writer(stream, peer, id, rx, inner.clone()));
                }
                Err(err) => {
                    warn!("EDI TCP accept failed on port {}: {err}", inner.listen_port);
                    break;
                }
            }
        }
    }
}

async fn client_writer(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    mut rx: mpsc::Receiver<Bytes>,
    inner: Arc<TcpServerInner>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = stream.write_all(&frame).await {
            debug!("EDI TCP client {peer} write failed: {err}");
            break;
        }
    }
    inner.clients.lock().retain(|client| client.id != id);
    debug!("EDI TCP client {peer} disconnected from port {}", inner.listen_port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcasts_to_all_clients() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = TcpServer::bind(&TcpServerConfig { listen_port: 0, client_queue_frames: 8 }, shutdown_rx)
            .await
            .expect("bind");
        let port = server.listen_port();

        let mut a = TcpStream::connect(("127.0.0.1", port)).await.expect("connect a");
        let mut b = TcpStream::connect(("127.0.0.1", port)).await.expect("connect b");
        // wait for the accept loop to register both
        timeout(Duration::from_secs(2), async {
            while server.stats().num_connections < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clients registered");

        server.broadcast(Bytes::from_static(b"frame-1"));
        for stream in [&mut a, &mut b] {
            let mut buf = [0u8; 7];
            timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await.expect("read").expect("data");
            assert_eq!(&buf, b"frame-1");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_client_is_dropped() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = TcpServer::bind(&TcpServerConfig { listen_port: 0, client_queue_frames: 1 }, shutdown_rx)
            .await
            .expect("bind");
        // connect but never read
        let _stalled = TcpStream::connect(("127.0.0.1", server.listen_port())).await.expect("connect");
        timeout(Duration::from_secs(2), async {
            while server.stats().num_connections < 1 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client registered");

        // enough broadcasts to overflow the queue no matter how much the
        // writer task managed to flush into socket buffers
        let chunk = Bytes::from(vec![0u8; 256 * 1024]);
        for _ in 0..64 {
            server.broadcast(chunk.clone());
        }
        timeout(Duration::from_secs(2), async {
            while server.stats().num_connections > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slow client dropped");
    }
}
