//! Per-server and per-client session records.
//!
//! Sessions are shared (`Arc`) between the session tables and the reader /
//! writer tasks that serve them. Tables only decide *reachability*; a task
//! notices its session is gone through the session's cancellation token.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::flow::Credit;
use crate::frame::Frame;

/// Item on a server's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Close the server link once everything queued before this is written.
    Retire,
}

/// Forwarder-side state for one NAT'ed server's physical connection.
pub struct ServerSession {
    /// Primary identifier (the `INIT_SERVER` address). Keys client sessions.
    pub id: String,
    /// Address the forwarder observed for this server.
    pub peer: SocketAddr,
    /// Credit every new client of this server starts with, in both directions.
    pub default_credit: u32,
    pub connected_since: Instant,
    outbound: mpsc::Sender<Outbound>,
    /// Registered `(identity, port)` pairs clients may target.
    ports: Mutex<HashSet<(String, u16)>>,
    shutdown: CancellationToken,
}

impl ServerSession {
    pub(crate) fn new(
        id: String,
        peer: SocketAddr,
        default_credit: u32,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            peer,
            default_credit,
            connected_since: Instant::now(),
            outbound,
            ports: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue a frame for the server. Returns `false` if the session is gone.
    pub(crate) async fn enqueue(&self, frame: Frame) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            sent = self.outbound.send(Outbound::Frame(frame)) => sent.is_ok(),
        }
    }

    /// Ask the writer to close the link after flushing what is queued.
    pub(crate) async fn retire(&self) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            _ = self.outbound.send(Outbound::Retire) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn has_port(&self, identity: &str, port: u16) -> bool {
        self.ports_lock().contains(&(identity.to_string(), port))
    }

    pub(crate) fn add_port(&self, identity: &str, port: u16) {
        self.ports_lock().insert((identity.to_string(), port));
    }

    pub(crate) fn remove_port(&self, identity: &str, port: u16) {
        self.ports_lock().remove(&(identity.to_string(), port));
    }

    pub(crate) fn remove_identity_ports(&self, identity: &str) {
        self.ports_lock().retain(|(id, _)| id != identity);
    }

    fn ports_lock(&self) -> MutexGuard<'_, HashSet<(String, u16)>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Payload waiting to be written to a client, plus the credit bookkeeping
/// for the server→client direction.
#[derive(Debug)]
struct ToClient {
    queue: VecDeque<Bytes>,
    /// Bytes accepted from the server and not yet written to the client.
    queued: usize,
    /// Bytes the server may still send before it needs a `CONN_BUF_SIZE`.
    granted: usize,
    /// No more data will arrive; the writer exits once the queue drains.
    finishing: bool,
}

/// Forwarder-side state for one client's logical connection to a server.
pub struct ClientSession {
    pub client_id: String,
    /// Primary id of the owning server session.
    pub server_id: String,
    /// Identity and port the client asked for.
    pub target: String,
    pub port: u16,
    pub(crate) server: Arc<ServerSession>,
    /// Bytes the client may still send toward the server.
    pub server_buff_size: Credit,
    to_client: Mutex<ToClient>,
    to_client_ready: Notify,
    to_client_max: usize,
    shutdown: CancellationToken,
    reader_stop: CancellationToken,
}

impl ClientSession {
    pub(crate) fn new(
        client_id: String,
        target: String,
        port: u16,
        server: Arc<ServerSession>,
    ) -> Self {
        let credit = server.default_credit as usize;
        // Closing the server closes every client, table entry or not.
        let shutdown = server.shutdown_token().child_token();
        let reader_stop = shutdown.child_token();
        Self {
            client_id,
            server_id: server.id.clone(),
            target,
            port,
            server,
            server_buff_size: Credit::new(credit),
            to_client: Mutex::new(ToClient {
                queue: VecDeque::new(),
                queued: 0,
                granted: credit,
                finishing: false,
            }),
            to_client_ready: Notify::new(),
            to_client_max: credit,
            shutdown,
            reader_stop,
        }
    }

    /// Append server data for the client. Returns a fresh grant to announce
    /// to the server if the low-water mark was crossed.
    pub(crate) fn push_to_client(&self, payload: Bytes) -> Option<u32> {
        let grant = {
            let mut inner = self.lock();
            if inner.finishing {
                return None;
            }
            inner.granted = inner.granted.saturating_sub(payload.len());
            inner.queued += payload.len();
            inner.queue.push_back(payload);
            self.replenish(&mut inner)
        };
        self.to_client_ready.notify_one();
        grant
    }

    /// Next payload for the client, in arrival order. `None` once the
    /// session is finishing and the queue is empty.
    pub(crate) async fn next_for_client(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(payload) = inner.queue.pop_front() {
                    return Some(payload);
                }
                if inner.finishing {
                    return None;
                }
            }
            self.to_client_ready.notified().await;
        }
    }

    /// Record that `n` bytes reached the client socket.
    pub(crate) fn delivered(&self, n: usize) -> Option<u32> {
        let mut inner = self.lock();
        inner.queued = inner.queued.saturating_sub(n);
        self.replenish(&mut inner)
    }

    /// Stop accepting data, let the writer flush what is queued, then close.
    pub(crate) fn finish(&self) {
        self.reader_stop.cancel();
        self.lock().finishing = true;
        self.to_client_ready.notify_one();
    }

    /// Bytes queued for the client and not yet written.
    pub fn queued_to_client(&self) -> usize {
        self.lock().queued
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn reader_token(&self) -> &CancellationToken {
        &self.reader_stop
    }

    fn replenish(&self, inner: &mut ToClient) -> Option<u32> {
        if inner.granted > self.to_client_max / 2 {
            return None;
        }
        let room = self.to_client_max.saturating_sub(inner.queued);
        if room <= inner.granted {
            return None;
        }
        inner.granted = room;
        u32::try_from(room).ok()
    }

    fn lock(&self) -> MutexGuard<'_, ToClient> {
        self.to_client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(credit: u32) -> Arc<ServerSession> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(ServerSession::new(
            "srv-A".into(),
            "127.0.0.1:1".parse().unwrap(),
            credit,
            tx,
        ))
    }

    fn client(credit: u32) -> ClientSession {
        ClientSession::new("cli-1".into(), "srv-A".into(), 80, server(credit))
    }

    #[test]
    fn test_ports_per_identity() {
        let srv = server(10);
        srv.add_port("srv-A", 80);
        srv.add_port("alias", 81);
        assert!(srv.has_port("srv-A", 80));
        assert!(!srv.has_port("alias", 80));
        srv.remove_identity_ports("alias");
        assert!(!srv.has_port("alias", 81));
        srv.remove_port("srv-A", 80);
        assert!(!srv.has_port("srv-A", 80));
    }

    #[tokio::test]
    async fn test_to_client_is_fifo() {
        let cs = client(100);
        cs.push_to_client(Bytes::from_static(b"first"));
        cs.push_to_client(Bytes::from_static(b"second"));
        cs.push_to_client(Bytes::from_static(b"third"));
        assert_eq!(cs.next_for_client().await.unwrap(), "first");
        assert_eq!(cs.next_for_client().await.unwrap(), "second");
        assert_eq!(cs.next_for_client().await.unwrap(), "third");
    }

    #[test]
    fn test_grant_after_low_water_and_delivery() {
        let cs = client(100);
        // 40 in: granted 60, above the mark.
        assert_eq!(cs.push_to_client(Bytes::from(vec![0u8; 40])), None);
        // 20 more: granted 40 <= 50 but only 40 bytes of room.
        assert_eq!(cs.push_to_client(Bytes::from(vec![0u8; 20])), None);
        // Writer delivers 60: room 100 > granted 40.
        assert_eq!(cs.delivered(60), Some(100));
        assert_eq!(cs.queued_to_client(), 0);
        assert_eq!(cs.delivered(0), None);
    }

    #[tokio::test]
    async fn test_finish_drains_then_ends() {
        let cs = client(100);
        cs.push_to_client(Bytes::from_static(b"tail"));
        cs.finish();
        assert!(cs.reader_token().is_cancelled());
        assert_eq!(cs.push_to_client(Bytes::from_static(b"late")), None);
        assert_eq!(cs.next_for_client().await.unwrap(), "tail");
        assert!(cs.next_for_client().await.is_none());
    }

    #[test]
    fn test_server_close_reaches_finishing_client() {
        let srv = server(10);
        let cs = ClientSession::new("cli-1".into(), "srv-A".into(), 80, Arc::clone(&srv));
        cs.finish();
        assert!(!cs.is_closed());
        srv.close();
        assert!(cs.is_closed());
    }

    #[test]
    fn test_close_cancels_reader_token() {
        let cs = client(10);
        cs.close();
        assert!(cs.is_closed());
        assert!(cs.reader_token().is_cancelled());
    }
}
