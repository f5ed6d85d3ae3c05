//! Server side of a forwarder link.
//!
//! A [`Link`] is the one physical connection a NAT'ed server keeps open to
//! its forwarder. Every client the forwarder splices onto it appears as a
//! [`VirtualStream`] handed to the handler registered for the client's target
//! `(identity, port)`. Control-plane calls ride on short-lived virtual
//! streams of their own.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::NatError;
use crate::flow::Credit;
use crate::frame::{self, Frame, Status, CONTROL_PREFIX, DEFAULT_MAX_FRAME_SIZE};
use crate::rpc::{self, RpcCall, RpcRequest, RpcResponse};

/// Application callback for a new virtual connection.
pub type Handler = Arc<dyn Fn(VirtualStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(VirtualStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| Box::pin(f(stream)))
}

/// Largest payload put in a single `DATA_FORWARD` by [`VirtualStream::send`].
const SEND_CHUNK: usize = 64 * 1024;

/// Per-stream state shared between the link reader and the application.
struct StreamShared {
    address: String,
    port: u16,
    /// Outgoing budget; `None` for control streams.
    credit: Option<Credit>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: CancellationToken,
}

impl StreamShared {
    fn new(
        address: String,
        port: u16,
        credit: Option<Credit>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            address,
            port,
            credit,
            inbound: Mutex::new(Some(tx)),
            closed: CancellationToken::new(),
        });
        (shared, rx)
    }

    fn deliver(&self, payload: Bytes) {
        if let Some(tx) = self.inbound_lock().as_ref() {
            let _ = tx.send(payload);
        }
    }

    /// Peer finished sending: pending data stays readable, nothing more
    /// arrives. Returns `false` if inbound had already ended.
    fn end_inbound(&self) -> bool {
        self.inbound_lock().take().is_some()
    }

    /// Both directions are done.
    fn shut(&self) {
        self.end_inbound();
        self.closed.cancel();
    }

    fn inbound_lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LinkInner {
    id: String,
    forwarder: SocketAddr,
    local_addr: SocketAddr,
    default_credit: u32,
    outbound: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<String, Arc<StreamShared>>>,
    handlers: Mutex<HashMap<(String, u16), Handler>>,
    next_call: AtomicU64,
    rpc_timeout: Duration,
    shutdown: CancellationToken,
}

impl LinkInner {
    fn streams(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamShared>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<(String, u16), Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_frame(&self, frame: Frame) -> Result<(), NatError> {
        if self.shutdown.is_cancelled() {
            return Err(NatError::LinkClosed);
        }
        self.outbound.send(frame).map_err(|_| NatError::LinkClosed)
    }

    fn open_stream(
        self: &Arc<Self>,
        address: String,
        port: u16,
        flow_controlled: bool,
    ) -> VirtualStream {
        let credit = flow_controlled.then(|| Credit::new(self.default_credit as usize));
        let (shared, inbound) = StreamShared::new(address.clone(), port, credit);
        self.streams().insert(address, Arc::clone(&shared));
        VirtualStream {
            shared,
            inbound,
            link: Arc::clone(self),
            unacked: 0,
        }
    }

    fn forget_stream(&self, shared: &Arc<StreamShared>) {
        let mut streams = self.streams();
        if streams
            .get(&shared.address)
            .is_some_and(|s| Arc::ptr_eq(s, shared))
        {
            streams.remove(&shared.address);
        }
    }
}

/// A server's multiplexed connection to a forwarder.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Connect to `forwarder`, announce `id` with `INIT_SERVER`, and start the
    /// link's reader and writer tasks.
    pub async fn connect(
        forwarder: SocketAddr,
        id: &str,
        default_credit: u32,
        connect_timeout: Duration,
    ) -> Result<Self, NatError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(forwarder))
            .await
            .map_err(|_| NatError::Connect(format!("{forwarder}: timed out")))?
            .map_err(|e| NatError::Connect(format!("{forwarder}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        frame::write_frame(&mut writer, &Frame::init_server(id, default_credit)).await?;
        match frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await? {
            Frame::Status { status: Status::Confirmed, .. } => {}
            Frame::Status { status, .. } => return Err(NatError::Refused(status.as_str().to_string())),
            other => {
                return Err(NatError::Refused(format!(
                    "unexpected frame kind {} during init",
                    other.kind()
                )))
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(LinkInner {
            id: id.to_string(),
            forwarder,
            local_addr,
            default_credit,
            outbound: outbound_tx,
            streams: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            rpc_timeout: connect_timeout.max(Duration::from_secs(1)),
            shutdown: CancellationToken::new(),
        });
        info!(server = %id, %forwarder, "Link established");

        let span = info_span!("link", server = %id);
        tokio::spawn(link_writer(Arc::clone(&inner), writer, outbound_rx).instrument(span.clone()));
        tokio::spawn(link_reader(Arc::clone(&inner), reader).instrument(span));
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn forwarder(&self) -> SocketAddr {
        self.inner.forwarder
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop both link tasks. Open virtual streams see end of stream.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub(crate) fn listen(&self, identity: &str, port: u16, handler: Handler) {
        self.inner
            .handlers()
            .insert((identity.to_string(), port), handler);
    }

    pub(crate) fn unlisten(&self, identity: &str, port: u16) {
        self.inner.handlers().remove(&(identity.to_string(), port));
    }

    /// Number of open virtual streams, control streams included.
    pub fn open_streams(&self) -> usize {
        self.inner.streams().len()
    }

    /// Run one control-plane call and return its `result` on success.
    pub async fn call(&self, call: RpcCall) -> Result<Value, NatError> {
        let function = call.name();
        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let address = format!("{CONTROL_PREFIX}{id}");
        let mut stream = self.inner.open_stream(address, 0, false);

        let request = rpc::encode(&RpcRequest { id, call })?;
        stream.send(&request).await?;

        let reply = tokio::time::timeout(self.inner.rpc_timeout, stream.read_to_end())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{function} timed out")))?;
        stream.forget();
        let response: RpcResponse = rpc::decode(&reply)?;
        debug!(function, status = response.status, "Control call answered");
        if response.status {
            Ok(response.result)
        } else {
            Err(NatError::Rejected { function })
        }
    }
}

/// One logical connection multiplexed over a [`Link`].
pub struct VirtualStream {
    shared: Arc<StreamShared>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    link: Arc<LinkInner>,
    /// Bytes received since the last credit grant.
    unacked: usize,
}

impl VirtualStream {
    /// Identifier of the remote end (the client id for application streams).
    pub fn peer_id(&self) -> &str {
        &self.shared.address
    }

    /// Local port the remote end connected to.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Closed in both directions; `send` fails from here on.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Send `data`, waiting for credit as needed.
    pub async fn send(&self, data: &[u8]) -> Result<(), NatError> {
        let mut rest = data;
        while !rest.is_empty() {
            let allowed = match &self.shared.credit {
                Some(credit) => tokio::select! {
                    () = self.shared.closed.cancelled() => return Err(closed_stream()),
                    () = self.link.shutdown.cancelled() => return Err(NatError::LinkClosed),
                    n = credit.available() => n,
                },
                None => rest.len(),
            };
            if self.is_closed() {
                return Err(closed_stream());
            }
            let n = allowed.min(SEND_CHUNK).min(rest.len());
            if let Some(credit) = &self.shared.credit {
                credit.consume(n);
            }
            self.link.send_frame(Frame::data(
                self.shared.address.clone(),
                Bytes::copy_from_slice(&rest[..n]),
            ))?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Next chunk from the peer, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let payload = self.inbound.recv().await?;
        if self.shared.credit.is_some() {
            self.unacked += payload.len();
            let default_credit = self.link.default_credit as usize;
            if self.unacked >= default_credit {
                self.unacked -= default_credit;
                let _ = self.link.send_frame(Frame::buf_size(
                    self.shared.address.clone(),
                    self.link.default_credit,
                ));
            }
        }
        Some(payload)
    }

    /// Collect everything the peer sends until it closes the stream.
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.recv().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }

    /// Close the stream and tell the peer. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.shut();
        self.link.forget_stream(&self.shared);
        let _ = self.link.send_frame(Frame::term(self.shared.address.clone()));
    }

    /// Drop local state without telling the peer (it already closed).
    fn forget(&self) {
        self.shared.shut();
        self.link.forget_stream(&self.shared);
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_stream() -> NatError {
    NatError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "virtual stream closed"))
}

async fn link_writer(
    inner: Arc<LinkInner>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = frame::write_frame(&mut writer, &frame).await {
            warn!("Link write failed: {e}");
            break;
        }
    }
    inner.shutdown.cancel();
}

async fn link_reader(inner: Arc<LinkInner>, mut reader: OwnedReadHalf) {
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            read = frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE) => match read {
                Ok(frame) => frame,
                Err(e) => {
                    info!("Link closed: {e}");
                    break;
                }
            },
        };
        match frame {
            Frame::InitClient { client, target } => {
                let handler = inner
                    .handlers()
                    .get(&(target.server.clone(), target.port))
                    .cloned();
                let Some(handler) = handler else {
                    debug!(client = %client, server = %target.server, port = target.port, "No handler for client, closing");
                    let _ = inner.send_frame(Frame::term(client));
                    continue;
                };
                debug!(client = %client, port = target.port, "Client arrived");
                let stream = inner.open_stream(client, target.port, true);
                tokio::spawn(handler(stream));
            }
            Frame::Data { address, payload } => {
                let stream = inner.streams().get(&address).cloned();
                match stream {
                    Some(stream) => stream.deliver(payload),
                    None => debug!(stream = %address, "Data for unknown stream dropped"),
                }
            }
            // The first CONN_TERM ends the peer's sending side; sends stay
            // allowed until a second one (or a local close).
            Frame::ConnTerm { address } => {
                let stream = inner.streams().get(&address).cloned();
                if let Some(stream) = stream {
                    if !stream.end_inbound() {
                        inner.forget_stream(&stream);
                        stream.shut();
                    }
                }
            }
            Frame::BufSize { address, size } => {
                let stream = inner.streams().get(&address).cloned();
                if let Some(credit) = stream.as_ref().and_then(|s| s.credit.as_ref()) {
                    credit.set(size as usize);
                }
            }
            other => warn!(kind = other.kind(), "Ignoring unexpected frame on link"),
        }
    }
    inner.shutdown.cancel();
    let streams: Vec<Arc<StreamShared>> = inner.streams().drain().map(|(_, s)| s).collect();
    for stream in streams {
        stream.shut();
    }
    info!(server = %inner.id, "Link down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one link, confirm it, and hand back the forwarder-side socket.
    async fn fake_forwarder() -> (SocketAddr, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let init = frame::read_frame(&mut sock, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
            assert_eq!(init, Frame::init_server("srv-A", 8));
            frame::write_frame(&mut sock, &Frame::status(Status::Confirmed))
                .await
                .unwrap();
            sock
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_handler_receives_client_and_grants_credit() {
        let (addr, task) = fake_forwarder().await;
        let link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let mut fwd = task.await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        link.listen(
            "srv-A",
            80,
            handler(move |mut stream: VirtualStream| {
                let tx = tx.clone();
                async move {
                    let data = stream.read_to_end().await;
                    let _ = tx.send((stream.peer_id().to_string(), data));
                }
            }),
        );

        frame::write_frame(&mut fwd, &Frame::init_client("cli-1", "srv-A", 80))
            .await
            .unwrap();
        frame::write_frame(&mut fwd, &Frame::data("cli-1", &b"12345678"[..]))
            .await
            .unwrap();
        frame::write_frame(&mut fwd, &Frame::data("cli-1", &b"9"[..]))
            .await
            .unwrap();
        frame::write_frame(&mut fwd, &Frame::term("cli-1")).await.unwrap();

        let (peer, data) = rx.recv().await.unwrap();
        assert_eq!(peer, "cli-1");
        assert_eq!(data, "123456789");

        // A full default credit was consumed, so exactly one grant comes back.
        let grant = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(grant, Frame::buf_size("cli-1", 8));
    }

    #[tokio::test]
    async fn test_unknown_port_is_terminated() {
        let (addr, task) = fake_forwarder().await;
        let _link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let mut fwd = task.await.unwrap();
        frame::write_frame(&mut fwd, &Frame::init_client("cli-1", "srv-A", 81))
            .await
            .unwrap();
        let reply = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(reply, Frame::term("cli-1"));
    }

    #[tokio::test]
    async fn test_send_waits_for_credit() {
        let (addr, task) = fake_forwarder().await;
        let link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let mut fwd = task.await.unwrap();
        let stream = link.inner.open_stream("cli-1".into(), 80, true);

        let sender = tokio::spawn(async move {
            stream.send(b"0123456789AB").await.unwrap();
            stream
        });
        let first = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(first, Frame::data("cli-1", &b"01234567"[..]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        frame::write_frame(&mut fwd, &Frame::buf_size("cli-1", 100))
            .await
            .unwrap();
        let second = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(second, Frame::data("cli-1", &b"89AB"[..]));
        let stream = sender.await.unwrap();
        drop(stream);
        let term = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(term, Frame::term("cli-1"));
    }

    #[tokio::test]
    async fn test_rpc_call_round_trip() {
        let (addr, task) = fake_forwarder().await;
        let link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let mut fwd = task.await.unwrap();

        let call = tokio::spawn({
            let link = link.clone();
            async move { link.call(RpcCall::RegisterServer("alias".into())).await }
        });
        let Frame::Data { address, payload } =
            frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap()
        else {
            panic!("expected a control request");
        };
        assert!(frame::is_control_address(&address));
        let request: RpcRequest = rpc::decode(&payload).unwrap();
        assert_eq!(request.call, RpcCall::RegisterServer("alias".into()));

        let reply = rpc::encode(&RpcResponse::failed(request.id)).unwrap();
        frame::write_frame(&mut fwd, &Frame::data(address.clone(), reply))
            .await
            .unwrap();
        frame::write_frame(&mut fwd, &Frame::term(address)).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, NatError::Rejected { function: "REGISTER_SERVER" }));
        assert_eq!(link.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_link_down_ends_streams() {
        let (addr, task) = fake_forwarder().await;
        let link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let fwd = task.await.unwrap();
        let mut stream = link.inner.open_stream("cli-1".into(), 80, true);
        drop(fwd);
        assert!(stream.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!link.is_alive());
    }

    #[tokio::test]
    async fn test_send_after_peer_finished_sending() {
        let (addr, task) = fake_forwarder().await;
        let link = Link::connect(addr, "srv-A", 8, Duration::from_secs(2))
            .await
            .unwrap();
        let mut fwd = task.await.unwrap();
        let mut stream = link.inner.open_stream("cli-1".into(), 80, true);

        frame::write_frame(&mut fwd, &Frame::data("cli-1", &b"ping"[..]))
            .await
            .unwrap();
        frame::write_frame(&mut fwd, &Frame::term("cli-1")).await.unwrap();
        assert_eq!(stream.read_to_end().await, "ping");
        assert!(!stream.is_closed());

        stream.send(b"pong").await.unwrap();
        let reply = frame::read_frame(&mut fwd, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(reply, Frame::data("cli-1", &b"pong"[..]));

        // A second CONN_TERM means the peer is gone entirely.
        frame::write_frame(&mut fwd, &Frame::term("cli-1")).await.unwrap();
        for _ in 0..100 {
            if stream.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stream.is_closed());
        assert!(stream.send(b"late").await.is_err());
        assert_eq!(link.open_streams(), 0);
    }
}
