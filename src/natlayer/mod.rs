//! Client library for reaching through a forwarder.
//!
//! Servers behind NAT call [`NatLayer::nat_waitforconn`] to accept virtual
//! connections over one shared [`Link`]; clients call
//! [`NatLayer::nat_openconn`] to get a plain `TcpStream` spliced to such a
//! server. A `NatLayer` is cheap to clone and all clones share one link.

mod discovery;
mod link;

pub use discovery::{Discovery, StaticDiscovery};
pub use link::{handler, Handler, Link, VirtualStream};

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::NatConfig;
use crate::error::NatError;
use crate::frame::{self, ClientInit, Frame, Status, CONTROL_PREFIX, DEFAULT_MAX_FRAME_SIZE};
use crate::rpc::{self, ExternalAddr, PortParams, RpcCall, RpcRequest, RpcResponse};

/// Returned by [`NatLayer::nat_waitforconn`]; pass to [`NatLayer::nat_stopcomm`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenHandle {
    pub id: String,
    pub port: u16,
}

#[derive(Default)]
struct LayerState {
    link: Option<Link>,
    /// Identities registered over `link` and their listening ports.
    listening: HashMap<String, HashSet<u16>>,
    /// Every handle not yet stopped, with what it takes to register it again.
    handles: HashMap<ListenHandle, Registration>,
}

struct Registration {
    handler: Handler,
    forwarder: Option<SocketAddr>,
    persist: CancellationToken,
}

#[derive(Clone)]
pub struct NatLayer {
    state: Arc<Mutex<LayerState>>,
    discovery: Arc<dyn Discovery>,
    config: NatConfig,
}

impl NatLayer {
    pub fn new(config: NatConfig, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LayerState::default())),
            discovery,
            config,
        }
    }

    /// Layer using the config's forwarder list for discovery.
    pub fn with_static_discovery(config: NatConfig) -> Self {
        let discovery = Arc::new(StaticDiscovery::from_config(&config));
        Self::new(config, discovery)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs.max(1))
    }

    /// Accept virtual connections to `(local_id, local_port)` through a
    /// forwarder, running `handler` for each one. Unless persistence is
    /// disabled, the registration is re-established whenever the link is lost.
    pub async fn nat_waitforconn(
        &self,
        local_id: &str,
        local_port: u16,
        handler: Handler,
        forwarder: Option<SocketAddr>,
    ) -> Result<ListenHandle, NatError> {
        if !frame::is_valid_id(local_id) {
            return Err(NatError::Refused(format!("invalid identity '{local_id}'")));
        }
        let handle = ListenHandle {
            id: local_id.to_string(),
            port: local_port,
        };
        let mut state = self.state.lock().await;
        if state.handles.contains_key(&handle) {
            return Err(NatError::AlreadyListening {
                id: handle.id,
                port: local_port,
            });
        }
        self.register(&mut state, &handle, Arc::clone(&handler), forwarder)
            .await?;

        let persist = CancellationToken::new();
        state.handles.insert(
            handle.clone(),
            Registration {
                handler,
                forwarder,
                persist: persist.clone(),
            },
        );
        drop(state);

        if self.config.persist_interval_secs > 0 {
            let span = info_span!("persist", id = %handle.id, port = local_port);
            tokio::spawn(self.clone().persist(handle.clone(), persist).instrument(span));
        }
        Ok(handle)
    }

    /// Register `handle` over the current link, opening one if needed. On
    /// failure everything this call registered is undone.
    async fn register(
        &self,
        state: &mut LayerState,
        handle: &ListenHandle,
        handler: Handler,
        forwarder: Option<SocketAddr>,
    ) -> Result<(), NatError> {
        let link = self.ensure_link(state, &handle.id, forwarder).await?;
        let id = handle.id.as_str();

        let new_identity = !state.listening.contains_key(id);
        if new_identity {
            if let Err(e) = link.call(RpcCall::RegisterServer(id.to_string())).await {
                Self::release_if_idle(state);
                return Err(e);
            }
            if let Err(e) = self.discovery.announce(id, link.forwarder()).await {
                warn!(id = %id, "Announcement failed: {e}");
            }
        }

        link.listen(id, handle.port, handler);
        let registered = link
            .call(RpcCall::RegisterPort(PortParams {
                server: id.to_string(),
                port: handle.port,
            }))
            .await;
        if let Err(e) = registered {
            link.unlisten(id, handle.port);
            if new_identity {
                self.release_identity(&link, id).await;
            }
            Self::release_if_idle(state);
            return Err(e);
        }

        state
            .listening
            .entry(id.to_string())
            .or_default()
            .insert(handle.port);
        info!(id = %id, port = handle.port, forwarder = %link.forwarder(), "Listening via forwarder");
        Ok(())
    }

    /// Deregister `id` at the forwarder and withdraw its announcement.
    async fn release_identity(&self, link: &Link, id: &str) {
        if link.is_alive() {
            if let Err(e) = link.call(RpcCall::DeregisterServer(id.to_string())).await {
                warn!(id = %id, "Identity deregistration failed: {e}");
            }
        }
        if let Err(e) = self.discovery.withdraw(id).await {
            warn!(id = %id, "Withdrawal failed: {e}");
        }
    }

    fn release_if_idle(state: &mut LayerState) {
        if !state.listening.is_empty() {
            return;
        }
        if let Some(link) = state.link.take() {
            link.close();
            info!("Released forwarder link");
        }
    }

    /// Keep `handle` registered until `stop` fires.
    async fn persist(self, handle: ListenHandle, stop: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.persist_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            let mut state = self.state.lock().await;
            if stop.is_cancelled() {
                return;
            }
            let Some(registration) = state.handles.get(&handle) else {
                return;
            };
            let handler = Arc::clone(&registration.handler);
            let forwarder = registration.forwarder;
            let live = state.link.as_ref().is_some_and(Link::is_alive)
                && state
                    .listening
                    .get(&handle.id)
                    .is_some_and(|ports| ports.contains(&handle.port));
            if live {
                continue;
            }
            match self.register(&mut state, &handle, handler, forwarder).await {
                Ok(()) => info!("Registration restored"),
                Err(e) => warn!("Re-registration failed, will retry: {e}"),
            }
        }
    }

    /// Reuse the live link or open a new one announcing `local_id`.
    async fn ensure_link(
        &self,
        state: &mut LayerState,
        local_id: &str,
        forwarder: Option<SocketAddr>,
    ) -> Result<Link, NatError> {
        if let Some(link) = state.link.as_ref().filter(|link| link.is_alive()) {
            return Ok(link.clone());
        }
        if state.link.take().is_some() {
            // Registrations died with the old link.
            warn!("Forwarder link lost, reconnecting");
            state.listening.clear();
        }

        let candidates = self.forwarder_candidates(forwarder).await?;
        let mut failures = Vec::new();
        for addr in candidates {
            match Link::connect(addr, local_id, self.config.default_credit, self.connect_timeout())
                .await
            {
                Ok(link) => {
                    state.link = Some(link.clone());
                    return Ok(link);
                }
                Err(e) => {
                    debug!(forwarder = %addr, "Link attempt failed: {e}");
                    failures.push(e.to_string());
                }
            }
        }
        Err(NatError::Connect(failures.join("; ")))
    }

    /// Open a byte stream to `server`'s `port` through a forwarder.
    pub async fn nat_openconn(
        &self,
        server: &str,
        port: u16,
        forwarder: Option<SocketAddr>,
    ) -> Result<TcpStream, NatError> {
        let candidates = match forwarder {
            Some(addr) => vec![addr],
            None => self.discovery.lookup_server(server).await?,
        };
        let stream = self.connect_any(&candidates).await?;
        let (mut reader, mut writer) = stream.into_split();

        let client_id = nat_getmyid();
        frame::write_frame(&mut writer, &Frame::init_client(client_id.as_str(), server, port))
            .await?;
        let reply = tokio::time::timeout(
            self.connect_timeout(),
            frame::read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply to INIT_CLIENT"))??;

        match reply {
            Frame::Status { status: Status::Confirmed, .. } => {
                debug!(client = %client_id, server, port, "Connected through forwarder");
                reader
                    .reunite(writer)
                    .map_err(|e| NatError::Io(io::Error::other(e.to_string())))
            }
            Frame::Status { status: Status::NoServer, .. } => Err(NatError::NoServer(server.to_string())),
            Frame::Status { status: Status::BusyServer, .. } => Err(NatError::BusyServer(server.to_string())),
            Frame::Status { status, .. } => Err(NatError::Refused(status.as_str().to_string())),
            other => Err(NatError::Refused(format!(
                "unexpected frame kind {}",
                other.kind()
            ))),
        }
    }

    /// Stop listening on `handle`. Unknown or already-stopped handles are a no-op.
    pub async fn nat_stopcomm(&self, handle: &ListenHandle) -> Result<(), NatError> {
        let mut state = self.state.lock().await;
        if let Some(registration) = state.handles.remove(handle) {
            registration.persist.cancel();
        }
        let Some(ports) = state.listening.get_mut(&handle.id) else {
            return Ok(());
        };
        if !ports.remove(&handle.port) {
            return Ok(());
        }
        let last_port = ports.is_empty();
        if last_port {
            state.listening.remove(&handle.id);
        }
        let Some(link) = state.link.clone() else {
            return Ok(());
        };
        link.unlisten(&handle.id, handle.port);

        if link.is_alive() {
            let port = RpcCall::DeregisterPort(PortParams {
                server: handle.id.clone(),
                port: handle.port,
            });
            if let Err(e) = link.call(port).await {
                warn!(id = %handle.id, port = handle.port, "Port deregistration failed: {e}");
            }
        }
        if last_port {
            self.release_identity(&link, &handle.id).await;
        }
        Self::release_if_idle(&mut state);
        Ok(())
    }

    /// The address the forwarder sees this host connecting from.
    pub async fn external_addr(&self, forwarder: Option<SocketAddr>) -> Result<ExternalAddr, NatError> {
        let (result, _) = self.oneshot(forwarder, RpcCall::ExternalAddr).await?;
        Ok(serde_json::from_value(result).map_err(crate::error::RpcError::from)?)
    }

    /// Whether the forwarder observes a different IP than the one this host
    /// used to reach it.
    pub async fn behind_nat(&self, forwarder: Option<SocketAddr>) -> Result<bool, NatError> {
        let (result, local) = self.oneshot(forwarder, RpcCall::ExternalAddr).await?;
        let external: ExternalAddr =
            serde_json::from_value(result).map_err(crate::error::RpcError::from)?;
        let observed: IpAddr = external
            .ip
            .parse()
            .map_err(|_| NatError::Refused(format!("bad external address '{}'", external.ip)))?;
        Ok(observed != local.ip())
    }

    /// Status an `INIT_CLIENT` for `(server, port)` would currently receive.
    pub async fn probe_server(
        &self,
        server: &str,
        port: u16,
        forwarder: Option<SocketAddr>,
    ) -> Result<String, NatError> {
        let call = RpcCall::ClientInit(ClientInit {
            server: server.to_string(),
            port,
        });
        let (result, _) = self.oneshot(forwarder, call).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    /// Whether this layer holds a live forwarder link.
    pub async fn nat_isalive(&self) -> bool {
        self.state
            .lock()
            .await
            .link
            .as_ref()
            .is_some_and(Link::is_alive)
    }

    pub fn nat_getmyid(&self) -> String {
        nat_getmyid()
    }

    async fn forwarder_candidates(
        &self,
        forwarder: Option<SocketAddr>,
    ) -> Result<Vec<SocketAddr>, NatError> {
        match forwarder {
            Some(addr) => Ok(vec![addr]),
            None => self.discovery.lookup_forwarders().await,
        }
    }

    async fn connect_any(&self, candidates: &[SocketAddr]) -> Result<TcpStream, NatError> {
        if candidates.is_empty() {
            return Err(NatError::Discovery("no forwarder candidates".to_string()));
        }
        let mut failures = Vec::new();
        for addr in candidates {
            match tokio::time::timeout(self.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => failures.push(format!("{addr}: {e}")),
                Err(_) => failures.push(format!("{addr}: timed out")),
            }
        }
        Err(NatError::Connect(failures.join("; ")))
    }

    /// One control request on its own connection. Returns the result and the
    /// local address of that connection.
    async fn oneshot(
        &self,
        forwarder: Option<SocketAddr>,
        call: RpcCall,
    ) -> Result<(Value, SocketAddr), NatError> {
        let function = call.name();
        let candidates = self.forwarder_candidates(forwarder).await?;
        let stream = self.connect_any(&candidates).await?;
        let local = stream.local_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let request = rpc::encode(&RpcRequest { id: 1, call })?;
        let address = format!("{CONTROL_PREFIX}{}", uuid::Uuid::new_v4().simple());
        frame::write_frame(&mut writer, &Frame::data(address, request)).await?;

        let reply = tokio::time::timeout(self.connect_timeout(), read_control_reply(&mut reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{function} timed out")))??;

        let response: RpcResponse = rpc::decode(&reply)?;
        if !response.status {
            return Err(NatError::Rejected { function });
        }
        Ok((response.result, local))
    }
}

/// Concatenate `DATA_FORWARD` payloads until the forwarder closes the stream.
async fn read_control_reply(reader: &mut OwnedReadHalf) -> Result<BytesMut, NatError> {
    let mut reply = BytesMut::new();
    loop {
        match frame::read_frame(reader, DEFAULT_MAX_FRAME_SIZE).await? {
            Frame::Data { payload, .. } => reply.extend_from_slice(&payload),
            Frame::ConnTerm { .. } => return Ok(reply),
            other => {
                return Err(NatError::Refused(format!(
                    "unexpected frame kind {} in control reply",
                    other.kind()
                )))
            }
        }
    }
}

/// A fresh identifier for this host: `<local-ip>#<random>`.
pub fn nat_getmyid() -> String {
    format!("{}#{}", local_ip(), uuid::Uuid::new_v4().simple())
}

/// IP of the interface used for outbound traffic. Connecting a UDP socket
/// sends nothing; it only selects a route.
fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|sock| {
            sock.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            sock.local_addr()
        })
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> NatLayer {
        NatLayer::with_static_discovery(NatConfig {
            connect_timeout_secs: 1,
            ..NatConfig::default()
        })
    }

    #[test]
    fn test_getmyid_is_unique_and_valid() {
        let a = nat_getmyid();
        let b = nat_getmyid();
        assert_ne!(a, b);
        assert!(a.contains('#'));
        assert!(frame::is_valid_id(&a));
    }

    #[tokio::test]
    async fn test_stopcomm_unknown_handle_is_noop() {
        let layer = layer();
        let handle = ListenHandle {
            id: "srv-A".into(),
            port: 80,
        };
        layer.nat_stopcomm(&handle).await.unwrap();
        layer.nat_stopcomm(&handle).await.unwrap();
        assert!(!layer.nat_isalive().await);
    }

    #[tokio::test]
    async fn test_openconn_without_forwarders_fails_discovery() {
        let err = layer().nat_openconn("srv-A", 80, None).await.unwrap_err();
        assert!(matches!(err, NatError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_openconn_unreachable_forwarder() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = layer()
            .nat_openconn("srv-A", 80, Some(addr))
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::Connect(_)));
    }

    #[tokio::test]
    async fn test_waitforconn_rejects_reserved_identity() {
        let err = layer()
            .nat_waitforconn("!rpc:x", 80, handler(|_s| async {}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::Refused(_)));
    }

    /// Answer the next control request on a fake forwarder socket.
    async fn answer(sock: &mut TcpStream, ok: bool) -> RpcCall {
        let Frame::Data { address, payload } =
            frame::read_frame(sock, DEFAULT_MAX_FRAME_SIZE).await.unwrap()
        else {
            panic!("expected a control request");
        };
        let request: RpcRequest = rpc::decode(&payload).unwrap();
        let response = if ok {
            RpcResponse::ok(request.id, Value::Bool(true))
        } else {
            RpcResponse::failed(request.id)
        };
        let body = rpc::encode(&response).unwrap();
        frame::write_frame(sock, &Frame::data(address.clone(), body))
            .await
            .unwrap();
        frame::write_frame(sock, &Frame::term(address)).await.unwrap();
        request.call
    }

    #[tokio::test]
    async fn test_failed_port_registration_rolls_back() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let forwarder = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let init = frame::read_frame(&mut sock, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
            assert!(matches!(init, Frame::InitServer { .. }));
            frame::write_frame(&mut sock, &Frame::status(Status::Confirmed))
                .await
                .unwrap();
            let calls = vec![
                answer(&mut sock, true).await,
                answer(&mut sock, false).await,
                answer(&mut sock, true).await,
            ];
            let mut buf = [0u8; 1];
            let n = sock.read(&mut buf).await.unwrap_or(0);
            (calls, n)
        });

        let layer = layer();
        let err = layer
            .nat_waitforconn("srv-A", 80, handler(|_s| async {}), Some(addr))
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::Rejected { function: "REGISTER_PORT" }));
        assert!(!layer.nat_isalive().await);

        let (calls, n) = forwarder.await.unwrap();
        assert_eq!(
            calls,
            vec![
                RpcCall::RegisterServer("srv-A".into()),
                RpcCall::RegisterPort(PortParams {
                    server: "srv-A".into(),
                    port: 80,
                }),
                RpcCall::DeregisterServer("srv-A".into()),
            ]
        );
        assert_eq!(n, 0, "link left open after rollback");
        assert!(layer.discovery.lookup_server("srv-A").await.is_err());
        assert!(layer.state.lock().await.handles.is_empty());
    }
}
