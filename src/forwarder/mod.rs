//! Forwarder: admits NAT'ed servers and relays client streams to them.
//!
//! Every accepted TCP connection starts with one frame that decides its role:
//! 1. `INIT_SERVER` — the connection becomes a server link; all clients of
//!    that server are multiplexed over it by client id
//! 2. `INIT_CLIENT` — the connection is spliced onto a server link; after the
//!    status reply it carries raw application bytes
//! 3. `DATA_FORWARD` to a control address — a one-shot control request
//!    (`EXTERNAL_ADDR`, `CLIENT_INIT`) answered and closed
//!
//! Each admitted connection is served by one reader and one writer task.
//! Teardown goes through [`Forwarder::drop_client`] / [`Forwarder::drop_server`]
//! and is idempotent.

mod control;
mod session;
mod stats;
mod tasks;

pub use session::{ClientSession, ServerSession};
pub use stats::{ForwarderStats, StatsSnapshot};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ForwarderConfig;
use crate::frame::{self, ClientInit, Frame, Status};

/// Server sessions plus the identity index pointing into them.
#[derive(Default)]
pub struct ServerTable {
    /// Sessions keyed by primary id.
    pub sessions: HashMap<String, Arc<ServerSession>>,
    /// Registered identity -> primary id of the owning session.
    pub names: HashMap<String, String>,
}

impl ServerTable {
    /// Session currently answering for `identity`.
    pub fn resolve(&self, identity: &str) -> Option<&Arc<ServerSession>> {
        self.names
            .get(identity)
            .and_then(|primary| self.sessions.get(primary))
    }

    /// Identities registered by the session with this primary id.
    pub fn identities(&self, primary: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .names
            .iter()
            .filter(|(_, owner)| owner.as_str() == primary)
            .map(|(name, _)| name.clone())
            .collect();
        ids.sort();
        ids
    }

    fn is_current(&self, server: &Arc<ServerSession>) -> bool {
        self.sessions
            .get(&server.id)
            .is_some_and(|s| Arc::ptr_eq(s, server))
    }

    fn owns(&self, identity: &str, server: &Arc<ServerSession>) -> bool {
        self.is_current(server) && self.names.get(identity) == Some(&server.id)
    }
}

/// Outcome of claiming a primary id for a new server session.
enum Claim {
    Free,
    Stale(Arc<ServerSession>),
    Held,
}

/// Client sessions: client id -> owning server's primary id -> session.
pub type ClientTable = HashMap<String, HashMap<String, Arc<ClientSession>>>;

fn attached(clients: &ClientTable, server: &Arc<ServerSession>) -> Vec<Arc<ClientSession>> {
    clients
        .values()
        .filter_map(|per_server| per_server.get(&server.id))
        .filter(|cs| Arc::ptr_eq(&cs.server, server))
        .cloned()
        .collect()
}

/// State shared by the accept loop and every session task.
#[derive(Clone)]
pub struct Forwarder {
    pub servers: Arc<RwLock<ServerTable>>,
    pub clients: Arc<RwLock<ClientTable>>,
    pub stats: Arc<ForwarderStats>,
    config: Arc<ForwarderConfig>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            servers: Arc::new(RwLock::new(ServerTable::default())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(ForwarderStats::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    fn status_frame(&self, status: Status) -> Frame {
        Frame::status_from(self.config.identity.as_str(), status)
    }

    /// Ids peers may claim: valid and not the forwarder's own identity.
    fn is_admissible_id(&self, id: &str) -> bool {
        frame::is_valid_id(id) && id != self.config.identity
    }

    /// Accept connections until `shutdown` fires, then tear every session down.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            let fwd = self.clone();
            tokio::spawn(
                async move { fwd.newconn(stream, peer).await }
                    .instrument(info_span!("conn", %peer)),
            );
        }
        self.drain_all().await;
    }

    /// Read the first frame of a fresh connection and hand it to its role.
    pub async fn newconn(&self, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let first = match frame::read_frame(&mut reader, self.config.max_frame_size).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection closed before init: {e}");
                return;
            }
        };
        match first {
            Frame::InitServer { server, credit } => {
                self.admit_server(server, credit, peer, reader, writer)
                    .await;
            }
            Frame::InitClient { client, target } => {
                self.admit_client(client, target, reader, writer).await;
            }
            Frame::Data { address, payload } if frame::is_control_address(&address) => {
                self.serve_oneshot_control(address, payload, peer, writer)
                    .await;
            }
            other => {
                warn!(kind = other.kind(), "Unexpected first frame, closing");
            }
        }
    }

    async fn admit_server(
        &self,
        id: String,
        credit: u32,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) {
        if credit == 0 || !self.is_admissible_id(&id) {
            warn!(server = %id, credit, "Rejected server init");
            ForwarderStats::add(&self.stats.rejected, 1);
            let _ = frame::write_frame(&mut writer, &self.status_frame(Status::Failed)).await;
            return;
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let session = Arc::new(ServerSession::new(id.clone(), peer, credit, outbound_tx));

        // A reconnecting server replaces whatever still answers for its id.
        loop {
            let claim = {
                let mut servers = self.servers.write().await;
                match servers.resolve(&id).cloned() {
                    Some(old) => Claim::Stale(old),
                    None if servers.sessions.contains_key(&id) => Claim::Held,
                    None => {
                        servers.sessions.insert(id.clone(), Arc::clone(&session));
                        servers.names.insert(id.clone(), id.clone());
                        Claim::Free
                    }
                }
            };
            match claim {
                Claim::Free => break,
                Claim::Stale(old) => {
                    warn!(server = %id, old = %old.id, "Server re-registering while stale session exists, evicting old");
                    self.remove_server(&old).await;
                }
                Claim::Held => {
                    // The name was given up, but the session keyed by it still
                    // serves other identities.
                    warn!(server = %id, "Server id still keys a live session, rejecting");
                    ForwarderStats::add(&self.stats.rejected, 1);
                    let _ = frame::write_frame(&mut writer, &self.status_frame(Status::Failed)).await;
                    return;
                }
            }
        }

        if let Err(e) = frame::write_frame(&mut writer, &self.status_frame(Status::Confirmed)).await {
            warn!(server = %id, "Failed to confirm server: {e}");
            self.remove_server(&session).await;
            return;
        }
        ForwarderStats::add(&self.stats.servers_admitted, 1);
        info!(server = %id, credit, "Server registered");

        let span = info_span!("server", server = %id);
        tokio::spawn(
            self.clone()
                .write_to_server(Arc::clone(&session), writer, outbound_rx)
                .instrument(span.clone()),
        );
        tokio::spawn(
            self.clone()
                .read_from_server(session, reader)
                .instrument(span),
        );
    }

    /// Check `target` against the server table, ignoring who is asking.
    fn check_target(
        &self,
        servers: &ServerTable,
        clients: &ClientTable,
        target: &ClientInit,
    ) -> Result<Arc<ServerSession>, Status> {
        let server = servers.resolve(&target.server).ok_or(Status::NoServer)?;
        if !server.has_port(&target.server, target.port) {
            return Err(Status::Failed);
        }
        if attached(clients, server).len() >= self.config.max_clients_per_server {
            return Err(Status::BusyServer);
        }
        Ok(Arc::clone(server))
    }

    /// Status an `INIT_CLIENT` for `target` would get right now.
    pub async fn probe_target(&self, target: &ClientInit) -> Status {
        let servers = self.servers.read().await;
        let clients = self.clients.read().await;
        match self.check_target(&servers, &clients, target) {
            Ok(_) => Status::Confirmed,
            Err(status) => status,
        }
    }

    async fn admit_client(
        &self,
        client: String,
        target: ClientInit,
        reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) {
        let admitted = {
            let servers = self.servers.read().await;
            let mut clients = self.clients.write().await;
            let checked = if self.is_admissible_id(&client) {
                self.check_target(&servers, &clients, &target)
            } else {
                Err(Status::Failed)
            };
            checked.and_then(|server| {
                let duplicate = clients
                    .get(&client)
                    .is_some_and(|per_server| per_server.contains_key(&server.id));
                if duplicate {
                    return Err(Status::Failed);
                }
                let cs = Arc::new(ClientSession::new(
                    client.clone(),
                    target.server.clone(),
                    target.port,
                    server,
                ));
                clients
                    .entry(client.clone())
                    .or_default()
                    .insert(cs.server_id.clone(), Arc::clone(&cs));
                Ok(cs)
            })
        };

        let cs = match admitted {
            Ok(cs) => cs,
            Err(status) => {
                info!(client = %client, server = %target.server, port = target.port, status = status.as_str(), "Client rejected");
                ForwarderStats::add(&self.stats.rejected, 1);
                let _ = frame::write_frame(&mut writer, &self.status_frame(status)).await;
                return;
            }
        };

        if let Err(e) = frame::write_frame(&mut writer, &self.status_frame(Status::Confirmed)).await {
            debug!(client = %client, "Failed to confirm client: {e}");
            self.remove_client(&cs, false).await;
            return;
        }
        let init = Frame::InitClient {
            client: client.clone(),
            target,
        };
        if !cs.server.enqueue(init).await {
            self.remove_client(&cs, false).await;
            return;
        }
        ForwarderStats::add(&self.stats.clients_admitted, 1);
        info!(client = %client, server = %cs.server_id, port = cs.port, "Client connected");

        let span = info_span!("client", client = %client, server = %cs.server_id);
        tokio::spawn(
            self.clone()
                .write_to_client(Arc::clone(&cs), writer)
                .instrument(span.clone()),
        );
        tokio::spawn(self.clone().read_from_client(cs, reader).instrument(span));
    }

    async fn client_session(
        &self,
        client_id: &str,
        server: &Arc<ServerSession>,
    ) -> Option<Arc<ClientSession>> {
        let clients = self.clients.read().await;
        clients
            .get(client_id)
            .and_then(|per_server| per_server.get(&server.id))
            .filter(|cs| Arc::ptr_eq(&cs.server, server))
            .cloned()
    }

    /// Close the client `client_id` of server `server_id` and tell the server.
    /// Unknown pairs are a no-op.
    pub async fn drop_client(&self, client_id: &str, server_id: &str) {
        let cs = {
            let clients = self.clients.read().await;
            clients
                .get(client_id)
                .and_then(|per_server| per_server.get(server_id))
                .cloned()
        };
        if let Some(cs) = cs {
            self.remove_client(&cs, true).await;
        }
    }

    /// Close the server session with primary id `server_id` and every client
    /// attached to it. Unknown ids are a no-op.
    pub async fn drop_server(&self, server_id: &str) {
        let session = self.servers.read().await.sessions.get(server_id).cloned();
        if let Some(session) = session {
            self.remove_server(&session).await;
        }
    }

    /// Remove this exact client session (not a same-named successor) and
    /// close its socket. With `notify_server` the server gets a `CONN_TERM`.
    pub(crate) async fn remove_client(&self, cs: &Arc<ClientSession>, notify_server: bool) {
        let removed = self.unlink_client(cs).await;
        cs.close();
        if !removed {
            return;
        }
        info!(client = %cs.client_id, server = %cs.server_id, "Client disconnected");
        if notify_server && !cs.server.is_closed() {
            cs.server.enqueue(Frame::term(cs.client_id.clone())).await;
        }
    }

    /// The server closed `client_id`: unlink it now, deliver what is queued,
    /// then close the client socket.
    async fn finish_client(&self, client_id: &str, server: &Arc<ServerSession>) {
        let Some(cs) = self.client_session(client_id, server).await else {
            return;
        };
        if self.unlink_client(&cs).await {
            debug!(client = %client_id, "Server closed client connection");
        }
        cs.finish();
    }

    async fn unlink_client(&self, cs: &Arc<ClientSession>) -> bool {
        let mut clients = self.clients.write().await;
        let Some(per_server) = clients.get_mut(&cs.client_id) else {
            return false;
        };
        let current = per_server
            .get(&cs.server_id)
            .is_some_and(|c| Arc::ptr_eq(c, cs));
        if current {
            per_server.remove(&cs.server_id);
            if per_server.is_empty() {
                clients.remove(&cs.client_id);
            }
        }
        current
    }

    /// Remove this exact server session, its identities, and all its clients.
    pub(crate) async fn remove_server(&self, server: &Arc<ServerSession>) {
        server.close();
        let removed = {
            let mut servers = self.servers.write().await;
            if servers.is_current(server) {
                servers.sessions.remove(&server.id);
                servers.names.retain(|_, owner| owner != &server.id);
                true
            } else {
                false
            }
        };
        let clients = attached(&*self.clients.read().await, server);
        for cs in &clients {
            self.remove_client(cs, false).await;
        }
        if removed {
            info!(
                server = %server.id,
                clients = clients.len(),
                uptime_secs = server.connected_since.elapsed().as_secs(),
                "Server disconnected"
            );
        }
    }

    /// Drop every server session (and with them every client).
    pub async fn drain_all(&self) {
        let sessions: Vec<Arc<ServerSession>> =
            self.servers.read().await.sessions.values().cloned().collect();
        for server in &sessions {
            self.remove_server(server).await;
        }
        if !sessions.is_empty() {
            info!(servers = sessions.len(), "Drained all sessions");
        }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let servers = self.servers.read().await.sessions.len();
        let clients = self.clients.read().await.values().map(HashMap::len).sum();
        StatsSnapshot::capture(&self.stats, servers, clients)
    }

    /// Whether `identity` currently resolves to a live server session.
    pub async fn has_server(&self, identity: &str) -> bool {
        self.servers.read().await.resolve(identity).is_some()
    }

    /// Number of live client sessions for `client_id`.
    pub async fn client_sessions(&self, client_id: &str) -> usize {
        self.clients
            .read()
            .await
            .get(client_id)
            .map_or(0, HashMap::len)
    }
}

/// Close a half-open write side, ignoring errors from an already-reset peer.
async fn close_writer(writer: &mut OwnedWriteHalf) {
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn session(id: &str) -> Arc<ServerSession> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(ServerSession::new(
            id.into(),
            "127.0.0.1:1".parse().unwrap(),
            1024,
            tx,
        ))
    }

    #[test]
    fn test_resolve_through_names() {
        let mut table = ServerTable::default();
        let srv = session("srv-A");
        table.sessions.insert("srv-A".into(), Arc::clone(&srv));
        table.names.insert("srv-A".into(), "srv-A".into());
        table.names.insert("alias".into(), "srv-A".into());
        assert!(Arc::ptr_eq(table.resolve("alias").unwrap(), &srv));
        assert!(table.resolve("ghost").is_none());
        assert_eq!(table.identities("srv-A"), vec!["alias", "srv-A"]);
        assert!(table.owns("alias", &srv));
        assert!(!table.owns("alias", &session("srv-A")));
    }

    #[tokio::test]
    async fn test_check_target_order() {
        let fwd = Forwarder::new(ForwarderConfig {
            max_clients_per_server: 1,
            ..ForwarderConfig::default()
        });
        let srv = session("srv-A");
        {
            let mut servers = fwd.servers.write().await;
            servers.sessions.insert("srv-A".into(), Arc::clone(&srv));
            servers.names.insert("srv-A".into(), "srv-A".into());
        }
        let target = ClientInit {
            server: "srv-A".into(),
            port: 80,
        };
        let ghost = ClientInit {
            server: "ghost".into(),
            port: 80,
        };
        assert_eq!(fwd.probe_target(&ghost).await, Status::NoServer);
        assert_eq!(fwd.probe_target(&target).await, Status::Failed);

        srv.add_port("srv-A", 80);
        assert_eq!(fwd.probe_target(&target).await, Status::Confirmed);

        let cs = Arc::new(ClientSession::new("cli-1".into(), "srv-A".into(), 80, Arc::clone(&srv)));
        fwd.clients
            .write()
            .await
            .entry("cli-1".into())
            .or_default()
            .insert("srv-A".into(), cs);
        assert_eq!(fwd.probe_target(&target).await, Status::BusyServer);
    }

    #[tokio::test]
    async fn test_remove_server_cascades_and_is_idempotent() {
        let fwd = Forwarder::new(ForwarderConfig::default());
        let srv = session("srv-A");
        {
            let mut servers = fwd.servers.write().await;
            servers.sessions.insert("srv-A".into(), Arc::clone(&srv));
            servers.names.insert("srv-A".into(), "srv-A".into());
            servers.names.insert("alias".into(), "srv-A".into());
        }
        let mut sessions = Vec::new();
        for id in ["cli-1", "cli-2"] {
            let cs = Arc::new(ClientSession::new(id.into(), "srv-A".into(), 80, Arc::clone(&srv)));
            fwd.clients
                .write()
                .await
                .entry(id.into())
                .or_default()
                .insert("srv-A".into(), Arc::clone(&cs));
            sessions.push(cs);
        }

        fwd.drop_server("srv-A").await;
        assert!(srv.is_closed());
        assert!(sessions.iter().all(|cs| cs.is_closed()));
        assert_eq!(fwd.snapshot().await.servers, 0);
        assert_eq!(fwd.snapshot().await.clients, 0);
        assert!(fwd.servers.read().await.names.is_empty());

        fwd.drop_server("srv-A").await;
        fwd.drop_client("cli-1", "srv-A").await;
        assert_eq!(fwd.snapshot().await.clients, 0);
    }

    #[tokio::test]
    async fn test_stale_session_removal_spares_successor() {
        let fwd = Forwarder::new(ForwarderConfig::default());
        let old = session("srv-A");
        let new = session("srv-A");
        {
            let mut servers = fwd.servers.write().await;
            servers.sessions.insert("srv-A".into(), Arc::clone(&new));
            servers.names.insert("srv-A".into(), "srv-A".into());
        }
        fwd.remove_server(&old).await;
        assert!(fwd.has_server("srv-A").await);
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_drop_server_ends_draining_client_writer() {
        let fwd = Forwarder::new(ForwarderConfig::default());
        let srv = session("srv-A");
        {
            let mut servers = fwd.servers.write().await;
            servers.sessions.insert("srv-A".into(), Arc::clone(&srv));
            servers.names.insert("srv-A".into(), "srv-A".into());
        }
        let cs = Arc::new(ClientSession::new("cli-1".into(), "srv-A".into(), 80, Arc::clone(&srv)));
        fwd.clients
            .write()
            .await
            .entry("cli-1".into())
            .or_default()
            .insert("srv-A".into(), Arc::clone(&cs));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (sock, _) = listener.accept().await.unwrap();
        let (_rd, wr) = sock.into_split();

        // More than the socket buffers hold; the peer never reads.
        for _ in 0..64 {
            cs.push_to_client(Bytes::from(vec![0u8; 1024 * 1024]));
        }
        fwd.finish_client("cli-1", &srv).await;
        let writer = tokio::spawn(fwd.clone().write_to_client(Arc::clone(&cs), wr));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fwd.snapshot().await.clients, 0);
        assert!(!writer.is_finished());

        fwd.drop_server("srv-A").await;
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("client writer outlived its server")
            .unwrap();
        assert!(cs.is_closed());
        drop(peer);
    }
}
