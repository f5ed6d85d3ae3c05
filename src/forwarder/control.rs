//! Control-plane requests addressed to the forwarder itself.
//!
//! Servers send them on control streams over their link; identity and port
//! registration is only honored there. A fresh connection may also open with
//! a single control request (the one-shot form), which can only ask
//! `EXTERNAL_ADDR` or `CLIENT_INIT`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};

use super::{close_writer, Forwarder, ServerSession};
use crate::frame::{self, Frame};
use crate::rpc::{self, ExternalAddr, RpcCall, RpcRequest, RpcResponse};

/// What a dispatched request produced.
struct Outcome {
    response: RpcResponse,
    /// The caller just gave up its last identity; close its link after replying.
    retire: bool,
}

impl Outcome {
    fn ok(id: u64, result: Value) -> Self {
        Self {
            response: RpcResponse::ok(id, result),
            retire: false,
        }
    }

    fn failed(id: u64) -> Self {
        Self {
            response: RpcResponse::failed(id),
            retire: false,
        }
    }
}

impl Forwarder {
    /// Answer one request that arrived on `server`'s link. The reply and the
    /// stream's `CONN_TERM` go out through the server's queue.
    pub(super) async fn serve_control(
        &self,
        server: &Arc<ServerSession>,
        address: String,
        payload: Bytes,
    ) {
        let outcome = match rpc::decode::<RpcRequest>(&payload) {
            Ok(request) => self.dispatch(Some(server), server.peer, request).await,
            Err(e) => {
                warn!(stream = %address, "Malformed control request: {e}");
                Outcome::failed(0)
            }
        };
        match rpc::encode(&outcome.response) {
            Ok(body) => {
                server.enqueue(Frame::data(address.clone(), body)).await;
            }
            Err(e) => warn!(stream = %address, "Failed to encode control reply: {e}"),
        }
        server.enqueue(Frame::term(address)).await;
        if outcome.retire {
            server.retire().await;
        }
    }

    /// Answer a control request that opened a connection, then close it.
    pub(super) async fn serve_oneshot_control(
        &self,
        address: String,
        payload: Bytes,
        peer: SocketAddr,
        mut writer: OwnedWriteHalf,
    ) {
        let outcome = match rpc::decode::<RpcRequest>(&payload) {
            Ok(request) => self.dispatch(None, peer, request).await,
            Err(e) => {
                warn!("Malformed one-shot control request: {e}");
                Outcome::failed(0)
            }
        };
        let body = match rpc::encode(&outcome.response) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode control reply: {e}");
                return;
            }
        };
        for reply in [Frame::data(address.clone(), body), Frame::term(address)] {
            if let Err(e) = frame::write_frame(&mut writer, &reply).await {
                debug!("One-shot control reply failed: {e}");
                return;
            }
        }
        close_writer(&mut writer).await;
    }

    async fn dispatch(
        &self,
        caller: Option<&Arc<ServerSession>>,
        peer: SocketAddr,
        request: RpcRequest,
    ) -> Outcome {
        let id = request.id;
        let function = request.call.name();
        let outcome = match (request.call, caller) {
            (RpcCall::ExternalAddr, _) => match serde_json::to_value(ExternalAddr::from(peer)) {
                Ok(addr) => Outcome::ok(id, addr),
                Err(_) => Outcome::failed(id),
            },
            (RpcCall::ClientInit(target), _) => {
                let status = self.probe_target(&target).await;
                Outcome::ok(id, Value::from(status.as_str()))
            }
            (call, Some(server)) => self.register(id, server, call).await,
            (_, None) => Outcome::failed(id),
        };
        debug!(function, ok = outcome.response.status, "Control request");
        outcome
    }

    /// Identity and port (de)registration for the calling server.
    async fn register(&self, id: u64, server: &Arc<ServerSession>, call: RpcCall) -> Outcome {
        let mut servers = self.servers.write().await;
        if !servers.is_current(server) {
            return Outcome::failed(id);
        }
        match call {
            RpcCall::RegisterServer(identity) => {
                if !self.is_admissible_id(&identity) {
                    return Outcome::failed(id);
                }
                match servers.names.get(&identity) {
                    Some(owner) if owner != &server.id => Outcome::failed(id),
                    Some(_) => Outcome::ok(id, Value::Bool(true)),
                    None => {
                        servers.names.insert(identity.clone(), server.id.clone());
                        info!(server = %server.id, identity = %identity, "Identity registered");
                        Outcome::ok(id, Value::Bool(true))
                    }
                }
            }
            RpcCall::DeregisterServer(identity) => {
                if !servers.owns(&identity, server) {
                    return Outcome::failed(id);
                }
                servers.names.remove(&identity);
                server.remove_identity_ports(&identity);
                info!(server = %server.id, identity = %identity, "Identity deregistered");
                Outcome {
                    response: RpcResponse::ok(id, Value::Bool(true)),
                    retire: !servers.names.values().any(|owner| owner == &server.id),
                }
            }
            RpcCall::RegisterPort(params) => {
                if !servers.owns(&params.server, server) {
                    return Outcome::failed(id);
                }
                server.add_port(&params.server, params.port);
                debug!(identity = %params.server, port = params.port, "Port registered");
                Outcome::ok(id, Value::Bool(true))
            }
            RpcCall::DeregisterPort(params) => {
                if !servers.owns(&params.server, server) {
                    return Outcome::failed(id);
                }
                server.remove_port(&params.server, params.port);
                debug!(identity = %params.server, port = params.port, "Port deregistered");
                Outcome::ok(id, Value::Bool(true))
            }
            RpcCall::ClientInit(_) | RpcCall::ExternalAddr => Outcome::failed(id),
        }
    }
}
