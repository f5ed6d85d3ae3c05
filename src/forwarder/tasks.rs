//! The four per-connection loops. A server link runs `read_from_server` and
//! `write_to_server`; each admitted client runs `read_from_client` and
//! `write_to_client`. Every loop selects on its session's cancellation token
//! so teardown never waits on a socket.
//!
//! A client's EOF only ends the client->server direction: the server is sent
//! `CONN_TERM` and the session lives on until the server closes it too.

use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::session::Outbound;
use super::{close_writer, ClientSession, Forwarder, ForwarderStats, ServerSession};
use crate::error::FrameError;
use crate::frame::{self, Frame};

impl Forwarder {
    /// Client socket -> `DATA_FORWARD` frames on the server queue, never
    /// exceeding the credit the server granted this client.
    pub(super) async fn read_from_client(self, cs: Arc<ClientSession>, mut reader: OwnedReadHalf) {
        let token = cs.reader_token().clone();
        let mut buf = vec![0u8; self.config.read_chunk.max(1)];
        loop {
            let budget = tokio::select! {
                () = token.cancelled() => return,
                budget = cs.server_buff_size.available() => budget,
            };
            let want = budget.min(buf.len());
            let n = tokio::select! {
                () = token.cancelled() => return,
                read = reader.read(&mut buf[..want]) => match read {
                    Ok(0) => {
                        // Half-close: the server still gets to answer.
                        debug!("Client finished sending");
                        cs.server.enqueue(Frame::term(cs.client_id.clone())).await;
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Client read failed: {e}");
                        break;
                    }
                },
            };
            // Charge before queueing.
            cs.server_buff_size.consume(n);
            let data = Frame::data(cs.client_id.clone(), Bytes::copy_from_slice(&buf[..n]));
            if !cs.server.enqueue(data).await {
                break;
            }
            ForwarderStats::add(&self.stats.bytes_to_server, n);
        }
        self.remove_client(&cs, true).await;
    }

    /// Queued server payloads -> client socket, in arrival order.
    pub(super) async fn write_to_client(self, cs: Arc<ClientSession>, mut writer: OwnedWriteHalf) {
        let token = cs.shutdown_token().clone();
        loop {
            let payload = tokio::select! {
                () = token.cancelled() => return,
                next = cs.next_for_client() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let written = tokio::select! {
                () = token.cancelled() => return,
                written = writer.write_all(&payload) => written,
            };
            if let Err(e) = written {
                debug!("Client write failed: {e}");
                self.remove_client(&cs, true).await;
                return;
            }
            ForwarderStats::add(&self.stats.bytes_to_client, payload.len());
            if let Some(grant) = cs.delivered(payload.len()) {
                cs.server.enqueue(Frame::buf_size(cs.client_id.clone(), grant)).await;
            }
        }
        // Server closed this connection and its last bytes are written.
        close_writer(&mut writer).await;
        cs.close();
    }

    /// Server link -> per-client queues, credit updates and control requests.
    pub(super) async fn read_from_server(self, server: Arc<ServerSession>, mut reader: OwnedReadHalf) {
        let token = server.shutdown_token().clone();
        let max_frame_size = self.config.max_frame_size;
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => break,
                read = frame::read_frame(&mut reader, max_frame_size) => match read {
                    Ok(frame) => frame,
                    Err(FrameError::Connection(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                        info!("Server closed link");
                        break;
                    }
                    Err(e) => {
                        warn!("Server link failed: {e}");
                        break;
                    }
                },
            };
            self.route_from_server(&server, frame).await;
        }
        self.remove_server(&server).await;
    }

    async fn route_from_server(&self, server: &Arc<ServerSession>, frame: Frame) {
        match frame {
            Frame::Data { address, payload } if frame::is_control_address(&address) => {
                self.serve_control(server, address, payload).await;
            }
            Frame::Data { address, payload } => {
                if payload.is_empty() {
                    return;
                }
                let Some(cs) = self.client_session(&address, server).await else {
                    debug!(client = %address, "Dropping data for unknown client");
                    server.enqueue(Frame::term(address)).await;
                    return;
                };
                if let Some(grant) = cs.push_to_client(payload) {
                    server.enqueue(Frame::buf_size(address, grant)).await;
                }
            }
            Frame::ConnTerm { address } => self.finish_client(&address, server).await,
            Frame::BufSize { address, size } => {
                if let Some(cs) = self.client_session(&address, server).await {
                    cs.server_buff_size.set(size as usize);
                }
            }
            other => {
                warn!(kind = other.kind(), address = other.address(), "Ignoring unexpected frame from server");
            }
        }
    }

    /// Outbound queue -> server link. Exits on `Retire` after flushing.
    pub(super) async fn write_to_server(
        self,
        server: Arc<ServerSession>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        let token = server.shutdown_token().clone();
        loop {
            let item = tokio::select! {
                () = token.cancelled() => break,
                item = outbound.recv() => item,
            };
            let frame = match item {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Retire) => {
                    info!("Server deregistered its last identity");
                    close_writer(&mut writer).await;
                    break;
                }
                None => break,
            };
            let written = tokio::select! {
                () = token.cancelled() => break,
                written = frame::write_frame(&mut writer, &frame) => written,
            };
            if let Err(e) = written {
                warn!("Server write failed: {e}");
                break;
            }
        }
        self.remove_server(&server).await;
    }
}
