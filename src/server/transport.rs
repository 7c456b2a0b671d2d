//! Node-to-node RPC transport: a trait seam plus a TCP implementation and an
//! in-process hub used by tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::paxos::{RpcReply, RpcRequest};
use crate::utils::{Address, PaxosError};

use async_trait::async_trait;

use bytes::{Bytes, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{self, Duration};

/// Largest frame body accepted from a peer, in bytes.
pub(crate) const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Pause before accepting again after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outbound side of node-to-node calls. The method name is the request
/// variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `req` to the member at `addr` and waits for its reply. Fails
    /// with a transport error if the member cannot be reached.
    async fn invoke(
        &self,
        addr: &Address,
        req: RpcRequest,
    ) -> Result<RpcReply, PaxosError>;
}

/// Inbound side of node-to-node calls.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle_rpc(&self, req: RpcRequest) -> RpcReply;
}

/// Receives one length-prefixed MessagePack frame from `conn`, using
/// `read_buf` as storage for partial reads. Returns `Ok(None)` on a clean
/// EOF at a frame boundary.
pub(crate) async fn read_msg<T, Conn>(
    read_buf: &mut BytesMut,
    conn: &mut Conn,
) -> Result<Option<T>, PaxosError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // length of obj first
    while read_buf.len() < 8 {
        if conn.read_buf(read_buf).await? == 0 {
            if read_buf.is_empty() {
                return Ok(None);
            }
            return Err(PaxosError::msg("connection closed mid-frame"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes);
    if obj_len > MAX_FRAME_LEN as u64 {
        return Err(PaxosError::msg(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let obj_len = obj_len as usize;

    // then the obj itself
    let obj_end = 8 + obj_len;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn.read_buf(read_buf).await? == 0 {
            return Err(PaxosError::msg("connection closed mid-frame"));
        }
    }
    let obj = rmp_serde::from_slice(&read_buf[8..obj_end])?;

    // keep any bytes of the next frame
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }
    Ok(Some(obj))
}

/// Sends one length-prefixed MessagePack frame of `obj` to `conn`.
pub(crate) async fn write_msg<T, Conn>(
    conn: &mut Conn,
    obj: &T,
) -> Result<(), PaxosError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let bytes = rmp_serde::to_vec(obj)?;
    let mut frame = BytesMut::with_capacity(8 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    frame.extend_from_slice(&bytes);
    conn.write_all(&frame).await?;
    conn.flush().await?;
    Ok(())
}

/// TCP transport that dials the target afresh for every call.
#[derive(Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn invoke(
        &self,
        addr: &Address,
        req: RpcRequest,
    ) -> Result<RpcReply, PaxosError> {
        let mut stream = TcpStream::connect(addr.to_socket_addr()?).await?;
        stream.set_nodelay(true)?;
        write_msg(&mut stream, &req).await?;

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        match read_msg(&mut read_buf, &mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(PaxosError::msg(format!(
                "connection to {} closed before reply",
                addr
            ))),
        }
    }
}

/// TCP listener serving node-to-node calls.
pub struct RpcServer {
    listener: TcpListener,

    /// Bound address, used as log prefix.
    addr: SocketAddr,
}

impl RpcServer {
    /// Binds the listening socket.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, PaxosError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        Ok(RpcServer { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts connections forever, serving each on its own task until the
    /// peer hangs up. Requests on one connection are handled in order. A
    /// failed accept (e.g. out of file descriptors) is logged and retried
    /// after a short pause.
    pub async fn serve(self, service: Arc<dyn RpcService>) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(self.addr; "accept failed: {}", e);
                    time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::serve_conn(stream, service).await {
                    pf_debug!(peer; "connection error: {}", e);
                }
            });
        }
    }

    async fn serve_conn(
        mut stream: TcpStream,
        service: Arc<dyn RpcService>,
    ) -> Result<(), PaxosError> {
        stream.set_nodelay(true)?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        while let Some(req) =
            read_msg::<RpcRequest, _>(&mut read_buf, &mut stream).await?
        {
            let reply = service.handle_rpc(req).await;
            write_msg(&mut stream, &reply).await?;
        }
        Ok(())
    }
}

/// In-process transport connecting replicas of one process by address.
/// Members can be marked unreachable to simulate network failures.
#[derive(Default)]
pub struct LocalHub {
    services: RwLock<HashMap<Address, Weak<dyn RpcService>>>,
    unreachable: RwLock<HashSet<Address>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalHub::default())
    }

    /// Makes `service` callable at `addr`. The hub holds no strong
    /// reference to it.
    pub async fn register(&self, addr: Address, service: Arc<dyn RpcService>) {
        self.services
            .write()
            .await
            .insert(addr, Arc::downgrade(&service));
    }

    /// Marks `addr` as reachable or not; calls to an unreachable member fail.
    pub async fn set_reachable(&self, addr: &Address, reachable: bool) {
        let mut unreachable = self.unreachable.write().await;
        if reachable {
            unreachable.remove(addr);
        } else {
            unreachable.insert(addr.clone());
        }
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn invoke(
        &self,
        addr: &Address,
        req: RpcRequest,
    ) -> Result<RpcReply, PaxosError> {
        if self.unreachable.read().await.contains(addr) {
            return Err(PaxosError::msg(format!("{} unreachable", addr)));
        }
        let service = self.services.read().await.get(addr).cloned();
        match service.and_then(|s| s.upgrade()) {
            Some(service) => Ok(service.handle_rpc(req).await),
            None => Err(PaxosError::msg(format!("no service at {}", addr))),
        }
    }
}
