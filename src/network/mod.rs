//! Message envelopes and the transports that carry them.
//!
//! Every transport moves a `Request` to a peer's `InboundHandler` and brings
//! back its `Response`. Implementing `Transport` is enough to get an
//! `RpcChannel`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, HeartbeatRequest, PreVoteRequest, PreVoteResponse,
    PullEntryRequest, PullEntryResponse, PushEntryRequest, PushEntryResponse, VoteRequest,
    VoteResponse,
};
use crate::traits::{RpcChannel, RpcResult};
use crate::types::NodeId;

pub mod mock;
pub mod tcp;

pub use mock::{MockNetworkConfig, MockNetworkHub};
pub use tcp::{RpcServer, TcpChannel};

/// Largest frame either side accepts.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Append(AppendEntryRequest),
    Push(PushEntryRequest),
    Pull(PullEntryRequest),
    Heartbeat(HeartbeatRequest),
    PreVote(PreVoteRequest),
    Vote(VoteRequest),
}

impl Request {
    /// Routing name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Append(_) => "AppendEntry",
            Request::Push(_) => "PushEntry",
            Request::Pull(_) => "PullEntry",
            Request::Heartbeat(_) => "HeartBeat",
            Request::PreVote(_) => "PreVote",
            Request::Vote(_) => "Vote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Append(AppendEntryResponse),
    Push(PushEntryResponse),
    Pull(PullEntryResponse),
    /// Heartbeats carry no reply.
    Ack,
    PreVote(PreVoteResponse),
    Vote(VoteResponse),
    Error(String),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Append(_) => "AppendEntry",
            Response::Push(_) => "PushEntry",
            Response::Pull(_) => "PullEntry",
            Response::Ack => "Ack",
            Response::PreVote(_) => "PreVote",
            Response::Vote(_) => "Vote",
            Response::Error(_) => "Error",
        }
    }
}

/// One request/response exchange with a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, from: &NodeId, target: &NodeId, request: Request) -> RpcResult<Response>;
}

macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            Response::$variant(inner) => Ok(inner),
            Response::Error(reason) => Err(RpcError::Protocol(reason)),
            other => Err(RpcError::Protocol(format!(
                "expected {} response, got {}",
                stringify!($variant),
                other.kind()
            ))),
        }
    };
}

#[async_trait]
impl<T: Transport> RpcChannel for T {
    async fn push_entries(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PushEntryRequest,
    ) -> RpcResult<PushEntryResponse> {
        let response = self.call(from, target, Request::Push(req)).await?;
        expect_response!(response, Push)
    }

    async fn pull_entries(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PullEntryRequest,
    ) -> RpcResult<PullEntryResponse> {
        let response = self.call(from, target, Request::Pull(req)).await?;
        expect_response!(response, Pull)
    }

    async fn send_heartbeat(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: HeartbeatRequest,
    ) -> RpcResult<()> {
        match self.call(from, target, Request::Heartbeat(req)).await? {
            Response::Ack => Ok(()),
            Response::Error(reason) => Err(RpcError::Protocol(reason)),
            other => Err(RpcError::Protocol(format!(
                "expected Ack response, got {}",
                other.kind()
            ))),
        }
    }

    async fn request_pre_vote(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PreVoteRequest,
    ) -> RpcResult<PreVoteResponse> {
        let response = self.call(from, target, Request::PreVote(req)).await?;
        expect_response!(response, PreVote)
    }

    async fn request_vote(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: VoteRequest,
    ) -> RpcResult<VoteResponse> {
        let response = self.call(from, target, Request::Vote(req)).await?;
        expect_response!(response, Vote)
    }
}

// 帧格式: | len u32 (big-endian) | bincode body |

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> RpcResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}
