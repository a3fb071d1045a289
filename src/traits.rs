use async_trait::async_trait;

use crate::error::{ApplyError, NodeError, RpcError, StorageError};
use crate::message::{
    Entry, HeartbeatRequest, PreVoteRequest, PreVoteResponse, PullEntryRequest, PullEntryResponse,
    PushEntryRequest, PushEntryResponse, VoteRequest, VoteResponse,
};
use crate::network::{Request, Response};
use crate::types::NodeId;

// 结果类型别名
pub type NodeResult<T> = Result<T, NodeError>;
pub type RpcResult<T> = Result<T, RpcError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Request/response delivery between members of one log group.
///
/// Calls are addressed by node id; the channel owns the mapping to addresses.
/// A call that fails or times out is an implicit REJECT for the caller.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn push_entries(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PushEntryRequest,
    ) -> RpcResult<PushEntryResponse>;

    async fn pull_entries(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PullEntryRequest,
    ) -> RpcResult<PullEntryResponse>;

    // 心跳不需要响应内容
    async fn send_heartbeat(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: HeartbeatRequest,
    ) -> RpcResult<()>;

    async fn request_pre_vote(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: PreVoteRequest,
    ) -> RpcResult<PreVoteResponse>;

    async fn request_vote(
        &self,
        from: &NodeId,
        target: &NodeId,
        req: VoteRequest,
    ) -> RpcResult<VoteResponse>;
}

/// Receives committed entries in index order.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, entry: &Entry) -> ApplyResult<()>;
}

/// Discards everything it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStateMachine;

#[async_trait]
impl StateMachine for NoopStateMachine {
    async fn apply(&self, _entry: &Entry) -> ApplyResult<()> {
        Ok(())
    }
}

/// Server side of the transport: one call per inbound request.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}
