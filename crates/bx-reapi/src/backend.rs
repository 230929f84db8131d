//! The remote execution backend trait.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use bx_digest::Digest;

use crate::{ActionResult, Capabilities, ExecuteRequest, ExecuteResponse, RpcError};

/// One message on an execute stream.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Server-assigned operation name, used for `wait_execution`
    /// reconnects.
    pub name: String,
    pub done: bool,
    /// Present on the final message.
    pub response: Option<ExecuteResponse>,
}

/// The watch stream returned by `execute` / `wait_execution`.
pub type ExecuteStream = BoxStream<'static, Result<Operation, RpcError>>;

/// The REAPI surface the executor consumes (v2.0–v2.2).
///
/// The production implementation wraps gRPC; tests use
/// [`loopback::LoopbackBackend`](crate::loopback::LoopbackBackend).
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn get_capabilities(&self) -> Result<Capabilities, RpcError>;

    /// ActionCache.GetActionResult.
    async fn get_action_result(&self, action_digest: Digest)
        -> Result<ActionResult, RpcError>;

    /// ActionCache.UpdateActionResult. Best-effort on the caller side.
    async fn update_action_result(
        &self,
        action_digest: Digest,
        result: ActionResult,
    ) -> Result<(), RpcError>;

    /// CAS.FindMissingBlobs: the subset of `digests` the server lacks.
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, RpcError>;

    /// CAS.BatchUpdateBlobs.
    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<(), RpcError>;

    /// CAS.BatchReadBlobs.
    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<(Digest, Vec<u8>)>, RpcError>;

    /// Execution.Execute: starts the action and watches it.
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteStream, RpcError>;

    /// Execution.WaitExecution: re-attach to a running operation after a
    /// stream breaks.
    async fn wait_execution(&self, operation_name: String) -> Result<ExecuteStream, RpcError>;

    /// ByteStream.Read for blobs too large to batch.
    async fn read_blob(&self, digest: Digest) -> Result<Vec<u8>, RpcError>;

    /// ByteStream.Write.
    async fn write_blob(&self, digest: Digest, data: Vec<u8>) -> Result<(), RpcError>;
}
