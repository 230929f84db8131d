//! In-process remote backend for tests.
//!
//! Stores blobs and action results in memory and "executes" actions via
//! a registered handler. Supports fault injection: failing the first N
//! execute calls, and breaking the execute stream after the first
//! message so callers exercise the `wait_execution` reconnect path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;

use bx_digest::Digest;

use crate::backend::{ExecuteStream, Operation, RemoteBackend};
use crate::{
    encode, Action, ActionResult, Capabilities, Command, ExecuteRequest, ExecuteResponse,
    RpcCode, RpcError,
};

type ExecHandler =
    Box<dyn Fn(&Action, &Command) -> Result<ActionResult, RpcError> + Send + Sync>;

#[derive(Default)]
pub struct LoopbackBackend {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    action_results: Mutex<HashMap<Digest, ActionResult>>,
    operations: Mutex<HashMap<String, ExecuteResponse>>,
    handler: Mutex<Option<ExecHandler>>,
    next_op: AtomicU64,
    /// Fail the next N execute calls with `Unavailable`.
    fail_execute: AtomicU32,
    /// Break every execute stream after its first message.
    drop_stream_once: AtomicBool,
    /// Number of handler executions (not cache hits).
    pub exec_count: AtomicU32,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function that "executes" actions.
    pub fn set_handler(
        &self,
        handler: impl Fn(&Action, &Command) -> Result<ActionResult, RpcError> + Send + Sync + 'static,
    ) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Make the next `n` execute calls fail with `Unavailable`.
    pub fn fail_next_executes(&self, n: u32) {
        self.fail_execute.store(n, Ordering::SeqCst);
    }

    /// Break the next execute stream after its first message; the
    /// operation stays available through `wait_execution`.
    pub fn drop_next_stream(&self) {
        self.drop_stream_once.store(true, Ordering::SeqCst);
    }

    /// Insert a blob directly (test setup).
    pub fn put_blob(&self, data: Vec<u8>) -> Digest {
        let d = Digest::from_bytes(&data);
        self.blobs.lock().unwrap().insert(d, data);
        d
    }

    pub fn blob(&self, d: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(d).cloned()
    }

    pub fn has_blob(&self, d: &Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(d)
    }

    fn run_action(&self, req: &ExecuteRequest) -> Result<ExecuteResponse, RpcError> {
        if !req.skip_cache_lookup {
            if let Some(result) = self
                .action_results
                .lock()
                .unwrap()
                .get(&req.action_digest)
                .cloned()
            {
                return Ok(ExecuteResponse {
                    result,
                    status: None,
                    cached_result: true,
                });
            }
        }

        let action_blob = self
            .blob(&req.action_digest)
            .ok_or_else(|| RpcError::new(RpcCode::FailedPrecondition, "action blob missing"))?;
        let action = encode::decode_action(&action_blob)
            .ok_or_else(|| RpcError::new(RpcCode::InvalidArgument, "bad action encoding"))?;
        let command_blob = self
            .blob(&action.command_digest)
            .ok_or_else(|| RpcError::new(RpcCode::FailedPrecondition, "command blob missing"))?;
        let command = encode::decode_command(&command_blob)
            .ok_or_else(|| RpcError::new(RpcCode::InvalidArgument, "bad command encoding"))?;

        let handler = self.handler.lock().unwrap();
        let handler = handler
            .as_ref()
            .ok_or_else(|| RpcError::new(RpcCode::FailedPrecondition, "no exec handler"))?;
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        // Handler failures surface as the execution-level status, the
        // way a real backend reports them on the final operation.
        let result = match handler(&action, &command) {
            Ok(r) => r,
            Err(e) => {
                return Ok(ExecuteResponse {
                    result: ActionResult::default(),
                    status: Some(e),
                    cached_result: false,
                })
            }
        };

        if !action.do_not_cache && result.exit_code == 0 {
            self.action_results
                .lock()
                .unwrap()
                .insert(req.action_digest, result.clone());
        }
        Ok(ExecuteResponse {
            result,
            status: None,
            cached_result: false,
        })
    }
}

#[async_trait]
impl RemoteBackend for LoopbackBackend {
    async fn get_capabilities(&self) -> Result<Capabilities, RpcError> {
        Ok(Capabilities {
            max_batch_total_size_bytes: 4 * 1024 * 1024,
            exec_enabled: true,
        })
    }

    async fn get_action_result(&self, action_digest: Digest) -> Result<ActionResult, RpcError> {
        self.action_results
            .lock()
            .unwrap()
            .get(&action_digest)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("no action result {action_digest}")))
    }

    async fn update_action_result(
        &self,
        action_digest: Digest,
        result: ActionResult,
    ) -> Result<(), RpcError> {
        self.action_results
            .lock()
            .unwrap()
            .insert(action_digest, result);
        Ok(())
    }

    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, RpcError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .into_iter()
            .filter(|d| !d.is_zero() && !blobs.contains_key(d))
            .collect())
    }

    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Vec<u8>)>) -> Result<(), RpcError> {
        let mut store = self.blobs.lock().unwrap();
        for (d, data) in blobs {
            if Digest::from_bytes(&data) != d {
                return Err(RpcError::new(
                    RpcCode::InvalidArgument,
                    format!("digest mismatch for {d}"),
                ));
            }
            store.insert(d, data);
        }
        Ok(())
    }

    async fn batch_read_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<(Digest, Vec<u8>)>, RpcError> {
        let store = self.blobs.lock().unwrap();
        digests
            .into_iter()
            .map(|d| {
                store
                    .get(&d)
                    .cloned()
                    .map(|data| (d, data))
                    .ok_or_else(|| RpcError::not_found(format!("blob {d}")))
            })
            .collect()
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteStream, RpcError> {
        if self
            .fail_execute
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RpcError::unavailable("injected execute failure"));
        }

        let name = format!("operations/{}", self.next_op.fetch_add(1, Ordering::SeqCst));
        let response = self.run_action(&req)?;
        self.operations
            .lock()
            .unwrap()
            .insert(name.clone(), response.clone());

        if self.drop_stream_once.swap(false, Ordering::SeqCst) {
            let ops = vec![
                Ok(Operation {
                    name: name.clone(),
                    done: false,
                    response: None,
                }),
                Err(RpcError::unavailable("injected stream break")),
            ];
            return Ok(futures_util::stream::iter(ops).boxed());
        }

        let ops = vec![
            Ok(Operation {
                name: name.clone(),
                done: false,
                response: None,
            }),
            Ok(Operation {
                name,
                done: true,
                response: Some(response),
            }),
        ];
        Ok(futures_util::stream::iter(ops).boxed())
    }

    async fn wait_execution(&self, operation_name: String) -> Result<ExecuteStream, RpcError> {
        let response = self
            .operations
            .lock()
            .unwrap()
            .get(&operation_name)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("operation {operation_name}")))?;
        let ops = vec![Ok(Operation {
            name: operation_name,
            done: true,
            response: Some(response),
        })];
        Ok(futures_util::stream::iter(ops).boxed())
    }

    async fn read_blob(&self, digest: Digest) -> Result<Vec<u8>, RpcError> {
        self.blob(&digest)
            .ok_or_else(|| RpcError::not_found(format!("blob {digest}")))
    }

    async fn write_blob(&self, digest: Digest, data: Vec<u8>) -> Result<(), RpcError> {
        if Digest::from_bytes(&data) != digest {
            return Err(RpcError::new(
                RpcCode::InvalidArgument,
                format!("digest mismatch for {digest}"),
            ));
        }
        self.blobs.lock().unwrap().insert(digest, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn upload_action(backend: &LoopbackBackend, cmd: &Command) -> Digest {
        let cmd_blob = encode::command(cmd);
        let cmd_digest = backend.put_blob(cmd_blob);
        let action = Action {
            command_digest: cmd_digest,
            input_root_digest: Digest::from_bytes(b"inputs"),
            timeout_secs: 0,
            do_not_cache: false,
        };
        backend.put_blob(encode::action(&action))
    }

    async fn final_response(mut stream: ExecuteStream) -> ExecuteResponse {
        while let Some(op) = stream.next().await {
            let op = op.unwrap();
            if op.done {
                return op.response.unwrap();
            }
        }
        panic!("stream ended without a done operation");
    }

    #[tokio::test]
    async fn execute_runs_handler_and_caches() {
        let backend = LoopbackBackend::new();
        backend.set_handler(|_, cmd| {
            assert_eq!(cmd.arguments[0], "clang++");
            Ok(ActionResult {
                exit_code: 0,
                stdout_raw: b"ok".to_vec(),
                ..Default::default()
            })
        });
        let cmd = Command {
            arguments: vec!["clang++".into()],
            ..Default::default()
        };
        let action_digest = upload_action(&backend, &cmd);

        let req = ExecuteRequest {
            action_digest,
            skip_cache_lookup: false,
            execution_priority: 0,
        };
        let resp = final_response(backend.execute(req.clone()).await.unwrap()).await;
        assert!(!resp.cached_result);
        assert_eq!(resp.result.stdout_raw, b"ok");

        // Second execute is an action-cache hit.
        let resp = final_response(backend.execute(req).await.unwrap()).await;
        assert!(resp.cached_result);
        assert_eq!(backend.exec_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn injected_failures_then_success() {
        let backend = LoopbackBackend::new();
        backend.set_handler(|_, _| Ok(ActionResult::default()));
        let cmd = Command::default();
        let action_digest = upload_action(&backend, &cmd);
        backend.fail_next_executes(2);

        let req = ExecuteRequest {
            action_digest,
            skip_cache_lookup: false,
            execution_priority: 0,
        };
        assert_eq!(
            match backend.execute(req.clone()).await {
                Err(e) => e.code,
                Ok(_) => panic!("expected error"),
            },
            RpcCode::Unavailable
        );
        assert_eq!(
            match backend.execute(req.clone()).await {
                Err(e) => e.code,
                Ok(_) => panic!("expected error"),
            },
            RpcCode::Unavailable
        );
        backend.execute(req).await.unwrap();
    }

    #[tokio::test]
    async fn broken_stream_resumes_via_wait_execution() {
        let backend = LoopbackBackend::new();
        backend.set_handler(|_, _| {
            Ok(ActionResult {
                exit_code: 0,
                ..Default::default()
            })
        });
        let cmd = Command::default();
        let action_digest = upload_action(&backend, &cmd);
        backend.drop_next_stream();

        let req = ExecuteRequest {
            action_digest,
            skip_cache_lookup: false,
            execution_priority: 0,
        };
        let mut stream = backend.execute(req).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.done);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcCode::Unavailable);

        let resp = final_response(backend.wait_execution(first.name).await.unwrap()).await;
        assert_eq!(resp.result.exit_code, 0);
    }

    #[tokio::test]
    async fn find_missing_blobs_filters_present() {
        let backend = LoopbackBackend::new();
        let present = backend.put_blob(b"here".to_vec());
        let absent = Digest::from_bytes(b"absent");
        let missing = backend
            .find_missing_blobs(vec![present, absent, Digest::empty()])
            .await
            .unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[tokio::test]
    async fn batch_update_validates_digests() {
        let backend = LoopbackBackend::new();
        let d = Digest::from_bytes(b"data");
        backend
            .batch_update_blobs(vec![(d, b"data".to_vec())])
            .await
            .unwrap();
        let err = backend
            .batch_update_blobs(vec![(d, b"other".to_vec())])
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcCode::InvalidArgument);
    }
}
