//! DAG traversal and step release.
//!
//! Walks the build graph, releasing steps as their dependencies
//! complete and feeding them to the [`StepExecutor`]. Missing source
//! inputs are a hard error at scheduling time (unlike ninja, which
//! ignores them). With `keep_going`, a failed step blocks only its
//! transitive dependents; everything else keeps building.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cmd::{StepResult, StepStatus};
use crate::graph::{BuildGraph, StepId};
use crate::{ExecError, StepExecutor};

/// Final state of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub id: String,
    pub rule: String,
    pub status: StepStatus,
    pub exit_code: i32,
    /// Stderr of the failing command, preserved verbatim.
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub error: Option<String>,
}

/// The whole build's result.
#[derive(Debug, Default)]
pub struct BuildResult {
    pub success: bool,
    pub outcomes: Vec<StepOutcome>,
    pub done: usize,
    pub cache_hits: usize,
    pub skipped: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Steps never attempted because a dependency failed.
    pub blocked: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Done,
    Failed,
    Blocked,
}

enum Message {
    Finished {
        id: StepId,
        result: Result<StepResult, ExecError>,
        duration: Duration,
    },
}

/// Walks the DAG and submits ready steps to the executor.
pub struct Scheduler {
    executor: Arc<StepExecutor>,
    graph: BuildGraph,
    keep_going: bool,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        executor: Arc<StepExecutor>,
        graph: BuildGraph,
        keep_going: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            graph,
            keep_going,
            cancel,
        }
    }

    /// Run the build to completion (or cancellation).
    pub async fn run(self) -> Result<BuildResult, ExecError> {
        let n = self.graph.len();
        info!(steps = n, "build starting");
        self.check_missing_inputs()?;

        let mut states = vec![State::Pending; n];
        let mut remaining: Vec<usize> = (0..n as StepId)
            .map(|i| self.graph.dependencies(i).len())
            .collect();
        let mut ready: VecDeque<StepId> = (0..n as StepId)
            .filter(|&i| remaining[i as usize] == 0)
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut result = BuildResult::default();
        let mut completed = 0usize;
        let mut in_flight = 0usize;

        while completed < n {
            // Release everything that is ready.
            while let Some(id) = ready.pop_front() {
                if states[id as usize] != State::Pending {
                    continue;
                }
                let def = self.graph.step(id);
                if def.phony {
                    // Phony edges propagate readiness only.
                    states[id as usize] = State::Done;
                    completed += 1;
                    result.skipped += 1;
                    result.outcomes.push(StepOutcome {
                        id: def.cmd.id.clone(),
                        rule: def.cmd.rule.clone(),
                        status: StepStatus::Skipped,
                        exit_code: 0,
                        stderr: Vec::new(),
                        duration: Duration::ZERO,
                        error: None,
                    });
                    Self::release_dependents(
                        &self.graph,
                        id,
                        &mut remaining,
                        &states,
                        &mut ready,
                    );
                    continue;
                }
                states[id as usize] = State::Running;
                in_flight += 1;
                let executor = self.executor.clone();
                let cmd = def.cmd.clone();
                let cancel = self.cancel.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = executor.run_step(&cmd, &cancel).await;
                    let _ = tx.send(Message::Finished {
                        id,
                        result,
                        duration: started.elapsed(),
                    });
                });
            }

            if completed >= n {
                break;
            }
            if in_flight == 0 {
                // Nothing running and nothing ready: the remainder is
                // blocked by failures.
                break;
            }

            let Some(Message::Finished {
                id,
                result: step_result,
                duration,
            }) = rx.recv().await
            else {
                break;
            };
            in_flight -= 1;
            completed += 1;
            let def = self.graph.step(id);

            let (state, outcome) = match step_result {
                Ok(res) => {
                    let state = if res.ok() { State::Done } else { State::Failed };
                    match res.status {
                        StepStatus::CacheHit => result.cache_hits += 1,
                        StepStatus::Skipped => result.skipped += 1,
                        StepStatus::Success => result.done += 1,
                        StepStatus::Canceled => result.canceled += 1,
                        _ => result.failed += 1,
                    }
                    (
                        state,
                        StepOutcome {
                            id: def.cmd.id.clone(),
                            rule: def.cmd.rule.clone(),
                            status: res.status,
                            exit_code: res.exit_code,
                            stderr: res.stderr,
                            duration,
                            error: None,
                        },
                    )
                }
                Err(ExecError::Canceled) => {
                    result.canceled += 1;
                    (
                        State::Failed,
                        StepOutcome {
                            id: def.cmd.id.clone(),
                            rule: def.cmd.rule.clone(),
                            status: StepStatus::Canceled,
                            exit_code: -1,
                            stderr: Vec::new(),
                            duration,
                            error: None,
                        },
                    )
                }
                Err(e) => {
                    result.failed += 1;
                    warn!(step = %def.cmd.id, err = %e, "step failed");
                    (
                        State::Failed,
                        StepOutcome {
                            id: def.cmd.id.clone(),
                            rule: def.cmd.rule.clone(),
                            status: StepStatus::NonZeroExit,
                            exit_code: -1,
                            stderr: Vec::new(),
                            duration,
                            error: Some(e.to_string()),
                        },
                    )
                }
            };
            states[id as usize] = state;
            result.outcomes.push(outcome);

            match state {
                State::Done => {
                    Self::release_dependents(
                        &self.graph,
                        id,
                        &mut remaining,
                        &states,
                        &mut ready,
                    );
                }
                State::Failed => {
                    let blocked =
                        Self::block_dependents(&self.graph, id, &mut states, &mut completed);
                    result.blocked += blocked;
                    if !self.keep_going {
                        debug!("failing fast; canceling remaining steps");
                        self.cancel.cancel();
                    }
                }
                _ => {}
            }
        }

        result.success = result.failed == 0 && result.canceled == 0;
        info!(
            done = result.done,
            cache_hits = result.cache_hits,
            skipped = result.skipped,
            failed = result.failed,
            blocked = result.blocked,
            success = result.success,
            "build finished"
        );
        Ok(result)
    }

    /// Every source input of every step must exist before the walk
    /// starts.
    fn check_missing_inputs(&self) -> Result<(), ExecError> {
        let root = self.executor.exec_root();
        for id in 0..self.graph.len() as StepId {
            let def = self.graph.step(id);
            if def.phony {
                continue;
            }
            for input in self.graph.source_inputs(id) {
                if self.executor.fs().stat(root, input).is_err() {
                    return Err(ExecError::MissingInput {
                        step: def.cmd.id.clone(),
                        input: input.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn release_dependents(
        graph: &BuildGraph,
        id: StepId,
        remaining: &mut [usize],
        states: &[State],
        ready: &mut VecDeque<StepId>,
    ) {
        for dep in graph.dependents(id) {
            let r = &mut remaining[dep as usize];
            *r -= 1;
            if *r == 0 && states[dep as usize] == State::Pending {
                ready.push_back(dep);
            }
        }
    }

    /// Mark every transitive dependent of a failed step blocked; they
    /// will never run.
    fn block_dependents(
        graph: &BuildGraph,
        id: StepId,
        states: &mut [State],
        completed: &mut usize,
    ) -> usize {
        let mut blocked = 0usize;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            for dep in graph.dependents(cur) {
                if states[dep as usize] == State::Pending {
                    states[dep as usize] = State::Blocked;
                    *completed += 1;
                    blocked += 1;
                    stack.push(dep);
                }
            }
        }
        blocked
    }
}
