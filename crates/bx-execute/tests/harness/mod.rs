//! Test harness for executor integration tests.
//!
//! Builds an isolated environment: a temp exec root, content store,
//! overlay fs, admission pools, logs, and a loopback remote backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use bx_digest::ContentStore;
use bx_execute::{ActionCache, Cmd, ExecConfig, StepDef, StepExecutor};
use bx_hashfs::{HashFS, Options};
use bx_ninja::{DepsLog, NinjaLog};
use bx_reapi::loopback::LoopbackBackend;
use bx_reapi::RemoteBackend;
use bx_scandeps::Scandeps;
use bx_sema::{Limits, LimitsConfig};

pub struct Harness {
    _dir: tempfile::TempDir,
    pub root: String,
    pub fs: Arc<HashFS>,
    pub backend: Arc<LoopbackBackend>,
    pub limits: Arc<Limits>,
    pub deps_log: Arc<Mutex<DepsLog>>,
    pub ninja_log: Arc<Mutex<NinjaLog>>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let root = root.to_str().unwrap().to_string();
        let store = Arc::new(
            ContentStore::new(Utf8PathBuf::from(format!("{}/.bx-store", root))).unwrap(),
        );
        let fs = Arc::new(HashFS::new(Options { store }));
        let limits = Arc::new(Limits::new(&LimitsConfig::default_for(4, 16)));
        let deps_log = Arc::new(Mutex::new(
            DepsLog::open(&Utf8PathBuf::from(format!("{}/.bx_deps", root))).unwrap(),
        ));
        let ninja_log = Arc::new(Mutex::new(
            NinjaLog::open(&Utf8PathBuf::from(format!("{}/.ninja_log", root))).unwrap(),
        ));
        Self {
            _dir: dir,
            root,
            fs,
            backend: Arc::new(LoopbackBackend::new()),
            limits,
            deps_log,
            ninja_log,
        }
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = format!("{}/{}", self.root, rel);
        let parent = std::path::Path::new(&path).parent().unwrap();
        std::fs::create_dir_all(parent).unwrap();
        std::fs::write(&path, contents).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(format!("{}/{}", self.root, rel)).unwrap()
    }

    pub fn exists(&self, rel: &str) -> bool {
        std::path::Path::new(&format!("{}/{}", self.root, rel)).exists()
    }

    /// Executor wired for local-only execution.
    pub fn local_executor(&self, ignore_missing_outputs: bool) -> Arc<StepExecutor> {
        Arc::new(StepExecutor::new(
            self.fs.clone(),
            Some(Arc::new(Scandeps::new(self.fs.clone(), HashMap::new()))),
            None,
            None,
            self.limits.clone(),
            self.deps_log.clone(),
            self.ninja_log.clone(),
            ExecConfig {
                exec_root: self.root.clone(),
                ignore_missing_outputs,
                execution_priority: 0,
            },
        ))
    }

    /// Executor wired to the loopback backend with cache reads on.
    pub fn remote_executor(&self) -> Arc<StepExecutor> {
        let backend: Arc<dyn RemoteBackend> = self.backend.clone();
        let cache = Arc::new(ActionCache::new(
            backend.clone(),
            true,
            self.limits.cache.clone(),
        ));
        Arc::new(StepExecutor::new(
            self.fs.clone(),
            Some(Arc::new(Scandeps::new(self.fs.clone(), HashMap::new()))),
            Some(backend),
            Some(cache),
            self.limits.clone(),
            self.deps_log.clone(),
            self.ninja_log.clone(),
            ExecConfig {
                exec_root: self.root.clone(),
                ignore_missing_outputs: false,
                execution_priority: 0,
            },
        ))
    }
}

/// A local shell step.
pub fn shell_step(id: &str, script: &str, inputs: &[&str], outputs: &[&str]) -> StepDef {
    StepDef {
        cmd: Cmd {
            id: id.to_string(),
            rule: "sh".to_string(),
            args: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A pure step with platform properties, eligible for remote dispatch.
pub fn remote_step(id: &str, inputs: &[&str], outputs: &[&str]) -> StepDef {
    StepDef {
        cmd: Cmd {
            id: id.to_string(),
            rule: "cxx".to_string(),
            args: vec!["clang++".to_string(), "-c".to_string(), id.to_string()],
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            platform: vec![(
                "container-image".to_string(),
                "docker://sha256:bx".to_string(),
            )],
            pure: true,
            ..Default::default()
        },
        ..Default::default()
    }
}
