//! Pre-digested step manifest loading.
//!
//! Ninja manifest parsing lives outside this binary; what it consumes
//! is a JSON list of steps that a frontend already resolved (rules
//! expanded, paths made exec-root relative).

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8Path;
use eyre::{Context, Result};
use facet::Facet;

use bx_execute::{Cmd, DepsMode, StepDef};

#[derive(Debug, Facet)]
struct StepSpec {
    id: String,
    rule: Option<String>,
    args: Option<Vec<String>>,
    env: Option<Vec<Vec<String>>>,
    inputs: Option<Vec<String>>,
    outputs: Option<Vec<String>>,
    order_only: Option<Vec<String>>,
    depfile: Option<String>,
    /// "gcc" | "msvc"
    deps: Option<String>,
    rspfile: Option<String>,
    rspfile_content: Option<String>,
    restat: Option<bool>,
    phony: Option<bool>,
    pure_cmd: Option<bool>,
    pool: Option<String>,
    platform: Option<Vec<Vec<String>>>,
    timeout_secs: Option<u64>,
}

/// Load the step manifest at `path`.
pub fn load(path: &Utf8Path, _exec_root: &Utf8Path) -> Result<Vec<StepDef>> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let specs: Vec<StepSpec> =
        facet_json::from_str(&json).map_err(|e| eyre::eyre!("{path}: {e}"))?;

    let mut steps = Vec::with_capacity(specs.len());
    for spec in specs {
        let deps = match spec.deps.as_deref() {
            None | Some("") | Some("none") => DepsMode::None,
            Some("gcc") => DepsMode::Gcc,
            Some("msvc") => DepsMode::Msvc,
            Some(other) => eyre::bail!("{path}: step {}: unknown deps mode {other}", spec.id),
        };
        let rspfile = match (spec.rspfile, spec.rspfile_content) {
            (Some(name), content) => Some((name, content.unwrap_or_default())),
            (None, _) => None,
        };
        steps.push(StepDef {
            cmd: Cmd {
                id: spec.id,
                rule: spec.rule.unwrap_or_default(),
                args: spec.args.unwrap_or_default(),
                env: pairs(spec.env),
                dir: String::new(),
                rspfile,
                inputs: spec.inputs.unwrap_or_default(),
                outputs: spec.outputs.unwrap_or_default(),
                depfile: spec.depfile,
                deps,
                restat: spec.restat.unwrap_or(false),
                pool: spec.pool.unwrap_or_default(),
                platform: pairs(spec.platform),
                exec_timeout: Duration::from_secs(spec.timeout_secs.unwrap_or(0)),
                pure: spec.pure_cmd.unwrap_or(false),
                reproxy_config: None,
                weight: 0,
            },
            phony: spec.phony.unwrap_or(false),
            order_only: spec.order_only.unwrap_or_default(),
        });
    }
    Ok(steps)
}

fn pairs(v: Option<Vec<Vec<String>>>) -> Vec<(String, String)> {
    v.unwrap_or_default()
        .into_iter()
        .filter_map(|mut kv| {
            if kv.len() == 2 {
                let v = kv.pop().unwrap_or_default();
                let k = kv.pop().unwrap_or_default();
                Some((k, v))
            } else {
                None
            }
        })
        .collect()
}

/// Optional input-deps groups for the scanner, from
/// `.bx/input_deps.json`.
pub fn load_input_deps(exec_root: &Utf8Path) -> Result<HashMap<String, Vec<String>>> {
    let path = exec_root.join(".bx/input_deps.json");
    let json = match std::fs::read_to_string(&path) {
        Ok(j) => j,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };
    facet_json::from_str(&json).map_err(|e| eyre::eyre!("{path}: {e}"))
}
