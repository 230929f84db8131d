//! The build step graph.
//!
//! Steps are arena-indexed (`StepId`); the dependency structure is a
//! petgraph directed graph with edges pointing from dependent to
//! dependency. Priority weights are derived from the graph shape:
//! steps deep on the critical path and steps that unblock many others
//! get scheduled first under contention.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::{Cmd, ExecError};

pub type StepId = u32;

/// A step as read from the manifest.
#[derive(Debug, Clone, Default)]
pub struct StepDef {
    pub cmd: Cmd,
    /// Phony edges produce no action; they only propagate readiness.
    pub phony: bool,
    /// Order-only inputs gate scheduling but are not part of the
    /// fingerprint.
    pub order_only: Vec<String>,
}

/// The whole build's step DAG.
#[derive(Debug)]
pub struct BuildGraph {
    steps: Vec<StepDef>,
    graph: DiGraph<StepId, ()>,
    producer: HashMap<String, StepId>,
}

impl BuildGraph {
    /// Build the DAG, wiring an edge from each step to the producer of
    /// every (order-only included) input. Duplicate outputs and cycles
    /// are manifest errors.
    pub fn new(mut steps: Vec<StepDef>) -> Result<Self, ExecError> {
        let mut producer: HashMap<String, StepId> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            for out in &step.cmd.outputs {
                if let Some(prev) = producer.insert(out.clone(), i as StepId) {
                    return Err(ExecError::InvalidManifest(format!(
                        "output {} produced by both step {} and step {}",
                        out, prev, i
                    )));
                }
            }
        }

        let mut graph = DiGraph::with_capacity(steps.len(), steps.len() * 2);
        for i in 0..steps.len() {
            graph.add_node(i as StepId);
        }
        for (i, step) in steps.iter().enumerate() {
            let from = NodeIndex::new(i);
            for input in step.cmd.inputs.iter().chain(step.order_only.iter()) {
                if let Some(&dep) = producer.get(input) {
                    if dep as usize != i {
                        graph.update_edge(from, NodeIndex::new(dep as usize), ());
                    }
                }
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(ExecError::InvalidManifest("dependency cycle".to_string()));
        }

        let weights = compute_weights(&graph);
        for (i, w) in weights.into_iter().enumerate() {
            steps[i].cmd.weight = steps[i].cmd.weight.max(w);
        }

        Ok(Self {
            steps,
            graph,
            producer,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: StepId) -> &StepDef {
        &self.steps[id as usize]
    }

    pub fn producer_of(&self, output: &str) -> Option<StepId> {
        self.producer.get(output).copied()
    }

    /// Step ids this step depends on.
    pub fn dependencies(&self, id: StepId) -> Vec<StepId> {
        self.graph
            .neighbors_directed(NodeIndex::new(id as usize), Direction::Outgoing)
            .map(|n| n.index() as StepId)
            .collect()
    }

    /// Step ids waiting on this step.
    pub fn dependents(&self, id: StepId) -> Vec<StepId> {
        self.graph
            .neighbors_directed(NodeIndex::new(id as usize), Direction::Incoming)
            .map(|n| n.index() as StepId)
            .collect()
    }

    /// Inputs not produced by any step; they must exist on disk before
    /// scheduling.
    pub fn source_inputs(&self, id: StepId) -> Vec<&str> {
        self.steps[id as usize]
            .cmd
            .inputs
            .iter()
            .filter(|i| !self.producer.contains_key(*i))
            .map(String::as_str)
            .collect()
    }
}

/// Priority weights from graph shape: critical-path height times ten,
/// plus a capped fanout bonus for steps (headers, stamps) that unblock
/// many others.
fn compute_weights(graph: &DiGraph<StepId, ()>) -> Vec<i32> {
    let n = graph.node_count();
    let mut height = vec![0i32; n];
    // Toposort exists (acyclicity was checked); walk dependents-first.
    let order = petgraph::algo::toposort(graph, None).unwrap_or_default();
    for node in order {
        let h = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|d| height[d.index()] + 1)
            .max()
            .unwrap_or(0);
        height[node.index()] = h;
    }
    (0..n)
        .map(|i| {
            let fanout = graph
                .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                .count()
                .min(50) as i32;
            height[i] * 10 + fanout
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, inputs: &[&str], outputs: &[&str]) -> StepDef {
        StepDef {
            cmd: Cmd {
                id: id.to_string(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn wires_producer_edges() {
        let g = BuildGraph::new(vec![
            step("gen", &[], &["gen/a.h"]),
            step("cc", &["gen/a.h", "src/a.cc"], &["obj/a.o"]),
            step("link", &["obj/a.o"], &["bin/a"]),
        ])
        .unwrap();
        assert_eq!(g.dependencies(1), vec![0]);
        assert_eq!(g.dependencies(2), vec![1]);
        assert_eq!(g.dependents(0), vec![1]);
        assert_eq!(g.producer_of("bin/a"), Some(2));
        assert_eq!(g.source_inputs(1), vec!["src/a.cc"]);
    }

    #[test]
    fn duplicate_output_is_invalid() {
        let err = BuildGraph::new(vec![
            step("a", &[], &["out.o"]),
            step("b", &[], &["out.o"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ExecError::InvalidManifest(_)));
    }

    #[test]
    fn cycle_is_invalid() {
        let err = BuildGraph::new(vec![
            step("a", &["b.out"], &["a.out"]),
            step("b", &["a.out"], &["b.out"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ExecError::InvalidManifest(_)));
    }

    #[test]
    fn deep_dependencies_weigh_more() {
        let g = BuildGraph::new(vec![
            step("gen", &[], &["gen/a.h"]),
            step("cc", &["gen/a.h"], &["obj/a.o"]),
            step("link", &["obj/a.o"], &["bin/a"]),
        ])
        .unwrap();
        let w_gen = g.step(0).cmd.weight;
        let w_cc = g.step(1).cmd.weight;
        let w_link = g.step(2).cmd.weight;
        assert!(w_gen > w_cc, "{w_gen} vs {w_cc}");
        assert!(w_cc > w_link, "{w_cc} vs {w_link}");
    }

    #[test]
    fn high_fanout_headers_weigh_more_than_siblings() {
        let mut steps = vec![step("gen", &[], &["gen/popular.h"])];
        for i in 0..20 {
            steps.push(step(
                &format!("cc{i}"),
                &["gen/popular.h"],
                &[format!("obj/{i}.o").as_str()],
            ));
        }
        steps.push(step("lone", &[], &["obj/lone.o"]));
        let g = BuildGraph::new(steps).unwrap();
        assert!(g.step(0).cmd.weight > g.step(21).cmd.weight);
    }

    #[test]
    fn order_only_inputs_create_edges() {
        let mut dep = step("cc", &["src/a.cc"], &["obj/a.o"]);
        dep.order_only = vec!["gen/stamp".to_string()];
        let g = BuildGraph::new(vec![step("stamp", &[], &["gen/stamp"]), dep]).unwrap();
        assert_eq!(g.dependencies(1), vec![0]);
    }
}
