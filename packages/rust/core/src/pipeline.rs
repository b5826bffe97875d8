//! DAG pipeline executor.
//!
//! A [`Pipeline`] holds named stages and directed connections from one stage's
//! output port to another stage's input port. [`Pipeline::run`] validates the
//! whole graph against the initial inputs before running anything, then runs
//! stages one at a time in topological order. Stages with no ordering
//! constraint between them run in the order they were added.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use webrag_shared::{RagError, Result};

use crate::component::{Component, Inputs, Outputs, Port, Value};

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Progress hooks called while a pipeline runs.
pub trait RunObserver: Send + Sync {
    /// Called before a stage starts.
    fn stage_started(&self, _stage: &str) {}
    /// Called after a stage returns successfully.
    fn stage_finished(&self, _stage: &str, _elapsed: Duration) {}
    /// Called when a stage fails; the run stops afterwards.
    fn stage_failed(&self, _stage: &str, _error: &RagError) {}
}

/// Observer that ignores every event.
pub struct SilentObserver;

impl RunObserver for SilentObserver {}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Initial values for unconnected input ports, keyed by stage then port.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs(BTreeMap<String, BTreeMap<String, Value>>);

impl PipelineInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of `stage.port`.
    pub fn with(mut self, stage: &str, port: &str, value: Value) -> Self {
        self.0
            .entry(stage.to_string())
            .or_default()
            .insert(port.to_string(), value);
        self
    }

    fn get(&self, stage: &str, port: &str) -> Option<&Value> {
        self.0.get(stage)?.get(port)
    }
}

/// Every stage's outputs from one run, keyed by stage name.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    run_id: Uuid,
    stages: BTreeMap<String, Outputs>,
}

impl PipelineOutput {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// All outputs of `stage`.
    pub fn stage(&self, stage: &str) -> Option<&Outputs> {
        self.stages.get(stage)
    }

    /// A single output value, `stage.port`.
    pub fn get(&self, stage: &str, port: &str) -> Option<&Value> {
        self.stages.get(stage)?.get(port)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Stage {
    name: String,
    component: Box<dyn Component>,
}

#[derive(Debug, Clone)]
struct Connection {
    output: String,
    input: String,
}

/// A directed acyclic graph of named stages.
#[derive(Default)]
pub struct Pipeline {
    graph: DiGraph<Stage, Connection>,
    indices: HashMap<String, NodeIndex>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage under a unique name.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        component: impl Component + 'static,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(RagError::pipeline(format!(
                "invalid stage name '{name}': must be non-empty and contain no '.'"
            )));
        }
        if self.indices.contains_key(&name) {
            return Err(RagError::pipeline(format!("stage '{name}' already exists")));
        }

        let index = self.graph.add_node(Stage {
            name: name.clone(),
            component: Box::new(component),
        });
        self.indices.insert(name, index);
        Ok(())
    }

    /// Connect `"stage.output"` to `"stage.input"`.
    ///
    /// Both ports must exist with the same kind, and an input accepts at most
    /// one connection. Cycles are reported when the pipeline is validated.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        let (src_stage, src_port) = split_address(from)?;
        let (dst_stage, dst_port) = split_address(to)?;

        let src = self.index_of(src_stage)?;
        let dst = self.index_of(dst_stage)?;

        let src_outputs = self.graph[src].component.outputs();
        let dst_inputs = self.graph[dst].component.inputs();
        let output = find_port(&src_outputs, src_port).ok_or_else(|| {
            RagError::pipeline(format!("stage '{src_stage}' has no output '{src_port}'"))
        })?;
        let input = find_port(&dst_inputs, dst_port).ok_or_else(|| {
            RagError::pipeline(format!("stage '{dst_stage}' has no input '{dst_port}'"))
        })?;

        if output.kind != input.kind {
            return Err(RagError::pipeline(format!(
                "cannot connect {from} ({}) to {to} ({})",
                output.kind, input.kind
            )));
        }

        if self.is_connected(dst, dst_port) {
            return Err(RagError::pipeline(format!("input {to} is already connected")));
        }

        self.graph.add_edge(
            src,
            dst,
            Connection {
                output: src_port.to_string(),
                input: dst_port.to_string(),
            },
        );
        debug!(%from, %to, "stages connected");
        Ok(())
    }

    /// Stage names in the order they were added.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|s| s.name.as_str())
    }

    fn index_of(&self, stage: &str) -> Result<NodeIndex> {
        self.indices
            .get(stage)
            .copied()
            .ok_or_else(|| RagError::pipeline(format!("unknown stage '{stage}'")))
    }

    /// Check the graph against `inputs` and return the execution order.
    ///
    /// Fails if the graph has a cycle, if an initial input names an unknown
    /// stage or port, has the wrong kind or targets a connected input, or if
    /// a required input is neither connected nor supplied.
    pub fn validate(&self, inputs: &PipelineInputs) -> Result<Vec<String>> {
        self.validated_order(inputs).map(|order| {
            order
                .into_iter()
                .map(|i| self.graph[i].name.clone())
                .collect()
        })
    }

    fn validated_order(&self, inputs: &PipelineInputs) -> Result<Vec<NodeIndex>> {
        let order = self.topological_order()?;

        for (stage_name, ports) in &inputs.0 {
            let index = self.index_of(stage_name)?;
            let declared = self.graph[index].component.inputs();
            for (port_name, value) in ports {
                let port = find_port(&declared, port_name).ok_or_else(|| {
                    RagError::pipeline(format!("stage '{stage_name}' has no input '{port_name}'"))
                })?;
                if port.kind != value.kind() {
                    return Err(RagError::pipeline(format!(
                        "input {stage_name}.{port_name} expects {}, got {}",
                        port.kind,
                        value.kind()
                    )));
                }
                if self.is_connected(index, port_name) {
                    return Err(RagError::pipeline(format!(
                        "input {stage_name}.{port_name} is connected and cannot also be supplied"
                    )));
                }
            }
        }

        for &index in &order {
            let stage = &self.graph[index];
            for port in stage.component.inputs().iter().filter(|p| p.required) {
                let satisfied = self.is_connected(index, &port.name)
                    || inputs.get(&stage.name, &port.name).is_some();
                if !satisfied {
                    return Err(RagError::pipeline(format!(
                        "required input {}.{} is neither connected nor supplied",
                        stage.name, port.name
                    )));
                }
            }
        }

        Ok(order)
    }

    fn is_connected(&self, index: NodeIndex, port: &str) -> bool {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .any(|e| e.weight().input == port)
    }

    /// Kahn's algorithm, always picking the earliest-added ready stage.
    fn topological_order(&self) -> Result<Vec<NodeIndex>> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(RagError::pipeline("pipeline graph contains a cycle"));
        }

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.edges_directed(i, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for edge in self.graph.edges_directed(next, Direction::Outgoing) {
                let target = edge.target();
                in_degree[target.index()] -= 1;
                if in_degree[target.index()] == 0 {
                    ready.insert(target);
                }
            }
        }

        Ok(order)
    }

    /// Validate, then run every stage in topological order.
    ///
    /// Validation failures are [`RagError::Pipeline`] and happen before any
    /// stage runs. A stage failure stops the run and is returned wrapped in
    /// [`RagError::Stage`] with the stage name.
    pub async fn run(
        &self,
        inputs: PipelineInputs,
        observer: &dyn RunObserver,
    ) -> Result<PipelineOutput> {
        let run_id = Uuid::now_v7();
        let span = info_span!("pipeline_run", %run_id, stages = self.graph.node_count());
        self.run_inner(run_id, inputs, observer).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mut inputs: PipelineInputs,
        observer: &dyn RunObserver,
    ) -> Result<PipelineOutput> {
        let order = self.validated_order(&inputs)?;
        let start = Instant::now();
        info!(order = ?order.iter().map(|&i| &self.graph[i].name).collect::<Vec<_>>(), "pipeline run started");

        let mut produced: HashMap<NodeIndex, Outputs> = HashMap::new();

        for index in order {
            let stage = &self.graph[index];
            let mut stage_inputs = Inputs::new();

            if let Some(initial) = inputs.0.remove(&stage.name) {
                for (port, value) in initial {
                    stage_inputs.insert(port, value);
                }
            }
            for edge in self.graph.edges_directed(index, Direction::Incoming) {
                let Connection { output, input } = edge.weight();
                let value = produced
                    .get(&edge.source())
                    .and_then(|outputs| outputs.get(output))
                    .cloned();
                match value {
                    Some(value) => stage_inputs.insert(input.clone(), value),
                    None => warn!(
                        stage = %stage.name,
                        %input,
                        "upstream stage produced no value for connected input"
                    ),
                }
            }

            observer.stage_started(&stage.name);
            let stage_start = Instant::now();
            debug!(stage = %stage.name, "stage started");

            match stage.component.run(stage_inputs).await {
                Ok(outputs) => {
                    let elapsed = stage_start.elapsed();
                    debug!(stage = %stage.name, elapsed_ms = elapsed.as_millis() as u64, "stage finished");
                    observer.stage_finished(&stage.name, elapsed);
                    produced.insert(index, outputs);
                }
                Err(e) => {
                    warn!(stage = %stage.name, error = %e, "stage failed");
                    observer.stage_failed(&stage.name, &e);
                    return Err(e.in_stage(stage.name.clone()));
                }
            }
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pipeline run completed"
        );

        let stages = produced
            .into_iter()
            .map(|(index, outputs)| (self.graph[index].name.clone(), outputs))
            .collect();

        Ok(PipelineOutput { run_id, stages })
    }
}

fn split_address(address: &str) -> Result<(&str, &str)> {
    address
        .split_once('.')
        .filter(|(stage, port)| !stage.is_empty() && !port.is_empty())
        .ok_or_else(|| {
            RagError::pipeline(format!(
                "invalid connection endpoint '{address}', expected 'stage.port'"
            ))
        })
}

fn find_port<'a>(ports: &'a [Port], name: &str) -> Option<&'a Port> {
    ports.iter().find(|p| p.name == name)
}
