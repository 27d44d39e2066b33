//! DAG container and main loop
//!
//! Owns the node arena, derives a deterministic topological order,
//! propagates parameters down the edges, initializes every node in order
//! and then drives the poll loop: start whatever is runnable up to the
//! concurrency cap, sleep, poll the running jobs, repeat until every node
//! is terminal or permanently stuck behind a failure.

use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::descr::{ParamValue, Params, RunState};
use crate::error::Result;
use crate::macros::{MacroContext, ParentView};
use crate::node::{Node, NodeId};
use crate::store::Store;

/// Cap on simultaneously RUNNING nodes
pub const DEFAULT_MAX_PROCESSES: usize = 4;

/// Pause between scheduler passes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Dag {
    store: Store,
    nodes: Vec<Node>,
    /// Topological order, parents first; fixed by `init`
    order: Vec<NodeId>,
    working_dir: String,
    max_processes: usize,
    poll_interval: Duration,
}

impl Dag {
    pub fn new(store: Store, working_dir: impl Into<String>) -> Self {
        Dag {
            store,
            nodes: Vec::new(),
            order: Vec::new(),
            working_dir: working_dir.into(),
            max_processes: DEFAULT_MAX_PROCESSES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Wire a parent/child edge; kept symmetric on both sides. Edges are
    /// immutable once `init` has run.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) {
        if !self.nodes[child].parents.contains(&parent) {
            self.nodes[child].parents.push(parent);
        }
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Fix the topological order, propagate parameters and initialize every
    /// node. Must run after all edges are wired and before `main_loop`.
    pub fn init(&mut self) -> Result<()> {
        self.order = self.topo_order();
        for position in 0..self.order.len() {
            let id = self.order[position];

            // ancestry parameters flow down before identity is computed
            let inherited: Vec<(String, Params)> = self.nodes[id]
                .parents
                .iter()
                .map(|&p| (self.nodes[p].description.clone(), self.nodes[p].params.clone()))
                .collect();
            propagate_params(&inherited, &mut self.nodes[id].params);

            let targets: Vec<_> = self.nodes[id]
                .parents
                .iter()
                .map(|&p| self.nodes[p].ref_target())
                .collect();
            let parent_hashes: Vec<String> = self.nodes[id]
                .parents
                .iter()
                .map(|&p| self.nodes[p].hsh.clone())
                .collect();

            let working_dir = self.working_dir.clone();
            self.nodes[id].job_init(&self.store, &working_dir, &targets, &parent_hashes)?;
        }
        Ok(())
    }

    /// Children-first iterative visit from the parentless roots, reversed,
    /// so parents always precede children. Deterministic for a fixed
    /// insertion order.
    fn topo_order(&self) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut reversed = Vec::with_capacity(self.nodes.len());

        let roots = (0..self.nodes.len()).filter(|&id| self.nodes[id].parents.is_empty());
        for root in roots {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            while let Some(top) = stack.last_mut() {
                let (id, child_idx) = *top;
                if child_idx < self.nodes[id].children.len() {
                    top.1 += 1;
                    let child = self.nodes[id].children[child_idx];
                    if !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                } else {
                    reversed.push(id);
                    stack.pop();
                }
            }
        }
        reversed.reverse();
        reversed
    }

    fn is_runnable(&self, id: NodeId) -> bool {
        self.nodes[id].run_state() == RunState::Virgin
            && self.nodes[id]
                .parents
                .iter()
                .all(|&p| self.nodes[p].run_state() == RunState::Success)
    }

    fn count_running(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.run_state() == RunState::Running)
            .count()
    }

    /// Greedy pass in topological order: start every runnable node while
    /// slots remain. Code nodes evaluate synchronously and occupy no slot,
    /// which also lets their children start within the same pass.
    fn schedule_runnable(&mut self, backend: &dyn Backend) -> Result<()> {
        let mut running = self.count_running();
        let order = self.order.clone();
        for id in order {
            if !self.is_runnable(id) {
                continue;
            }
            if !self.nodes[id].payload.is_code() && running >= self.max_processes {
                continue;
            }

            if let Err(e) = self.nodes[id].setup_env(&self.store) {
                error!(hsh = %self.nodes[id].hsh, error = %e, "workspace setup failed");
                self.fail_node(id)?;
                continue;
            }

            if self.nodes[id].payload.is_code() {
                let ctx = self.macro_context(id);
                self.nodes[id].run_macro(&ctx, &self.store)?;
            } else {
                match self.nodes[id].launch(backend, &self.store) {
                    Ok(()) => running += 1,
                    Err(e) => {
                        error!(hsh = %self.nodes[id].hsh, error = %e, "launch failed");
                        self.fail_node(id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn macro_context(&self, id: NodeId) -> MacroContext {
        let parents = self.nodes[id]
            .parents
            .iter()
            .map(|&p| {
                let parent = &self.nodes[p];
                ParentView {
                    description: parent.description.clone(),
                    results_dir: parent.results_dir.clone(),
                    params: parent
                        .descr
                        .as_ref()
                        .map(|d| d.params.clone())
                        .unwrap_or_default(),
                }
            })
            .collect();
        MacroContext {
            results_dir: self.nodes[id].results_dir.clone(),
            parents,
            base_dir: self.store.root().join(&self.working_dir),
        }
    }

    fn fail_node(&mut self, id: NodeId) -> Result<()> {
        self.nodes[id].set_state(RunState::Fail, None);
        self.nodes[id].clean_up_run(&self.store)
    }

    /// Poll every RUNNING node once; terminal transitions tear down the
    /// scratch workspace and persist the descriptor.
    fn poll_running(&mut self, backend: &dyn Backend) -> Result<()> {
        for id in 0..self.nodes.len() {
            if self.nodes[id].run_state() != RunState::Running {
                continue;
            }
            match backend.get_state(&mut self.nodes[id]) {
                Ok((RunState::Running, _)) => {}
                Ok((state, code)) => {
                    info!(hsh = %self.nodes[id].hsh, %state, ?code, "job finished");
                    self.nodes[id].set_state(state, code);
                    self.nodes[id].clean_up_run(&self.store)?;
                }
                Err(e) => {
                    // no retries: a poll that cannot be completed counts as
                    // an execution failure for the node
                    warn!(hsh = %self.nodes[id].hsh, error = %e, "poll failed");
                    self.fail_node(id)?;
                }
            }
        }
        Ok(())
    }

    /// Overall run state: SUCCESS once everything succeeded, RUNNING while
    /// anything runs or can still start, FAIL once the rest is stuck.
    fn status(&self) -> RunState {
        let mut any_fail = false;
        let mut any_virgin = false;
        for id in 0..self.nodes.len() {
            match self.nodes[id].run_state() {
                RunState::Running => return RunState::Running,
                RunState::Virgin => {
                    if self.is_runnable(id) {
                        return RunState::Running;
                    }
                    any_virgin = true;
                }
                RunState::Fail => any_fail = true,
                RunState::Success => {}
            }
        }
        if any_fail || any_virgin {
            RunState::Fail
        } else {
            RunState::Success
        }
    }

    /// Drive the DAG to completion. Never cancels running children: after a
    /// failure the loop keeps polling until nothing is RUNNING, then
    /// reports FAIL.
    pub fn main_loop(&mut self, backend: &dyn Backend) -> Result<RunState> {
        loop {
            self.schedule_runnable(backend)?;
            match self.status() {
                RunState::Running => {}
                terminal => {
                    info!(%terminal, "run finished");
                    return Ok(terminal);
                }
            }
            thread::sleep(self.poll_interval);
            self.poll_running(backend)?;
        }
    }
}

/// Fold each parent's parameters into the child under `<description>:<key>`.
/// A second contributor to the same key turns the value into an ordered
/// list, first contributor first, preserving diverging lineages in a flat
/// namespace.
pub fn propagate_params(parents: &[(String, Params)], child: &mut Params) {
    for (description, params) in parents {
        for (key, value) in params {
            let inherited_key = format!("{description}:{key}");
            match child.get_mut(&inherited_key) {
                None => {
                    child.insert(inherited_key, value.clone());
                }
                Some(ParamValue::List(items)) => items.push(value.clone()),
                Some(existing) => {
                    let first = existing.clone();
                    *existing = ParamValue::List(vec![first, value.clone()]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn command_node(desc: &str) -> Node {
        Node::new(desc, "HEAD", Some(format!("echo {desc}")), None, Params::new()).unwrap()
    }

    fn dag() -> Dag {
        let tmp = tempfile::tempdir().unwrap();
        Dag::new(Store::at(tmp.path()), ".")
    }

    #[test]
    fn topo_order_puts_parents_first() {
        let mut dag = dag();
        let a = dag.add_node(command_node("a"));
        let b = dag.add_node(command_node("b"));
        let c = dag.add_node(command_node("c"));
        let d = dag.add_node(command_node("d"));
        // diamond: a -> b, a -> c, b -> d, c -> d
        dag.add_edge(a, b);
        dag.add_edge(a, c);
        dag.add_edge(b, d);
        dag.add_edge(c, d);

        let order = dag.topo_order();
        assert_eq!(order.len(), 4);
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn topo_order_is_deterministic() {
        let build = || {
            let mut dag = dag();
            let a = dag.add_node(command_node("a"));
            let b = dag.add_node(command_node("b"));
            let c = dag.add_node(command_node("c"));
            dag.add_edge(a, c);
            dag.add_edge(b, c);
            dag.topo_order()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn edges_are_symmetric() {
        let mut dag = dag();
        let a = dag.add_node(command_node("a"));
        let b = dag.add_node(command_node("b"));
        dag.add_edge(a, b);
        dag.add_edge(a, b); // duplicate is a no-op
        assert_eq!(dag.node(a).children, vec![b]);
        assert_eq!(dag.node(b).parents, vec![a]);
    }

    #[test]
    fn propagation_namespaces_by_description() {
        let mut parent_params = Params::new();
        parent_params.insert("rate".into(), ParamValue::Float(0.5));
        let mut child = Params::new();
        propagate_params(&[("gen".into(), parent_params)], &mut child);
        assert_eq!(child.get("gen:rate"), Some(&ParamValue::Float(0.5)));
    }

    #[test]
    fn second_contributor_builds_ordered_list() {
        let mut p1 = Params::new();
        p1.insert("k".into(), ParamValue::Int(1));
        let mut p2 = Params::new();
        p2.insert("k".into(), ParamValue::Int(2));
        let mut p3 = Params::new();
        p3.insert("k".into(), ParamValue::Int(3));

        let mut child = Params::new();
        propagate_params(
            &[("d".into(), p1), ("d".into(), p2), ("d".into(), p3)],
            &mut child,
        );
        assert_eq!(
            child.get("d:k"),
            Some(&ParamValue::List(vec![
                ParamValue::Int(1),
                ParamValue::Int(2),
                ParamValue::Int(3),
            ]))
        );
    }

    #[test]
    fn propagation_carries_inherited_lineage() {
        // grandparent "g" -> parent "p" -> child: the child sees p:g:k
        let mut parent_params = Params::new();
        parent_params.insert("g:k".into(), ParamValue::Int(7));
        let mut child = Params::new();
        propagate_params(&[("p".into(), parent_params)], &mut child);
        assert_eq!(child.get("p:g:k"), Some(&ParamValue::Int(7)));
    }
}
