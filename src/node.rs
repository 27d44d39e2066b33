//! DAG node: one job and its lifecycle
//!
//! A node is created from (description, commit expression, command-or-code,
//! parameters), or rebound to a persisted experiment by hash. Identity
//! depends on the expanded command text, which depends on the parents'
//! hashes, so `job_init` is a separate step that must run in topological
//! order once the edges are final.

use std::fs;
use std::path::PathBuf;

use tracing::{error, warn};

use crate::backend::{Backend, JobHandle};
use crate::descr::{now, Descriptor, Params, RunState};
use crate::error::{RelabError, Result};
use crate::macros::{self, MacroContext};
use crate::repo;
use crate::store::Store;
use crate::template::{self, RefTarget};

/// Index of a node in the DAG arena
pub type NodeId = usize;

/// What a node executes: a shell command launched through the backend, or a
/// macro call evaluated in-process.
#[derive(Debug, Clone)]
pub enum Payload {
    Command(String),
    Code(String),
}

impl Payload {
    pub fn source_text(&self) -> &str {
        match self {
            Payload::Command(s) | Payload::Code(s) => s,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Payload::Code(_))
    }
}

pub struct Node {
    pub description: String,
    /// Raw commit expression as given (`HEAD`, branch, short hash, ...)
    pub commit_expr: String,
    pub payload: Payload,
    pub params: Params,
    /// Force a fresh run, discarding prior results for this identity
    pub rerun: bool,
    /// Check out only the working directory instead of the whole tree
    pub subdir_only: bool,
    /// Adopt the result tree of this prior hash instead of running
    pub import: Option<String>,

    /// Edges into the arena; wired before `job_init`, immutable afterwards
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,

    // Everything below is filled in by job_init.
    pub hsh: String,
    pub working_dir: String,
    pub descr: Option<Descriptor>,
    /// Command after expansion, output-slot substitution and log tee; for
    /// code nodes, the macro call text
    pub final_text: String,
    pub results_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// Exported to the job when it has exactly one parent
    pub parent_results_dir: Option<PathBuf>,
    pub job: Option<Box<dyn JobHandle>>,
}

impl Node {
    /// Build a node to be run. Exactly one of `command` / `code` must be
    /// given.
    pub fn new(
        description: impl Into<String>,
        commit_expr: impl Into<String>,
        command: Option<String>,
        code: Option<String>,
        params: Params,
    ) -> Result<Self> {
        let description = description.into();
        let payload = match (command, code) {
            (Some(cmd), None) => Payload::Command(cmd),
            (None, Some(code)) => Payload::Code(code),
            _ => {
                return Err(RelabError::CommandCodeConflict { description });
            }
        };
        Ok(Node {
            description,
            commit_expr: commit_expr.into(),
            payload,
            params,
            rerun: false,
            subdir_only: false,
            import: None,
            parents: Vec::new(),
            children: Vec::new(),
            hsh: String::new(),
            working_dir: String::new(),
            descr: None,
            final_text: String::new(),
            results_dir: PathBuf::new(),
            scratch_dir: PathBuf::new(),
            parent_results_dir: None,
            job: None,
        })
    }

    /// Rebind to an experiment already in the store.
    pub fn rebind(store: &Store, hsh: &str) -> Result<Self> {
        let descr = store.load_descr(hsh)?.ok_or_else(|| RelabError::NoMatch {
            query: hsh.to_string(),
        })?;
        let payload = match (&descr.command, &descr.code) {
            (_, Some(code)) => Payload::Code(code.clone()),
            (Some(cmd), None) => Payload::Command(cmd.clone()),
            (None, None) => Payload::Command(String::new()),
        };
        Ok(Node {
            description: descr.description.clone(),
            commit_expr: descr.commit.clone(),
            payload,
            params: descr.params.clone(),
            rerun: false,
            subdir_only: false,
            import: None,
            parents: Vec::new(),
            children: Vec::new(),
            hsh: hsh.to_string(),
            working_dir: descr.working_dir.clone(),
            final_text: descr
                .final_command
                .clone()
                .or_else(|| descr.final_code.clone())
                .unwrap_or_default(),
            results_dir: store.results_dir(hsh),
            scratch_dir: store.scratch_dir(hsh),
            parent_results_dir: None,
            job: None,
            descr: Some(descr),
        })
    }

    pub fn run_state(&self) -> RunState {
        self.descr
            .as_ref()
            .map(|d| d.run_state)
            .unwrap_or(RunState::Virgin)
    }

    pub fn set_state(&mut self, state: RunState, return_code: Option<i32>) {
        if let Some(descr) = self.descr.as_mut() {
            descr.run_state = state;
            descr.return_code = return_code;
        }
    }

    /// Directory the job's command runs in
    pub fn job_dir(&self) -> PathBuf {
        self.scratch_dir.join(&self.working_dir)
    }

    /// View of this node usable as a reference target by its children.
    /// Valid only after `job_init`.
    pub fn ref_target(&self) -> RefTarget {
        let descr = self.descr.as_ref().expect("job_init ran");
        RefTarget {
            hsh: self.hsh.clone(),
            description: descr.description.clone(),
            params: descr.params.clone(),
            date: descr.date,
        }
    }

    /// Resolve identity and adopt or initialize the descriptor.
    ///
    /// `targets` are the parents as reference candidates and
    /// `parent_hashes` their hashes in parent order; both exist because
    /// parents were initialized first.
    pub fn job_init(
        &mut self,
        store: &Store,
        working_dir: &str,
        targets: &[RefTarget],
        parent_hashes: &[String],
    ) -> Result<()> {
        let commit = repo::rev_parse(store.root(), &self.commit_expr)?;
        self.working_dir = working_dir.to_string();

        // command expansion comes first: the hash is computed from its
        // output, with the output slot still symbolic
        let (expanded, mut deps) = match &self.payload {
            Payload::Command(cmd) => {
                let expansion =
                    template::expand_command(cmd, &self.params, targets, &store.results_root())?;
                (expansion.text, expansion.deps)
            }
            Payload::Code(code) => (code.clone(), Vec::new()),
        };

        let mixed_parents = self.payload.is_code().then_some(parent_hashes);
        self.hsh = compose_hash(
            &commit,
            working_dir,
            self.payload.source_text(),
            &expanded,
            mixed_parents,
        );
        self.results_dir = store.results_dir(&self.hsh);
        self.scratch_dir = store.scratch_dir(&self.hsh);
        self.parent_results_dir = match parent_hashes {
            [only] => Some(store.results_dir(only)),
            _ => None,
        };

        // every parent is a dependency, alongside whatever the references
        // resolved to
        deps.extend(parent_hashes.iter().cloned());

        if self.rerun {
            store.purge(&self.hsh)?;
        }

        self.final_text = match &self.payload {
            Payload::Command(_) => with_log_tee(&expanded, &self.results_dir),
            Payload::Code(_) => expanded,
        };

        let mut descr = match store.load_descr(&self.hsh)? {
            Some(prior) if !self.rerun => prior,
            _ => {
                let mut fresh = Descriptor::new(
                    self.description.clone(),
                    working_dir,
                    commit,
                    self.params.clone(),
                );
                fresh.deps = deps.into_iter().collect();
                match &self.payload {
                    Payload::Command(cmd) => {
                        fresh.command = Some(cmd.clone());
                        fresh.final_command = Some(self.final_text.clone());
                    }
                    Payload::Code(code) => {
                        fresh.code = Some(code.clone());
                        fresh.final_code = Some(self.final_text.clone());
                    }
                }
                fresh
            }
        };

        // a RUNNING descriptor can only come from a dead runner; make the
        // node runnable again and drop its stale workspace
        if descr.run_state == RunState::Running {
            warn!(hsh = %self.hsh, "found RUNNING state from a previous run, resetting");
            descr.run_state = RunState::Virgin;
            descr.return_code = None;
            store.cleanup_scratch(&self.hsh)?;
            store.save_descr(&self.hsh, &descr)?;
        }

        if let Some(src) = &self.import {
            if descr.run_state == RunState::Virgin {
                store.import_results(src, &self.hsh)?;
                descr.import = Some(src.clone());
                descr.run_state = RunState::Success;
                descr.return_code = Some(0);
                descr.date_end = Some(now());
                store.save_descr(&self.hsh, &descr)?;
            }
        }

        self.descr = Some(descr);
        Ok(())
    }

    /// Prepare directories and the scratch checkout ahead of a launch.
    ///
    /// Errors here mean the node fails without launching; the run itself
    /// continues.
    pub fn setup_env(&mut self, store: &Store) -> Result<()> {
        fs::create_dir_all(store.results_root())?;
        fs::create_dir_all(store.scratch_root())?;
        fs::create_dir_all(&self.results_dir)?;
        store.save_descr(&self.hsh, self.descr.as_ref().expect("job_init ran"))?;

        if self.payload.is_code() {
            // macros run in-process against results directories only
            return Ok(());
        }

        // always start from a fresh checkout
        store.cleanup_scratch(&self.hsh)?;
        fs::create_dir_all(&self.scratch_dir).map_err(|e| RelabError::Workspace {
            path: self.scratch_dir.clone(),
            details: e.to_string(),
        })?;

        let checkout = if self.subdir_only {
            self.working_dir.as_str()
        } else {
            "."
        };
        let commit = &self.descr.as_ref().expect("job_init ran").commit;
        repo::archive_into(store.root(), commit, checkout, &self.scratch_dir)?;

        let first = self.final_text.split_whitespace().next().unwrap_or("");
        if !repo::resolves_as_binary(first, &self.job_dir()) {
            return Err(RelabError::Workspace {
                path: self.job_dir(),
                details: format!("command binary '{first}' not found"),
            });
        }
        Ok(())
    }

    /// Hand the prepared command to the backend and persist the RUNNING
    /// state, so an interrupted run is detectable at the next startup.
    pub fn launch(&mut self, backend: &dyn Backend, store: &Store) -> Result<()> {
        let handle = backend.run(self)?;
        self.job = Some(handle);
        self.set_state(RunState::Running, None);
        store.save_descr(&self.hsh, self.descr.as_ref().expect("job_init ran"))
    }

    /// Evaluate a code payload synchronously.
    pub fn run_macro(&mut self, ctx: &MacroContext, store: &Store) -> Result<()> {
        let code = self.payload.source_text().to_string();
        match macros::evaluate(&code, ctx) {
            Ok(return_code) => {
                self.set_state(RunState::Success, Some(return_code));
            }
            Err(e) => {
                error!(hsh = %self.hsh, error = %e, "macro failed");
                self.set_state(RunState::Fail, None);
            }
        }
        if let Some(descr) = self.descr.as_mut() {
            descr.date_end = Some(now());
        }
        store.save_descr(&self.hsh, self.descr.as_ref().expect("job_init ran"))
    }

    /// Tear down after a RUNNING node reached a terminal state: drop the
    /// scratch workspace and persist the final descriptor.
    pub fn clean_up_run(&mut self, store: &Store) -> Result<()> {
        store.cleanup_scratch(&self.hsh)?;
        self.job = None;
        if let Some(descr) = self.descr.as_mut() {
            descr.date_end = Some(now());
        }
        store.save_descr(&self.hsh, self.descr.as_ref().expect("job_init ran"))
    }
}

/// The content hash: commit, working directory and command text, with
/// lengths separating the variable parts. Code nodes additionally mix in
/// their parents' hashes, since the macro text alone does not mention them.
pub fn compose_hash(
    commit: &str,
    working_dir: &str,
    source: &str,
    expanded: &str,
    parent_hashes: Option<&[String]>,
) -> String {
    let mut input = String::from(commit);
    if let Some(hashes) = parent_hashes {
        for h in hashes {
            input.push_str(h);
        }
    }
    input.push_str(&working_dir.len().to_string());
    input.push_str(working_dir);
    input.push_str(&source.len().to_string());
    input.push_str(expanded);
    repo::sha1_hex(&input)
}

/// Append the log tee and fill the output slot with the results directory.
fn with_log_tee(expanded: &str, results_dir: &std::path::Path) -> String {
    let teed = format!("{expanded} | tee {{}}/log 2>&1");
    teed.replace("{}", &results_dir.display().to_string())
}
