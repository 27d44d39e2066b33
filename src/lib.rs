//! # Relab
//!
//! Reproducible experiment runner: a DAG of jobs, each pinned to a git
//! commit and a templated shell command (or an in-process aggregation
//! macro), with results content-addressed by the hash of
//! (commit, working directory, expanded command). Re-running an already
//! successful job is a no-op; interrupting a run leaves every affected job
//! re-runnable.
//!
//! ## Modules
//!
//! - [`repo`] - git plumbing, hashing, shell execution
//! - [`descr`] - the persisted descriptor record and its value types
//! - [`store`] - the on-disk layout: `results/`, `exp/`, `.exp/tasks/`
//! - [`template`] - `{...}` / `[...]` reference expansion
//! - [`node`] - one DAG vertex and its lifecycle
//! - [`dag`] - topological order, parameter propagation, the poll loop
//! - [`backend`] - launch/poll contract and the local process backend
//! - [`macros`] - built-in aggregation macros for code nodes
//! - [`taskfile`] - task file parsing, archiving and replay
//! - [`query`] - `list` / `show` / `hash` / `purge` and store-wide expansion
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use relab::{Dag, LocalBackend, Node, Store};
//!
//! let store = Store::open()?;
//! let working_dir = relab::repo::working_dir(store.root());
//! let mut dag = Dag::new(store, working_dir);
//!
//! let gen = dag.add_node(Node::new(
//!     "gen", "HEAD", Some("echo 42 > {}/out".into()), None, Default::default(),
//! )?);
//! let sum = dag.add_node(Node::new(
//!     "sum", "HEAD", Some("cat {gen}/out > {}/out".into()), None, Default::default(),
//! )?);
//! dag.add_edge(gen, sum);
//!
//! dag.init()?;
//! let state = dag.main_loop(&LocalBackend::new())?;
//! # Ok::<(), relab::RelabError>(())
//! ```

pub mod backend;
pub mod dag;
pub mod descr;
pub mod error;
pub mod macros;
pub mod node;
pub mod query;
pub mod repo;
pub mod store;
pub mod taskfile;
pub mod template;

pub use backend::{Backend, JobHandle, LocalBackend};
pub use dag::{Dag, DEFAULT_MAX_PROCESSES, DEFAULT_POLL_INTERVAL};
pub use descr::{Descriptor, ParamValue, Params, RunState};
pub use error::{FixSuggestion, RelabError, Result};
pub use node::{Node, NodeId, Payload};
pub use store::{ReadFilter, Store};
pub use taskfile::TaskFile;
pub use template::RefTarget;
