//! Task files: parsing, archiving, replay
//!
//! A task file describes a set of experiments and their dependencies as
//! groups of lines:
//!
//! ```text
//! ./train.sh {:rate} {prep}/data > {}/out
//!     "train"
//!     mybranch
//!     rate = [0.1, 0.5], epochs = 20
//!     {"prep"}
//! ```
//!
//! The first line of a group is the command (leading `@` marks a macro
//! call); the indented lines carry the quoted description, an optional
//! commit expression, parameter lines and dependency lines. A list-valued
//! parameter fans the group out into one node per value, cartesian across
//! lists. Dependency entries name previously defined groups: `"desc"`
//! depends on one node of the group (fanning out per node when the group
//! has several), `"desc" [all]` depends on every node at once, and a bare
//! name defers to a string parameter holding the description.
//!
//! Submitted task files are archived under `.exp/tasks/<id>/` together with
//! the commit in effect, so `runtask <id>` replays them against the exact
//! code they were submitted with.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dag::Dag;
use crate::descr::{ParamValue, Params};
use crate::error::{RelabError, Result};
use crate::node::{Node, NodeId};
use crate::store::Store;

/// Companion record archived next to a task file
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub filename: String,
    pub commit: String,
}

const TASK_COMMIT_FILE: &str = "commit";

/// One dependency entry of a group
#[derive(Debug, Clone, PartialEq)]
struct DepRef {
    description: String,
    /// `[all]`: depend on every node of the group at once
    all: bool,
}

/// One parsed experiment group
#[derive(Debug)]
struct Group {
    command: String,
    description: String,
    commit: String,
    params: Params,
    deps: Vec<DepRef>,
    line: usize,
}

/// A parsed task file
#[derive(Debug)]
pub struct TaskFile {
    groups: Vec<Group>,
    file: String,
}

impl TaskFile {
    /// Parse the file at `path`.
    pub fn parse(path: &Path) -> Result<TaskFile> {
        let text = fs::read_to_string(path)?;
        Self::parse_str(&text, &path.display().to_string())
    }

    /// Parse task text, with `file` used in error positions.
    pub fn parse_str(text: &str, file: &str) -> Result<TaskFile> {
        let err = |line: usize, details: String| RelabError::TaskFile {
            file: file.to_string(),
            line,
            details,
        };

        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }

            if !raw.starts_with('\t') && !raw.starts_with(' ') {
                // a new group begins; the previous one is complete
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                current = Some(Group {
                    command: raw.trim().to_string(),
                    description: String::new(),
                    commit: "HEAD".to_string(),
                    params: Params::new(),
                    deps: Vec::new(),
                    line: line_no,
                });
                continue;
            }

            let group = current.as_mut().ok_or_else(|| {
                err(line_no, "indented line before any command".to_string())
            })?;
            let body = raw.trim();

            if group.description.is_empty() {
                let desc = body
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .ok_or_else(|| {
                        err(
                            line_no,
                            "the first line after each command must be the description, \
                             enclosed in double quotation marks"
                                .to_string(),
                        )
                    })?;
                group.description = desc.trim().to_string();
            } else if body.starts_with('{') {
                let deps = parse_dep_line(body).map_err(|d| err(line_no, d))?;
                group.deps.extend(deps);
            } else if body.contains('=') {
                parse_param_line(body, &mut group.params).map_err(|d| err(line_no, d))?;
            } else if group.params.is_empty() && group.deps.is_empty() {
                group.commit = body.to_string();
            } else {
                return Err(err(
                    line_no,
                    format!("unexpected line in group '{}'", group.description),
                ));
            }
        }
        if let Some(group) = current.take() {
            groups.push(group);
        }

        // every group needs a description; dependency targets must be
        // defined earlier in the file
        for (i, group) in groups.iter().enumerate() {
            if group.description.is_empty() {
                return Err(err(group.line, "group has no description line".to_string()));
            }
            for dep in &group.deps {
                let is_param = group
                    .params
                    .get(&dep.description)
                    .and_then(ParamValue::as_str)
                    .is_some();
                let target = if is_param {
                    group.params[&dep.description].to_string()
                } else {
                    dep.description.clone()
                };
                if !groups[..i].iter().any(|g| g.description == target) {
                    return Err(err(
                        group.line,
                        format!("dependency '{target}' has not been previously defined"),
                    ));
                }
            }
        }

        Ok(TaskFile {
            groups,
            file: file.to_string(),
        })
    }

    /// Instantiate the task into `dag`, fanning out list parameters and
    /// multi-node dependencies. Groups whose commit is `HEAD` get pinned to
    /// `default_commit` when given (submission or replay time).
    pub fn build_dag(&self, dag: &mut Dag, default_commit: Option<&str>) -> Result<()> {
        // description -> node ids, in definition order
        let mut by_description: Vec<(String, Vec<NodeId>)> = Vec::new();

        for group in &self.groups {
            let commit = match (group.commit.as_str(), default_commit) {
                ("HEAD", Some(pinned)) => pinned.to_string(),
                (other, _) => other.to_string(),
            };

            // resolve parameter-valued dependencies to their group names
            let mut dep_names: Vec<DepRef> = Vec::new();
            for dep in &group.deps {
                let target = match group.params.get(&dep.description).and_then(ParamValue::as_str)
                {
                    Some(name) => name.to_string(),
                    None => dep.description.clone(),
                };
                dep_names.push(DepRef {
                    description: target,
                    all: dep.all,
                });
            }

            // choices per dependency: [all] and single-node groups yield a
            // single choice, multi-node groups fan the child out per node
            let mut dep_choices: Vec<Vec<Vec<NodeId>>> = Vec::new();
            for dep in &dep_names {
                let ids = by_description
                    .iter()
                    .find(|(d, _)| *d == dep.description)
                    .map(|(_, ids)| ids.clone())
                    .ok_or_else(|| RelabError::TaskFile {
                        file: self.file.clone(),
                        line: group.line,
                        details: format!(
                            "dependency '{}' has not been previously defined",
                            dep.description
                        ),
                    })?;
                if dep.all || ids.len() == 1 {
                    dep_choices.push(vec![ids]);
                } else {
                    dep_choices.push(ids.into_iter().map(|id| vec![id]).collect());
                }
            }

            let assignments = param_assignments(&group.params);
            let parent_sets = cartesian(&dep_choices);

            let mut created = Vec::new();
            for params in &assignments {
                for parent_set in &parent_sets {
                    let (command, code) = match group.command.strip_prefix('@') {
                        Some(code) => (None, Some(code.to_string())),
                        None => (Some(group.command.clone()), None),
                    };
                    let node = Node::new(
                        group.description.clone(),
                        commit.clone(),
                        command,
                        code,
                        params.clone(),
                    )?;
                    let id = dag.add_node(node);
                    for parents in parent_set {
                        for &parent in parents {
                            dag.add_edge(parent, id);
                        }
                    }
                    created.push(id);
                }
            }
            by_description.push((group.description.clone(), created));
        }
        Ok(())
    }
}

/// Expand list-valued parameters into one scalar assignment per
/// combination, cartesian across lists, keys in sorted order.
fn param_assignments(params: &Params) -> Vec<Params> {
    let value_lists: Vec<(&String, Vec<ParamValue>)> = params
        .iter()
        .map(|(k, v)| match v {
            ParamValue::List(items) => (k, items.clone()),
            scalar => (k, vec![scalar.clone()]),
        })
        .collect();

    let mut assignments = vec![Params::new()];
    for (key, values) in value_lists {
        let mut next = Vec::with_capacity(assignments.len() * values.len());
        for assignment in &assignments {
            for value in &values {
                let mut extended = assignment.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        assignments = next;
    }
    assignments
}

fn cartesian<T: Clone>(lists: &[Vec<T>]) -> Vec<Vec<T>> {
    let mut acc: Vec<Vec<T>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(acc.len() * list.len().max(1));
        for combo in &acc {
            for item in list {
                let mut extended = combo.clone();
                extended.push(item.clone());
                next.push(extended);
            }
        }
        acc = next;
    }
    acc
}

/// `k = v, k2 = [a, b], ...`
fn parse_param_line(body: &str, params: &mut Params) -> std::result::Result<(), String> {
    for entry in split_entries(body) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected 'name = value', got '{entry}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("parameter with empty name in '{entry}'"));
        }
        params.insert(key.to_string(), parse_value(value.trim())?);
    }
    Ok(())
}

/// Parse one literal parameter value: int, float, quoted string, `[list]`,
/// or a bare word taken as a string.
pub fn parse_value(text: &str) -> std::result::Result<ParamValue, String> {
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let mut items = Vec::new();
        for piece in split_entries(inner) {
            let piece = piece.trim();
            if !piece.is_empty() {
                items.push(parse_value(piece)?);
            }
        }
        return Ok(ParamValue::List(items));
    }
    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
    {
        return Ok(ParamValue::Str(inner.to_string()));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(ParamValue::Int(i));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Ok(ParamValue::Float(f));
    }
    // bare word, taken as a string
    Ok(ParamValue::Str(text.to_string()))
}

/// `{"dep", "dep2" [all], pname}`
fn parse_dep_line(body: &str) -> std::result::Result<Vec<DepRef>, String> {
    let inner = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .ok_or_else(|| format!("dependency line must be enclosed in braces: '{body}'"))?;

    let mut deps = Vec::new();
    for entry in split_entries(inner) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name_part, all) = match entry.strip_suffix("[all]") {
            Some(rest) => (rest.trim(), true),
            None => (entry, false),
        };
        let description = name_part
            .strip_prefix('"')
            .and_then(|n| n.strip_suffix('"'))
            .unwrap_or(name_part)
            .trim()
            .to_string();
        if description.is_empty() {
            return Err(format!("empty dependency entry in '{body}'"));
        }
        deps.push(DepRef { description, all });
    }
    Ok(deps)
}

/// Split on commas outside quotes and square brackets
fn split_entries(body: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in body.chars() {
        match c {
            '\'' | '"' => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    _ => {}
                }
                current.push(c);
            }
            '[' if quote.is_none() => {
                depth += 1;
                current.push(c);
            }
            ']' if quote.is_none() => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if quote.is_none() && depth == 0 => {
                pieces.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Archive a task file and the commit in effect under `.exp/tasks/<id>/`,
/// `<id>` being the smallest positive integer not yet used.
pub fn save_task(store: &Store, path: &Path, commit: &str) -> Result<u64> {
    let tasks = store.tasks_root();
    fs::create_dir_all(&tasks)?;

    let used: std::collections::BTreeSet<u64> = fs::read_dir(&tasks)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
        .collect();
    let task_id = (1..).find(|id| !used.contains(id)).expect("unbounded range");

    let task_dir = tasks.join(task_id.to_string());
    fs::create_dir(&task_dir)?;

    let filename = path
        .file_name()
        .ok_or_else(|| RelabError::TaskFile {
            file: path.display().to_string(),
            line: 0,
            details: "not a file".to_string(),
        })?
        .to_string_lossy()
        .to_string();
    fs::copy(path, task_dir.join(&filename))?;

    let record = TaskRecord {
        filename,
        commit: commit.to_string(),
    };
    let mut text = serde_yaml::to_string(&record)?;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    fs::write(task_dir.join(TASK_COMMIT_FILE), text)?;

    info!(task_id, "task archived");
    Ok(task_id)
}

/// Load an archived task: the path of the stored file and the commit to
/// pin `HEAD` nodes to.
pub fn load_task(store: &Store, task_id: u64) -> Result<(PathBuf, String)> {
    let task_dir = store.tasks_root().join(task_id.to_string());
    let record_path = task_dir.join(TASK_COMMIT_FILE);
    let text = fs::read_to_string(&record_path).map_err(|_| RelabError::TaskNotFound {
        task_id: task_id.to_string(),
    })?;
    let record: TaskRecord = serde_yaml::from_str(&text)?;
    Ok((task_dir.join(&record.filename), record.commit))
}
