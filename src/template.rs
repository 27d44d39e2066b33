//! Template engine
//!
//! Expands the reference syntax of command strings against a node's
//! parameters and its candidate targets (parents during a run, the whole
//! store for `cmd`/`print`):
//!
//! | pattern        | meaning                                              |
//! |----------------|------------------------------------------------------|
//! | `{}`           | output slot, left literal for the identity pass      |
//! | `{:name}`      | value of parameter `name`                            |
//! | `{desc}`       | results path of the target matching `desc`           |
//! | `{desc:p1,p2}` | as above, filtered on this node's values of `p1,p2`  |
//! | `[name]`       | parameter substitution that survives brace collisions|
//!
//! The experiment hash itself is never inserted here: identity is computed
//! from the output of this pass, so the output slot must stay symbolic.

use std::collections::BTreeSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

use crate::descr::{ParamValue, Params};
use crate::error::{RelabError, Result};

static BRACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").expect("brace pattern"));
static SQUARE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(.*?)\]").expect("square pattern"));

/// One candidate an in-command reference can resolve to
#[derive(Debug, Clone)]
pub struct RefTarget {
    pub hsh: String,
    pub description: String,
    pub params: Params,
    /// Submission time; ties between matches go to the most recent
    pub date: f64,
}

/// Result of expanding one command string
#[derive(Debug)]
pub struct Expansion {
    /// Command with references resolved; `{}` still literal
    pub text: String,
    /// Hashes of every target a reference resolved to, in order of use
    pub deps: Vec<String>,
    /// Declared parameters the command never mentioned
    pub unused: Vec<String>,
}

/// Expand `cmd` against `params` and `targets`.
///
/// Matched references substitute the target's results directory beneath
/// `results_root`. Unmatched references and undeclared parameters are
/// errors; unused parameters only warn (inherited `parent:key` entries are
/// lineage bookkeeping and exempt).
pub fn expand_command(
    cmd: &str,
    params: &Params,
    targets: &[RefTarget],
    results_root: &Path,
) -> Result<Expansion> {
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut deps: Vec<String> = Vec::new();

    // pass 1: square-bracket parameters
    let cmd = replace_fallible(&SQUARE_RE, cmd, |caps| {
        lookup_param(params, &caps[1], &mut used)
    })?;

    // pass 2: brace references
    let text = replace_fallible(&BRACE_RE, &cmd, |caps| {
        let inner = &caps[1];
        if inner.is_empty() {
            // output slot: handled once the hash is known
            return Ok("{}".to_string());
        }
        if let Some(name) = inner.strip_prefix(':') {
            return lookup_param(params, name, &mut used);
        }

        // parent reference, optionally filtered on shared parameter values
        let query = match inner.split_once(':') {
            Some((desc, names)) => {
                let mut pairs = Vec::new();
                for name in names.split(',') {
                    let name = name.trim();
                    let value = lookup_param(params, name, &mut used)?;
                    pairs.push(format!("{name}={value}"));
                }
                format!("{desc}:{}", pairs.join(","))
            }
            None => inner.to_string(),
        };

        let matches = find(&query, targets);
        let best = matches.first().ok_or_else(|| RelabError::UnmatchedReference {
            reference: inner.to_string(),
        })?;
        if matches.len() > 1 {
            warn!(
                reference = inner,
                count = matches.len(),
                using = %best.hsh,
                "multiple matches for reference, using latest"
            );
        }
        deps.push(best.hsh.clone());
        Ok(results_root.join(&best.hsh).display().to_string())
    })?;

    let unused: Vec<String> = params
        .keys()
        .filter(|name| !used.contains(*name) && !name.contains(':'))
        .cloned()
        .collect();
    if !unused.is_empty() {
        warn!(?unused, "not all parameters were used");
    }

    Ok(Expansion { text, deps, unused })
}

fn lookup_param(params: &Params, name: &str, used: &mut BTreeSet<String>) -> Result<String> {
    let value = params.get(name).ok_or_else(|| RelabError::UnknownParameter {
        name: name.to_string(),
    })?;
    used.insert(name.to_string());
    Ok(value.to_string())
}

/// Find the targets matching `query`, most recent first.
///
/// Tiers, first non-empty wins: exact description with parameter filter
/// (`desc:k=v,...`, numeric-aware), exact description, description prefix,
/// exact hash, hash prefix.
pub fn find<'a>(query: &str, targets: &'a [RefTarget]) -> Vec<&'a RefTarget> {
    let mut matches: Vec<&RefTarget> =
        targets.iter().filter(|t| params_match(t, query)).collect();
    if matches.is_empty() {
        matches = targets.iter().filter(|t| t.description == query).collect();
    }
    if matches.is_empty() {
        matches = targets
            .iter()
            .filter(|t| t.description.starts_with(query))
            .collect();
    }
    if matches.is_empty() {
        matches = targets.iter().filter(|t| t.hsh == query).collect();
    }
    if matches.is_empty() {
        matches = targets.iter().filter(|t| t.hsh.starts_with(query)).collect();
    }
    matches.sort_by(|a, b| b.date.total_cmp(&a.date));
    matches
}

/// `desc:k=v,...` matcher: description equal and every named parameter
/// equal, comparing numerically when both sides are numbers.
fn params_match(target: &RefTarget, query: &str) -> bool {
    let Some((desc, pairs)) = query.split_once(':') else {
        return false;
    };
    if target.description != desc {
        return false;
    }
    pairs.split(',').all(|pair| {
        let Some((key, literal)) = pair.split_once('=') else {
            return false;
        };
        target
            .params
            .get(key.trim())
            .is_some_and(|value| value_matches(value, literal.trim()))
    })
}

fn value_matches(value: &ParamValue, literal: &str) -> bool {
    if let (Some(have), Ok(want)) = (value.as_f64(), literal.parse::<f64>()) {
        return have == want;
    }
    value.to_string() == literal
}

/// `re.replace_all` with a fallible substitution callback
fn replace_fallible(
    re: &Regex,
    input: &str,
    mut subst: impl FnMut(&Captures) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always present");
        out.push_str(&input[last..whole.start()]);
        out.push_str(&subst(&caps)?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
