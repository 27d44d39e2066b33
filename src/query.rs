//! Query and report operations over the store
//!
//! Everything here is read-mostly: grouped listings, detailed dumps,
//! hash lookups and purging, plus reference expansion for ad-hoc commands
//! (`cmd` / `print`) where the candidates are the whole store instead of a
//! node's parents.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{Local, TimeZone};

use crate::descr::{Descriptor, Params, RunState};
use crate::error::{RelabError, Result};
use crate::store::{ReadFilter, Store};
use crate::template::{self, RefTarget};

/// Shorten a string for tabular output
fn trunc(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        let cut: String = s.chars().take(n).collect();
        format!("{cut}...")
    }
}

fn format_date(epoch: f64) -> String {
    Local
        .timestamp_opt(epoch as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn targets(entries: &[(String, Descriptor)]) -> Vec<RefTarget> {
    entries
        .iter()
        .map(|(hsh, d)| RefTarget {
            hsh: hsh.clone(),
            description: d.description.clone(),
            params: d.params.clone(),
            date: d.date,
        })
        .collect()
}

/// Stored experiments matching `query`, most recent first.
pub fn find_in_store(store: &Store, query: &str) -> Result<Vec<(String, Descriptor)>> {
    let entries = store.read_all(ReadFilter::everything())?;
    let targets = targets(&entries);
    let matches = template::find(query, &targets);
    if matches.is_empty() {
        return Err(RelabError::NoMatch {
            query: query.to_string(),
        });
    }
    Ok(matches
        .into_iter()
        .map(|t| {
            let descr = entries
                .iter()
                .find(|(h, _)| *h == t.hsh)
                .map(|(_, d)| d.clone())
                .expect("target came from entries");
            (t.hsh.clone(), descr)
        })
        .collect())
}

/// One summary line per description: run count, state tally, latest date.
pub fn list(store: &Store) -> Result<String> {
    let entries = store.read_all(ReadFilter::everything())?;

    let mut groups: BTreeMap<&str, Vec<&(String, Descriptor)>> = BTreeMap::new();
    for entry in &entries {
        groups.entry(&entry.1.description).or_default().push(entry);
    }

    let mut out = String::new();
    for (description, runs) in groups {
        let latest = runs
            .iter()
            .map(|(_, d)| d.date)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut states: BTreeMap<RunState, usize> = BTreeMap::new();
        for (_, d) in &runs {
            *states.entry(d.run_state).or_default() += 1;
        }
        let tally = states
            .iter()
            .map(|(state, n)| format!("{n} {state}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "{}\t{} run(s)\t{}\t{}",
            trunc(description, 30),
            runs.len(),
            format_date(latest),
            tally
        )
        .expect("writing to string");
    }
    Ok(out)
}

/// Full dump of every experiment matching `query`.
pub fn show(store: &Store, query: &str) -> Result<String> {
    let matches = find_in_store(store, query)?;
    let mut out = String::new();
    for (hsh, d) in matches {
        writeln!(out, "{hsh}").expect("writing to string");
        writeln!(out, "  description: {}", d.description).expect("writing to string");
        writeln!(out, "  commit:      {}", trunc(&d.commit, 12)).expect("writing to string");
        writeln!(out, "  date:        {}", format_date(d.date)).expect("writing to string");
        writeln!(out, "  state:       {}", d.run_state).expect("writing to string");
        if let Some(code) = d.return_code {
            writeln!(out, "  return code: {code}").expect("writing to string");
        }
        if let Some(cmd) = &d.command {
            writeln!(out, "  command:     {}", trunc(cmd, 60)).expect("writing to string");
        }
        if let Some(code) = &d.code {
            writeln!(out, "  code:        {}", trunc(code, 60)).expect("writing to string");
        }
        if !d.params.is_empty() {
            let params = d
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "  params:      {params}").expect("writing to string");
        }
        if !d.deps.is_empty() {
            let deps = d
                .deps
                .iter()
                .map(|h| trunc(h, 8))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "  deps:        {deps}").expect("writing to string");
        }
        if store.broken_deps(&d) {
            writeln!(out, "  (broken dependencies)").expect("writing to string");
        }
    }
    Ok(out)
}

/// Hashes matching `query`, most recent first; `latest` keeps only the
/// first.
pub fn hashes(store: &Store, query: &str, latest: bool) -> Result<Vec<String>> {
    let matches = find_in_store(store, query)?;
    let mut hashes: Vec<String> = matches.into_iter().map(|(h, _)| h).collect();
    if latest {
        hashes.truncate(1);
    }
    Ok(hashes)
}

/// Delete matching result trees. Without `all` only the most recent match
/// goes; `dry_run` reports what would be deleted without touching disk.
/// Returns the affected hashes.
pub fn purge(store: &Store, query: &str, all: bool, dry_run: bool) -> Result<Vec<String>> {
    let victims = hashes(store, query, !all)?;
    if !dry_run {
        for hsh in &victims {
            store.purge(hsh)?;
            store.cleanup_scratch(hsh)?;
        }
    }
    Ok(victims)
}

/// Expand references in an ad-hoc command against the whole store.
///
/// Candidates are completed experiments with intact dependencies; the
/// output slot has no meaning here and is left literal.
pub fn expand_against_store(store: &Store, command: &str, params: &Params) -> Result<String> {
    let entries = store.read_all(ReadFilter::default())?;
    let targets = targets(&entries);
    let expansion =
        template::expand_command(command, params, &targets, &store.results_root())?;
    Ok(expansion.text)
}
