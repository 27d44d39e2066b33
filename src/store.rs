//! On-disk result store
//!
//! Layout, anchored at the repository root:
//!
//! ```text
//! results/<hsh>/descr   persisted descriptor
//! results/<hsh>/log     tee'd stdout+stderr of the job
//! exp/<hsh>/            ephemeral scratch checkout
//! .exp/tasks/<id>/      archived task files
//! ```
//!
//! `results/` is permanent and content-addressed; `exp/` exists only while
//! a job runs. Descriptor writes go through a temp file in the same
//! directory followed by a rename, so a crash never leaves a half-written
//! record behind.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::descr::{Descriptor, DESCR_FILE};
use crate::error::{RelabError, Result};
use crate::repo;

pub const RESULTS_PATH: &str = "results";
pub const EXP_PATH: &str = "exp";
pub const DOT_DIR: &str = ".exp";
pub const TASKS_PATH: &str = "tasks";

/// Which descriptors `read_all` should keep
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFilter {
    /// Keep VIRGIN / RUNNING entries
    pub keep_unfinished: bool,
    /// Keep FAIL entries
    pub keep_failed: bool,
    /// Keep entries whose transitive dependencies are missing or not SUCCESS
    pub keep_broken_deps: bool,
}

impl ReadFilter {
    /// Everything on disk, regardless of state
    pub fn everything() -> Self {
        ReadFilter {
            keep_unfinished: true,
            keep_failed: true,
            keep_broken_deps: true,
        }
    }
}

/// Handle on the store directory hierarchy
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open the store of the repository enclosing the current directory
    pub fn open() -> Result<Self> {
        Ok(Store { root: repo::root()? })
    }

    /// Store anchored at an explicit root (tests, mostly)
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_root(&self) -> PathBuf {
        self.root.join(RESULTS_PATH)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(EXP_PATH)
    }

    pub fn tasks_root(&self) -> PathBuf {
        self.root.join(DOT_DIR).join(TASKS_PATH)
    }

    /// `results/<hsh>/`
    pub fn results_dir(&self, hsh: &str) -> PathBuf {
        self.results_root().join(hsh)
    }

    /// `exp/<hsh>/`
    pub fn scratch_dir(&self, hsh: &str) -> PathBuf {
        self.scratch_root().join(hsh)
    }

    pub fn descr_path(&self, hsh: &str) -> PathBuf {
        self.results_dir(hsh).join(DESCR_FILE)
    }

    pub fn log_path(&self, hsh: &str) -> PathBuf {
        self.results_dir(hsh).join("log")
    }

    /// Load the descriptor for `hsh`, distinguishing "not present" from
    /// "present but unreadable": the latter means the store is corrupt and
    /// must never be treated as a cache miss.
    pub fn load_descr(&self, hsh: &str) -> Result<Option<Descriptor>> {
        let path = self.descr_path(hsh);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let descr = serde_yaml::from_str(&text).map_err(|source| {
            RelabError::CorruptDescriptor {
                hsh: hsh.to_string(),
                source,
            }
        })?;
        Ok(Some(descr))
    }

    /// Persist a descriptor atomically: temp file in the results directory,
    /// then rename over `descr`.
    pub fn save_descr(&self, hsh: &str, descr: &Descriptor) -> Result<()> {
        let dir = self.results_dir(hsh);
        fs::create_dir_all(&dir)?;
        let mut record = serde_yaml::to_string(descr)?;
        if !record.ends_with('\n') {
            record.push('\n');
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(record.as_bytes())?;
        tmp.persist(dir.join(DESCR_FILE))
            .map_err(|e| RelabError::Io(e.error))?;
        debug!(hsh, "descriptor saved");
        Ok(())
    }

    /// Has this experiment already been run to completion?
    ///
    /// A parseable descriptor alone is not enough: only `SUCCESS` counts as
    /// prior completion. Corruption still propagates as an error.
    pub fn handle_existing(&self, hsh: &str) -> Result<bool> {
        Ok(self.load_descr(hsh)?.is_some_and(|d| d.is_success()))
    }

    /// Remove `results/<hsh>/` entirely
    pub fn purge(&self, hsh: &str) -> Result<()> {
        let dir = self.results_dir(hsh);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Remove `exp/<hsh>/`; fine to call when it does not exist
    pub fn cleanup_scratch(&self, hsh: &str) -> Result<()> {
        let dir = self.scratch_dir(hsh);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Load every persisted descriptor passing `filter`, sorted by hash.
    ///
    /// Corruption anywhere in the store aborts the scan with the offending
    /// hash in the error.
    pub fn read_all(&self, filter: ReadFilter) -> Result<Vec<(String, Descriptor)>> {
        let results = self.results_root();
        let entries = match fs::read_dir(&results) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let hsh = entry.file_name().to_string_lossy().to_string();
            let Some(descr) = self.load_descr(&hsh)? else {
                warn!(%hsh, "results directory without a descriptor, skipping");
                continue;
            };
            let wanted = descr.is_success()
                || (descr.is_failure() && filter.keep_failed)
                || (!descr.run_state.is_terminal() && filter.keep_unfinished);
            if !wanted {
                continue;
            }
            if !filter.keep_broken_deps && self.broken_deps(&descr) {
                continue;
            }
            out.push((hsh, descr));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Copy a prior result tree into `dst_hsh`'s results directory,
    /// everything except the descriptor record itself.
    pub fn import_results(&self, src_hsh: &str, dst_hsh: &str) -> Result<()> {
        let src = self.results_dir(src_hsh);
        if !src.is_dir() {
            return Err(RelabError::NoMatch {
                query: src_hsh.to_string(),
            });
        }
        let dst = self.results_dir(dst_hsh);
        fs::create_dir_all(&dst)?;
        for entry in fs::read_dir(&src)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy() == DESCR_FILE {
                continue;
            }
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    }

    /// Does any transitive dependency fail to resolve to a SUCCESS
    /// descriptor? Missing and corrupt dependency records both count as
    /// broken here.
    pub fn broken_deps(&self, descr: &Descriptor) -> bool {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = descr.deps.iter().cloned().collect();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            match self.load_descr(&dep) {
                Ok(Some(d)) if d.is_success() => {
                    stack.extend(d.deps.iter().cloned());
                }
                Ok(Some(_)) | Ok(None) | Err(_) => return true,
            }
        }
        false
    }
}

fn copy_recursively(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descr::{Params, RunState};

    fn store() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::at(tmp.path());
        (tmp, store)
    }

    fn descr(state: RunState) -> Descriptor {
        let mut d = Descriptor::new("demo", ".", "c0ffee", Params::new());
        d.run_state = state;
        d
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (_tmp, store) = store();
        let d = descr(RunState::Success);
        store.save_descr("aaaa", &d).unwrap();
        let back = store.load_descr("aaaa").unwrap().unwrap();
        assert_eq!(back.description, "demo");
        assert!(back.is_success());
    }

    #[test]
    fn absent_descriptor_is_none() {
        let (_tmp, store) = store();
        assert!(store.load_descr("ffff").unwrap().is_none());
    }

    #[test]
    fn corrupt_descriptor_is_an_error_not_absent() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.results_dir("bbbb")).unwrap();
        fs::write(store.descr_path("bbbb"), "{not: [valid").unwrap();
        match store.load_descr("bbbb") {
            Err(RelabError::CorruptDescriptor { hsh, .. }) => assert_eq!(hsh, "bbbb"),
            other => panic!("expected CorruptDescriptor, got {other:?}"),
        }
    }

    #[test]
    fn descriptor_file_ends_with_newline() {
        let (_tmp, store) = store();
        store.save_descr("aaaa", &descr(RunState::Virgin)).unwrap();
        let text = fs::read_to_string(store.descr_path("aaaa")).unwrap();
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn save_overwrites_atomically() {
        let (_tmp, store) = store();
        store.save_descr("aaaa", &descr(RunState::Virgin)).unwrap();
        store.save_descr("aaaa", &descr(RunState::Success)).unwrap();
        let back = store.load_descr("aaaa").unwrap().unwrap();
        assert!(back.is_success());
        // temp file must not linger next to the record
        let names: Vec<_> = fs::read_dir(store.results_dir("aaaa"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![DESCR_FILE.to_string()]);
    }

    #[test]
    fn handle_existing_requires_success() {
        let (_tmp, store) = store();
        store.save_descr("aaaa", &descr(RunState::Virgin)).unwrap();
        assert!(!store.handle_existing("aaaa").unwrap());
        store.save_descr("aaaa", &descr(RunState::Success)).unwrap();
        assert!(store.handle_existing("aaaa").unwrap());
        assert!(!store.handle_existing("cccc").unwrap());
    }

    #[test]
    fn purge_removes_results() {
        let (_tmp, store) = store();
        store.save_descr("aaaa", &descr(RunState::Success)).unwrap();
        store.purge("aaaa").unwrap();
        assert!(!store.results_dir("aaaa").exists());
        // and again, on nothing
        store.purge("aaaa").unwrap();
    }

    #[test]
    fn cleanup_scratch_is_idempotent() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.scratch_dir("aaaa")).unwrap();
        store.cleanup_scratch("aaaa").unwrap();
        assert!(!store.scratch_dir("aaaa").exists());
        store.cleanup_scratch("aaaa").unwrap();
    }

    #[test]
    fn read_all_filters_by_state() {
        let (_tmp, store) = store();
        store.save_descr("aaaa", &descr(RunState::Success)).unwrap();
        store.save_descr("bbbb", &descr(RunState::Fail)).unwrap();
        store.save_descr("cccc", &descr(RunState::Virgin)).unwrap();

        let default = store.read_all(ReadFilter::default()).unwrap();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].0, "aaaa");

        let everything = store.read_all(ReadFilter::everything()).unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn import_copies_everything_but_the_descriptor() {
        let (_tmp, store) = store();
        store.save_descr("srcc", &descr(RunState::Success)).unwrap();
        fs::write(store.results_dir("srcc").join("out"), "42\n").unwrap();
        fs::create_dir_all(store.results_dir("srcc").join("plots")).unwrap();
        fs::write(store.results_dir("srcc").join("plots/p.dat"), "x").unwrap();

        store.import_results("srcc", "dstt").unwrap();
        assert_eq!(
            fs::read_to_string(store.results_dir("dstt").join("out")).unwrap(),
            "42\n"
        );
        assert!(store.results_dir("dstt").join("plots/p.dat").is_file());
        assert!(!store.descr_path("dstt").exists());
    }

    #[test]
    fn import_from_missing_source_fails() {
        let (_tmp, store) = store();
        assert!(store.import_results("nope", "dstt").is_err());
    }

    #[test]
    fn broken_deps_walks_transitively() {
        let (_tmp, store) = store();
        let mut leaf = descr(RunState::Success);
        leaf.deps.insert("gone".into());
        store.save_descr("leaf", &leaf).unwrap();

        let mut top = descr(RunState::Success);
        top.deps.insert("leaf".into());
        store.save_descr("top", &top).unwrap();

        assert!(store.broken_deps(store.load_descr("top").unwrap().as_ref().unwrap()));

        // heal the chain
        store.save_descr("gone", &descr(RunState::Success)).unwrap();
        assert!(!store.broken_deps(store.load_descr("top").unwrap().as_ref().unwrap()));
    }
}
