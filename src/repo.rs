//! Repository utilities
//!
//! Thin wrappers over the external programs the engine relies on
//! (`git rev-parse`, `git archive`, `tar`, `sh`) plus content hashing.
//! Every invocation takes an explicit working directory; nothing here
//! touches the process-wide CWD.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha1::{Digest, Sha1};

use crate::error::{RelabError, Result};

/// SHA1 of a string, hex-encoded. The basis of node identity.
pub fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Absolute path of the repository root enclosing the current directory.
pub fn root() -> Result<PathBuf> {
    let out = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()?;
    if !out.status.success() {
        return Err(RelabError::NoRepository {
            details: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(PathBuf::from(
        String::from_utf8_lossy(&out.stdout).trim().to_string(),
    ))
}

/// Working directory of the current process relative to the repository
/// root; `"."` at the root itself.
pub fn working_dir(root: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| cwd.strip_prefix(root).map(Path::to_path_buf).ok())
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|| ".".to_string())
}

/// Resolve a commit expression (branch, tag, `HEAD`, short hash, ...) to a
/// full SHA.
pub fn rev_parse(root: &Path, expr: &str) -> Result<String> {
    let out = Command::new("git")
        .args(["rev-parse", expr])
        .current_dir(root)
        .output()?;
    if !out.status.success() {
        return Err(RelabError::Git {
            operation: format!("rev-parse {expr}"),
            details: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Check out `commit` into `dest` with `git archive <commit> <subpath> | tar -x`.
///
/// `git archive` resolves paths against its working directory, so it runs
/// from the repository root. `git --work-tree=... checkout` would also work
/// but cannot run concurrently for several jobs.
pub fn archive_into(root: &Path, commit: &str, subpath: &str, dest: &Path) -> Result<()> {
    let mut archive = Command::new("git")
        .args(["archive", commit, subpath])
        .current_dir(root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let archive_out = archive.stdout.take().expect("stdout was piped");
    let tar_status = Command::new("tar")
        .arg("-x")
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::from(archive_out))
        .status()?;
    let archive_status = archive.wait()?;

    if !archive_status.success() || !tar_status.success() {
        return Err(RelabError::Git {
            operation: format!("archive {commit}"),
            details: format!(
                "git archive exited {archive_status}, tar exited {tar_status}"
            ),
        });
    }
    Ok(())
}

/// Run a command line through the shell in `dir`, returning its exit code.
pub fn exec_shell(cmd: &str, dir: &Path) -> Result<i32> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .status()?;
    Ok(status.code().unwrap_or(-1))
}

/// Is `token` resolvable as an executable for a job running in `job_dir`?
///
/// A token containing a path separator must exist relative to the job
/// directory (or absolutely). A bare token may also be found on `PATH`,
/// which the launcher augments with the job directory.
pub fn resolves_as_binary(token: &str, job_dir: &Path) -> bool {
    let candidate = Path::new(token);
    if candidate.is_absolute() {
        return candidate.is_file();
    }
    if job_dir.join(candidate).is_file() {
        return true;
    }
    if token.contains('/') {
        return false;
    }
    std::env::var_os("PATH")
        .map(|path| {
            std::env::split_paths(&path).any(|dir| dir.join(token).is_file())
        })
        .unwrap_or(false)
}
