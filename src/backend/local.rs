//! Local process backend
//!
//! Writes a small shell driver into the scratch workspace, launches it as a
//! child process and polls it with a non-blocking wait. The driver appends
//! the command's exit status as the last line of the job log, so the final
//! verdict can be read back from the log and cross-checked against the
//! child's own exit code.

use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use tracing::{debug, info, warn};

use crate::descr::RunState;
use crate::error::{RelabError, Result};
use crate::node::Node;

use super::{Backend, JobHandle};

/// Backend running jobs as supervised OS processes
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        LocalBackend
    }
}

impl Backend for LocalBackend {
    fn run(&self, node: &Node) -> Result<Box<dyn JobHandle>> {
        let job_dir = node.job_dir();
        let log_path = node.results_dir.join("log");

        let script_path = node.scratch_dir.join(format!("{}.sh", node.hsh));
        fs::write(&script_path, driver_script(node))?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))?;

        info!(hsh = %node.hsh, command = %node.final_text, "running command");
        let child = Command::new("bash")
            .arg(&script_path)
            .current_dir(&job_dir)
            .spawn()
            .map_err(|e| RelabError::Workspace {
                path: job_dir.clone(),
                details: e.to_string(),
            })?;

        Ok(Box::new(LocalJob { child, log_path }))
    }
}

/// The driver exports the job environment, runs the final command and
/// records the exit status at the end of the log.
fn driver_script(node: &Node) -> String {
    let mut script = String::from("#!/bin/bash\n");
    // the final command pipes into tee; without pipefail the pipeline
    // status would be tee's, never the command's
    script.push_str("set -o pipefail\n");
    script.push_str(&format!(
        "export PATH=\"{}:$PATH\"\n",
        node.job_dir().display()
    ));
    script.push_str(&format!(
        "export EXP_RESULTS_DIR=\"{}\"\n",
        node.results_dir.display()
    ));
    if let Some(parent_dir) = &node.parent_results_dir {
        script.push_str(&format!(
            "export EXP_PARENT_RESULTS_DIR=\"{}\"\n",
            parent_dir.display()
        ));
    }
    script.push_str(&node.final_text);
    script.push('\n');
    script.push_str("status=$?\n");
    script.push_str(&format!(
        "echo $status >> \"{}\"\n",
        node.results_dir.join("log").display()
    ));
    script.push_str("exit $status\n");
    script
}

struct LocalJob {
    child: Child,
    log_path: PathBuf,
}

impl JobHandle for LocalJob {
    fn poll(&mut self) -> Result<(RunState, Option<i32>)> {
        let Some(status) = self.child.try_wait()? else {
            return Ok((RunState::Running, None));
        };
        let child_code = status.code().unwrap_or(-1);
        debug!(code = child_code, "job exited");

        // the driver appended the command's status as the last log line
        let code = match last_log_line(&self.log_path) {
            Some(line) => match line.trim().parse::<i32>() {
                Ok(logged) => {
                    if logged != child_code {
                        warn!(
                            logged,
                            child_code, "log status disagrees with driver exit code"
                        );
                    }
                    logged
                }
                Err(_) => child_code,
            },
            None => child_code,
        };

        if code == 0 {
            Ok((RunState::Success, Some(0)))
        } else {
            Ok((RunState::Fail, Some(code)))
        }
    }
}

fn last_log_line(path: &std::path::Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter(|l| !l.trim().is_empty())
        .last()
}
