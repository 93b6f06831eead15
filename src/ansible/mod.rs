//! Playbook invocation against a chroot tree.
//!
//! The customization stage hands the tree to Ansible through a generated
//! inventory that names the directory as a chroot connection target (a local
//! directory, not a live host), with descriptor fields exposed as connection
//! variables for the playbook to use. A minimal `ansible.cfg` points at that
//! inventory and the tool is invoked once per call; parsing of its output
//! lives in [`report`].
//!
//! The generated files land in a scoped work directory: a fresh temporary
//! directory removed on every exit path, or the descriptor's persistent
//! automation directory when one was configured.

pub mod report;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::descriptor::BuildDescriptor;
use crate::error::{IoContext, Result};
use crate::process::Cmd;
use crate::workdir::WorkDir;
use report::{RunReport, TaskStatus};

/// Runs the descriptor's playbook against a tree.
pub struct PlaybookRunner<'a> {
    desc: &'a BuildDescriptor,
}

impl<'a> PlaybookRunner<'a> {
    pub fn new(desc: &'a BuildDescriptor) -> Self {
        Self { desc }
    }

    /// Run the playbook once against `dest` and parse its report.
    ///
    /// `verbose` raises the tool's own verbosity; the diagnostic rerun uses
    /// it to surface per-task detail the normal run keeps quiet.
    pub fn run(&self, dest: &Path, verbose: bool) -> Result<RunReport> {
        let workdir = WorkDir::new(self.desc.ansible_dir())?;
        let inventory = write_inventory(workdir.path(), self.desc, dest)?;
        let config = write_config(workdir.path(), &inventory)?;

        let playbook = std::path::absolute(self.desc.playbook())
            .io_context(|| format!("resolving playbook '{}'", self.desc.playbook()))?;

        let output = Cmd::new("ansible-playbook")
            .eatmydata()
            .arg(if verbose { "-vvv" } else { "-v" })
            .arg(&playbook)
            .env("ANSIBLE_CONFIG", &config)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .output()?;

        if !output.status.success() {
            warn!(status = %output.status, "ansible-playbook exited unsuccessfully");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = report::parse(&stdout).map_err(|err| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
                warn!(line, "ansible-playbook stderr");
            }
            err
        })?;

        log_outcomes(&report);
        Ok(report)
    }
}

fn log_outcomes(report: &RunReport) {
    for outcome in &report.outcomes {
        if outcome.status == TaskStatus::Ok {
            info!(task = %outcome.task, "ok");
            continue;
        }
        warn!(
            task = %outcome.task,
            host = %outcome.host,
            status = outcome.status.as_str(),
            "task did not complete cleanly"
        );
        for key in ["stdout", "stderr", "msg"] {
            if let Some(text) = outcome.detail.get(key).and_then(|v| v.as_str()) {
                for line in text.lines() {
                    warn!(%key, line, "task detail");
                }
            }
        }
    }
}

/// Write the inventory naming `dest` as the only customization target.
fn write_inventory(dir: &Path, desc: &BuildDescriptor, dest: &Path) -> Result<PathBuf> {
    let path = dir.join("inventory.ini");
    let target = std::path::absolute(dest)
        .io_context(|| format!("resolving target tree '{}'", dest.display()))?;

    let mut line = format!("{} ansible_connection=chroot", target.display());
    for (key, value) in desc.connection_vars() {
        line.push_str(&format!(" {key}={value}"));
    }

    fs::write(&path, format!("[live]\n{line}\n"))
        .io_context(|| format!("writing inventory '{}'", path.display()))?;
    debug!(inventory = %path.display(), "wrote inventory");
    Ok(path)
}

/// Write the tool configuration pointing at the generated inventory.
fn write_config(dir: &Path, inventory: &Path) -> Result<PathBuf> {
    let path = dir.join("ansible.cfg");
    let inventory = std::path::absolute(inventory)
        .io_context(|| format!("resolving inventory '{}'", inventory.display()))?;
    fs::write(
        &path,
        format!("[defaults]\nnocows = 1\ninventory = {}\n", inventory.display()),
    )
    .io_context(|| format!("writing tool configuration '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor() -> BuildDescriptor {
        BuildDescriptor::builder()
            .distribution("bookworm")
            .architecture("amd64")
            .build_mirror("http://example/deb")
            .kernel_package("linux-image-amd64")
            .build()
            .unwrap()
    }

    #[test]
    fn inventory_names_the_tree_as_chroot_target() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("chroot");
        fs::create_dir_all(&dest).unwrap();

        let desc = descriptor();
        let path = write_inventory(tmp.path(), &desc, &dest).unwrap();
        let contents = fs::read_to_string(path).unwrap();

        assert!(contents.starts_with("[live]\n"));
        assert!(contents.contains("ansible_connection=chroot"));
        assert!(contents.contains(&dest.display().to_string()));
        assert!(contents.contains("distribution=bookworm"));
        assert!(contents.contains("architecture=amd64"));
        assert!(contents.contains("build_mirror=http://example/deb"));
        assert!(contents.contains("kernel_package=linux-image-amd64"));
        // The package list and cache directory stay out of the inventory.
        assert!(!contents.contains("packages="));
        assert!(!contents.contains("cache_dir="));
    }

    #[test]
    fn config_points_at_inventory() {
        let tmp = TempDir::new().unwrap();
        let desc = descriptor();
        let dest = tmp.path().join("chroot");
        fs::create_dir_all(&dest).unwrap();

        let inventory = write_inventory(tmp.path(), &desc, &dest).unwrap();
        let config = write_config(tmp.path(), &inventory).unwrap();
        let contents = fs::read_to_string(config).unwrap();

        assert!(contents.starts_with("[defaults]\n"));
        assert!(contents.contains("nocows = 1"));
        assert!(contents.contains(&format!("inventory = {}", inventory.display())));
    }
}
