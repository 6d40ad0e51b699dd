use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use sysinfo::Disks;

use super::probe::Probe;

const PROBE_FILE: &str = ".silvasonic-probe";

/// Liveness heuristic for the capture pipeline: the workspace exists, takes
/// writes, and its disk has room for more audio.
pub struct RecordingProbe {
    workspace: PathBuf,
    min_free_bytes: u64,
}

impl RecordingProbe {
    pub fn new(workspace: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            workspace: workspace.into(),
            min_free_bytes,
        }
    }
}

#[rocket::async_trait]
impl Probe for RecordingProbe {
    fn component(&self) -> &str {
        "recording"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn check(&self) -> anyhow::Result<String> {
        let workspace = self.workspace.clone();
        let min_free_bytes = self.min_free_bytes;

        tokio::task::spawn_blocking(move || check_workspace(&workspace, min_free_bytes))
            .await
            .context("recording check did not complete")?
            .context("Recording failed")?;

        Ok("Recording active".to_string())
    }
}

fn check_workspace(workspace: &Path, min_free_bytes: u64) -> anyhow::Result<()> {
    let meta = fs::metadata(workspace)
        .with_context(|| format!("workspace {} is missing", workspace.display()))?;
    ensure!(meta.is_dir(), "workspace {} is not a directory", workspace.display());

    let marker = workspace.join(PROBE_FILE);
    fs::write(&marker, b"ok")
        .with_context(|| format!("workspace {} is not writable", workspace.display()))?;
    remove_marker(&marker)?;

    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let free = free_space_for(
        &root,
        disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point(), disk.available_space())),
    );

    // No matching mount (e.g. some container overlays): skip the space check.
    if let Some(free) = free {
        if free < min_free_bytes {
            bail!(
                "only {} MiB free on the workspace disk, need {} MiB",
                free / (1024 * 1024),
                min_free_bytes / (1024 * 1024)
            );
        }
    }
    Ok(())
}

/// A marker that cannot be removed is a writability failure, not litter.
fn remove_marker(marker: &Path) -> anyhow::Result<()> {
    fs::remove_file(marker).with_context(|| format!("cannot remove {} from the workspace", marker.display()))
}

/// Free space of the mount holding `path`: the longest mount point that is
/// a prefix of it.
fn free_space_for<'a, I>(path: &Path, mounts: I) -> Option<u64>
where
    I: IntoIterator<Item = (&'a Path, u64)>,
{
    mounts
        .into_iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, free)| free)
}
