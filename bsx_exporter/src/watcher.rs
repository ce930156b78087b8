//! Mapping file hot reload.
//!
//! The parent directory is watched rather than the file itself so that
//! editors replacing the file through a rename keep triggering reloads.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bsx_core::TubeMapper;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Quiet period after the first event, so a truncate-then-write sequence
/// ends in a single reload of the final content.
const SETTLE: Duration = Duration::from_millis(100);

pub struct MappingWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl MappingWatcher {
    /// Watch `path` and reload `mapper` whenever the file changes.
    pub fn start(path: impl Into<PathBuf>, mapper: Arc<TubeMapper>) -> notify::Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| notify::Error::generic("mapping config path has no file name"))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "watching mapping config");

        let task = tokio::spawn(reload_loop(rx, path, file_name, mapper));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for MappingWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reload_loop(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    path: PathBuf,
    file_name: OsString,
    mapper: Arc<TubeMapper>,
) {
    while let Some(event) = events.recv().await {
        if !concerns(&event, &file_name) {
            continue;
        }
        tokio::time::sleep(SETTLE).await;
        while events.try_recv().is_ok() {}

        tracing::debug!(path = %path.display(), "mapping config changed");
        // Outcome is logged and counted by the mapper.
        let _ = mapper.reload_file(&path);
    }
}

fn concerns(event: &notify::Result<Event>, file_name: &OsString) -> bool {
    match event {
        Ok(event) => {
            matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n == file_name.as_os_str()).unwrap_or(false))
        }
        Err(e) => {
            tracing::warn!(error = %e, "mapping config watch error");
            false
        }
    }
}

/// Load the mapping file once at startup. A broken file here is fatal for
/// the caller; later reloads only keep the previous rules.
pub fn initial_load(path: &Path, mapper: &TubeMapper) -> Result<usize, bsx_core::ConfigError> {
    let count = mapper.load_file(path)?;
    tracing::info!(path = %path.display(), mappings = count, "mapping config loaded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsx_core::{ExporterMetrics, Outcome};
    use std::time::Instant;

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_reload_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.conf");
        std::fs::write(&path, "foo-(\\d+)\nname=\"foo\"\n").unwrap();

        let metrics = Arc::new(ExporterMetrics::new().unwrap());
        let mapper = Arc::new(TubeMapper::with_metrics(metrics.clone()));
        assert_eq!(initial_load(&path, &mapper).unwrap(), 1);

        let _watcher = MappingWatcher::start(&path, mapper.clone()).unwrap();

        std::fs::write(&path, "foo-(\\d+)\nname=\"foo\"\n\nbar-(\\d+)\nname=\"bar\"\n").unwrap();
        assert!(wait_for(|| mapper.snapshot().len() == 2).await);
        assert!(metrics.config_reloads_total.with_label_values(&[Outcome::Success.as_str()]).get() >= 1);

        // A broken edit keeps the rules that were working.
        std::fs::write(&path, "foo-(\\d+)\nthis is not a label\n").unwrap();
        assert!(
            wait_for(|| {
                metrics
                    .config_reloads_total
                    .with_label_values(&[Outcome::Failure.as_str()])
                    .get()
                    >= 1
            })
            .await
        );
        assert_eq!(mapper.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_other_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.conf");
        std::fs::write(&path, "").unwrap();

        let metrics = Arc::new(ExporterMetrics::new().unwrap());
        let mapper = Arc::new(TubeMapper::with_metrics(metrics.clone()));
        let _watcher = MappingWatcher::start(&path, mapper.clone()).unwrap();

        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let total: u64 = [Outcome::Success, Outcome::Failure]
            .iter()
            .map(|o| metrics.config_reloads_total.with_label_values(&[o.as_str()]).get())
            .sum();
        assert_eq!(total, 0);
    }
}
