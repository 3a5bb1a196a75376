use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use scan_plugin::PluginMetadata;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

use crate::engine::PluginEngine;
use crate::error::EngineError;

/// File extensions treated as plugin source.
pub const PLUGIN_EXTENSIONS: [&str; 2] = ["ts", "js"];

/// Something that can be hot-reloaded from files on disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Background tasks watching one directory; dropped tasks keep running until
/// [`DirectoryWatcher::shutdown`].
#[derive(Debug)]
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watch `dir` for files accepted by `watched.is_relevant` or carrying one
    /// of `exts`. With `initial_scan`, existing files are loaded first; with
    /// `enable_retry`, failed loads are retried a few times.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            bail!("directory {} does not exist", dir.display());
        }
        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let relevant = {
            let watched = watched.clone();
            let exts = exts.clone();
            move |path: &Path| watched.is_relevant(path) || has_extension(path, &exts)
        };

        // 1) load what is already there
        if initial_scan {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| relevant(p.as_path()))
                .collect();
            entries.sort();
            for path in entries {
                try_reload(&watched, &path, enable_retry).await;
            }
        }

        // 2) the poll watcher pushes raw events into a channel
        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) = tokio::sync::mpsc::unbounded_channel();
        let mut poller = PollWatcher::new(
            move |res| {
                // nobody listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .context("creating poll watcher")?;
        poller
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;
        let handle_watcher = tokio::spawn(async move {
            let _poller = poller;
            futures::future::pending::<()>().await;
        });

        // 3) dispatch events to the watched type
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(CreateKind::Any | CreateKind::File) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| relevant(p.as_path())) {
                            try_reload(&watched, &path, enable_retry).await;
                        }
                    }
                    Ok(Event { kind: EventKind::Remove(_), paths, .. }) => {
                        for path in paths.into_iter().filter(|p| relevant(p.as_path())) {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "failed to handle removal");
                            }
                        }
                    }
                    Err(e) => warn!(?e, "watcher error"),
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher { handles: vec![handle_dispatch, handle_watcher] })
    }

    /// Stop watching; no events are dispatched after this returns.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e == ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if !retry || attempt == MAX_RETRIES - 1 => {
                error!("failed to reload {:?}: {e:#}", path);
                return;
            }
            Err(e) => {
                warn!("retrying reload {:?} (attempt {}): {e:#}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keeps the engine's plugins in step with a directory of source files.
///
/// The file stem is the plugin id. New files are created and enabled,
/// changed files are updated (hot-updating enabled plugins), and removed
/// files delete their plugin.
#[derive(Debug, Clone)]
pub struct PluginDirectory {
    engine: Arc<PluginEngine>,
}

impl PluginDirectory {
    pub fn new(engine: Arc<PluginEngine>) -> Self {
        Self { engine }
    }

    pub async fn watch(self, dir: PathBuf) -> Result<DirectoryWatcher> {
        DirectoryWatcher::new(dir, Arc::new(self), &PLUGIN_EXTENSIONS, true, false).await
    }

    fn plugin_id(path: &Path) -> Option<String> {
        path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
    }
}

#[async_trait]
impl WatchedType for PluginDirectory {
    fn is_relevant(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PLUGIN_EXTENSIONS.contains(&e))
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let Some(id) = Self::plugin_id(path) else {
            return Ok(());
        };
        let source = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        match self.engine.plugin(&id) {
            Some(existing) if existing.source_code == source => Ok(()),
            Some(existing) => {
                self.engine.update_plugin(existing.metadata, source).await?;
                info!(plugin_id = %id, "plugin reloaded from disk");
                Ok(())
            }
            None => {
                let metadata = PluginMetadata::new(id.clone(), id.clone(), "0.0.0");
                self.engine.create_plugin(metadata, source).await?;
                self.engine.enable_plugin(&id).await?;
                info!(plugin_id = %id, "plugin loaded from disk");
                Ok(())
            }
        }
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some(id) = Self::plugin_id(path) else {
            return Ok(());
        };
        match self.engine.delete_plugin(&id).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWatcher {
        created: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for CountingWatcher {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("ts")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initial_scan_only_picks_relevant_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();

        let counting = Arc::new(CountingWatcher { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let watcher = DirectoryWatcher::new(dir.path().to_path_buf(), counting.clone(), &[], true, false)
            .await
            .unwrap();
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 0);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let counting = Arc::new(CountingWatcher { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        assert!(DirectoryWatcher::new(PathBuf::from("/definitely/not/here"), counting, &[], true, false).await.is_err());
    }
}
