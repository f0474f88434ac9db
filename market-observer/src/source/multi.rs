//! Composite source fanning lifecycle and fetches across members.
//!
//! Members are expected to own disjoint symbol sets; on a key collision the
//! later writer wins. Cancellation flows parent -> manager -> members over
//! broadcast channels.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use observer_common::{DataSourceError, UpdateMap};

use super::DataSource;

struct RunningState {
    out: mpsc::Sender<UpdateMap>,
    /// Tasks of sources added while running
    late_handles: Vec<JoinHandle<()>>,
}

pub struct MultiSourceManager {
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
    shutdown_tx: broadcast::Sender<()>,
    running: Mutex<Option<RunningState>>,
}

impl MultiSourceManager {
    pub fn new(sources: Vec<Arc<dyn DataSource>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);

        let map = sources
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();

        Self {
            sources: RwLock::new(map),
            shutdown_tx,
            running: Mutex::new(None),
        }
    }

    fn all_sources(&self) -> Vec<Arc<dyn DataSource>> {
        self.sources.read().unwrap().values().cloned().collect()
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().unwrap().len()
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.read().unwrap().get(name).cloned()
    }

    /// Register a new source; when the manager is running the source is
    /// started immediately under the live updates channel.
    pub async fn add_source(&self, source: Arc<dyn DataSource>) -> Result<(), DataSourceError> {
        let name = source.name().to_string();

        {
            let mut sources = self.sources.write().unwrap();
            if sources.contains_key(&name) {
                return Err(DataSourceError::AlreadyExists(name));
            }
            sources.insert(name.clone(), Arc::clone(&source));
        }

        let mut running = self.running.lock().await;
        if let Some(state) = running.as_mut() {
            let handle = source
                .start(state.out.clone(), self.shutdown_tx.subscribe())
                .await?;
            state.late_handles.push(handle);
            info!(source = %name, "started source under running manager");
        }

        info!(source = %name, "added source");
        Ok(())
    }

    /// Stop and unregister a source.
    pub async fn remove_source(&self, name: &str) -> Result<(), DataSourceError> {
        let source = self
            .sources
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| DataSourceError::NotFound(name.to_string()))?;

        if let Err(e) = source.stop().await {
            error!(source = %name, error = %e, "error stopping source");
        }

        info!(source = %name, "removed source");
        Ok(())
    }
}

#[async_trait]
impl DataSource for MultiSourceManager {
    fn name(&self) -> &str {
        "multi-source"
    }

    /// True iff every member is real-time.
    fn is_real_time(&self) -> bool {
        let sources = self.sources.read().unwrap();
        !sources.is_empty() && sources.values().all(|s| s.is_real_time())
    }

    /// Fan out to all members and merge. Failed members are logged and
    /// skipped so one bad provider cannot sink the bootstrap.
    async fn fetch_initial(&self) -> Result<UpdateMap, DataSourceError> {
        fan_out_fetch(self.all_sources(), true).await
    }

    async fn fetch_update(&self) -> Result<UpdateMap, DataSourceError> {
        fan_out_fetch(self.all_sources(), false).await
    }

    async fn start(
        &self,
        out: mpsc::Sender<UpdateMap>,
        parent_shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, DataSourceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DataSourceError::AlreadyRunning("multi-source".to_string()));
        }

        let mut handles = Vec::new();
        for source in self.all_sources() {
            let handle = source
                .start(out.clone(), self.shutdown_tx.subscribe())
                .await?;
            handles.push(handle);
        }

        *running = Some(RunningState {
            out,
            late_handles: Vec::new(),
        });

        // Forward parent cancellation to the members. A closed parent
        // channel counts as cancellation too.
        let shutdown_tx = self.shutdown_tx.clone();
        let mut parent = parent_shutdown;
        tokio::spawn(async move {
            let _ = parent.recv().await;
            let _ = shutdown_tx.send(());
        });

        // The returned handle resolves once every member loop has exited.
        let supervisor = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
        });

        Ok(supervisor)
    }

    /// Cancel all members. Idempotent: stopping a stopped manager is a
    /// no-op.
    async fn stop(&self) -> Result<(), DataSourceError> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return Ok(());
        };

        info!("stopping multi-source manager");
        let _ = self.shutdown_tx.send(());

        for handle in state.late_handles {
            let _ = handle.await;
        }

        Ok(())
    }

    fn update_symbols(&self, symbols: &[String]) {
        for source in self.all_sources() {
            source.update_symbols(symbols);
        }
    }
}

/// Concurrent fan-out over members, merged with later-wins semantics.
async fn fan_out_fetch(
    sources: Vec<Arc<dyn DataSource>>,
    initial: bool,
) -> Result<UpdateMap, DataSourceError> {
    let mut tasks = Vec::with_capacity(sources.len());
    for source in sources {
        tasks.push(tokio::spawn(async move {
            let result = if initial {
                source.fetch_initial().await
            } else {
                source.fetch_update().await
            };
            (source.name().to_string(), result)
        }));
    }

    let mut merged = UpdateMap::new();
    for task in tasks {
        match task.await {
            Ok((_, Ok(data))) => {
                for (symbol, samples) in data {
                    merged.insert(symbol, samples);
                }
            }
            Ok((name, Err(e))) => {
                error!(source = %name, error = %e, "source fetch failed");
            }
            Err(e) => {
                warn!(error = %e, "source fetch task panicked");
            }
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use observer_common::Sample;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Minimal scripted source for manager tests.
    struct ScriptedSource {
        name: String,
        real_time: bool,
        symbols: Vec<String>,
        fetch_calls: AtomicUsize,
        running: AtomicBool,
    }

    impl ScriptedSource {
        fn new(name: &str, symbols: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                real_time: false,
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                fetch_calls: AtomicUsize::new(0),
                running: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_real_time(&self) -> bool {
            self.real_time
        }

        async fn fetch_initial(&self) -> Result<UpdateMap, DataSourceError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let mut map = UpdateMap::new();
            for sym in &self.symbols {
                map.insert(sym.clone(), vec![Sample::new(sym.clone(), 100, 1.0, 1.0)]);
            }
            Ok(map)
        }

        async fn fetch_update(&self) -> Result<UpdateMap, DataSourceError> {
            self.fetch_initial().await
        }

        async fn start(
            &self,
            _out: mpsc::Sender<UpdateMap>,
            mut parent_shutdown: broadcast::Receiver<()>,
        ) -> Result<JoinHandle<()>, DataSourceError> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(DataSourceError::AlreadyRunning(self.name.clone()));
            }
            Ok(tokio::spawn(async move {
                let _ = parent_shutdown.recv().await;
            }))
        }

        async fn stop(&self) -> Result<(), DataSourceError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn update_symbols(&self, _symbols: &[String]) {}
    }

    #[tokio::test]
    async fn test_fetch_initial_merges_members() {
        let manager = MultiSourceManager::new(vec![
            ScriptedSource::new("a", &["AAPL"]),
            ScriptedSource::new("b", &["MSFT", "GOOG"]),
        ]);

        let data = manager.fetch_initial().await.unwrap();
        assert_eq!(data.len(), 3);
        assert!(data.contains_key("AAPL"));
        assert!(data.contains_key("GOOG"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = MultiSourceManager::new(vec![ScriptedSource::new("a", &["AAPL"])]);
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = manager
            .start(tx.clone(), shutdown_tx.subscribe())
            .await
            .unwrap();
        assert!(manager.start(tx, shutdown_tx.subscribe()).await.is_err());

        manager.stop().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_shutdown_stops_members() {
        let manager = MultiSourceManager::new(vec![ScriptedSource::new("a", &["AAPL"])]);
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = manager.start(tx, shutdown_tx.subscribe()).await.unwrap();
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove_source() {
        let manager = MultiSourceManager::new(vec![ScriptedSource::new("a", &["AAPL"])]);

        manager
            .add_source(ScriptedSource::new("b", &["MSFT"]))
            .await
            .unwrap();
        assert_eq!(manager.source_count(), 2);

        // Duplicate names are rejected
        assert!(manager
            .add_source(ScriptedSource::new("b", &["TSLA"]))
            .await
            .is_err());

        manager.remove_source("b").await.unwrap();
        assert_eq!(manager.source_count(), 1);
        assert!(manager.remove_source("b").await.is_err());
    }

    #[tokio::test]
    async fn test_add_source_while_running_starts_it() {
        let manager = MultiSourceManager::new(vec![ScriptedSource::new("a", &["AAPL"])]);
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = manager.start(tx, shutdown_tx.subscribe()).await.unwrap();

        let late = ScriptedSource::new("late", &["MSFT"]);
        manager.add_source(Arc::clone(&late) as Arc<dyn DataSource>).await.unwrap();
        assert!(late.running.load(Ordering::SeqCst));

        manager.stop().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_is_real_time_requires_all_members() {
        let manager = MultiSourceManager::new(vec![ScriptedSource::new("a", &["AAPL"])]);
        assert!(!manager.is_real_time());

        let empty = MultiSourceManager::new(vec![]);
        assert!(!empty.is_real_time());
    }
}
