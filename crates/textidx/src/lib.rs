//! Vellum text index synchronizer.
//!
//! Writes to the object store queue object ids in a dirty table and wake
//! the synchronizer. Each pass takes a bounded batch per application from
//! the dirty queue and from any running full reindex, derives the terms of
//! every object, commits the postings in one write and only then clears
//! the queue rows it handled. Objects which fail to index are logged and
//! requeued; they never hold up the rest of the batch.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vellum_core::consts::TEXT_INDEX_MAX_REINDEX;
use vellum_core::{AppId, Desc, ObjRef, Result, StoreError};
use vellum_persist::{StoreConfig, DIRTY_TEXT_TABLE, REINDEX_TABLE};
use vellum_store::{Actor, ObjectStore};

mod terms;

/// Totals for one pass over every registered application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub indexed: usize,
    pub removed: usize,
    pub failed: usize,
    /// Some application has more queued work than one batch took.
    pub more: bool,
}

impl PassStats {
    fn add(&mut self, other: PassStats) {
        self.indexed += other.indexed;
        self.removed += other.removed;
        self.failed += other.failed;
        self.more |= other.more;
    }
}

enum Control {
    CloseApp { app: AppId, ack: oneshot::Sender<Result<()>> },
    Shutdown,
}

struct ReindexJob {
    id: i64,
    cursor: i64,
    filter: Option<Vec<Desc>>,
}

/// The only writer of text index postings.
pub struct Synchronizer {
    stores: RwLock<BTreeMap<AppId, Arc<ObjectStore>>>,
    trigger: Arc<Notify>,
    batch: usize,
    wake_timeout: Duration,
}

impl Synchronizer {
    /// `trigger` must be the index trigger shared by the registered stores.
    pub fn new(config: &StoreConfig, trigger: Arc<Notify>) -> Self {
        Self {
            stores: RwLock::new(BTreeMap::new()),
            trigger,
            batch: config.textidx_batch.max(1),
            wake_timeout: Duration::from_secs(config.textidx_wake_timeout_secs.max(1)),
        }
    }

    pub fn register(&self, store: Arc<ObjectStore>) -> Result<()> {
        let app = store.app();
        self.stores.write()?.insert(app, store);
        info!(app, "application registered for text indexing");
        Ok(())
    }

    pub fn apps(&self) -> Result<Vec<AppId>> {
        Ok(self.stores.read()?.keys().copied().collect())
    }

    /// Stop indexing `app`: its queued work is dropped and it leaves the
    /// registry. Returns false if it was not registered.
    pub fn close_app(&self, app: AppId) -> Result<bool> {
        let Some(store) = self.stores.write()?.remove(&app) else {
            return Ok(false);
        };
        let removed = store.db().serializable(|tx| {
            let dirty = tx.execute(&format!("DELETE FROM {} WHERE app_id = ?1", DIRTY_TEXT_TABLE), [app])?;
            tx.execute(&format!("DELETE FROM {} WHERE app_id = ?1", REINDEX_TABLE), [app])?;
            Ok(dirty)
        })?;
        info!(app, dropped = removed, "text index closed for application");
        Ok(true)
    }

    /// One pass over every registered application. An application whose
    /// pass fails is logged and skipped.
    pub fn run_once(&self) -> Result<PassStats> {
        let stores: Vec<Arc<ObjectStore>> = self.stores.read()?.values().cloned().collect();
        let mut stats = PassStats::default();
        for store in stores {
            match self.index_app(&store) {
                Ok(s) => stats.add(s),
                Err(e) => error!(app = store.app(), error = %e, "text index pass failed"),
            }
        }
        Ok(stats)
    }

    fn index_app(&self, store: &ObjectStore) -> Result<PassStats> {
        let started = Instant::now();
        let app = store.app();
        let (dirty, job) = {
            let conn = store.db().lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT obj_id, MAX(id) FROM {} WHERE app_id = ?1 GROUP BY obj_id ORDER BY MIN(id) LIMIT ?2",
                DIRTY_TEXT_TABLE
            ))?;
            let dirty = stmt
                .query_map(params![app, self.batch as i64], |r| Ok((ObjRef(r.get(0)?), r.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let job = conn
                .query_row(
                    &format!(
                        "SELECT id, cursor, filter_by_attr FROM {} WHERE app_id = ?1 ORDER BY id DESC LIMIT 1",
                        REINDEX_TABLE
                    ),
                    [app],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, Option<String>>(2)?)),
                )
                .optional()?;
            (dirty, job)
        };
        let job = match job {
            Some((id, cursor, filter)) => {
                let filter = filter.map(|f| serde_json::from_str::<Vec<Desc>>(&f)).transpose()?;
                Some(ReindexJob { id, cursor, filter })
            }
            None => None,
        };
        let reindex: Vec<ObjRef> = match &job {
            Some(j) => {
                let conn = store.db().lock()?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT id FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
                    store.tables().objects
                ))?;
                let ids = stmt
                    .query_map(params![j.cursor, TEXT_INDEX_MAX_REINDEX as i64], |r| Ok(ObjRef(r.get(0)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ids
            }
            None => Vec::new(),
        };
        if dirty.is_empty() && job.is_none() {
            return Ok(PassStats::default());
        }

        let schema = store.schema()?;
        let system = Actor::system();
        let mut writer = store.text_index().writer();
        let mut stats = PassStats::default();
        let mut failed: Vec<ObjRef> = Vec::new();
        let mut done: FxHashSet<ObjRef> = FxHashSet::default();
        let from_dirty = dirty.iter().map(|(r, _)| (*r, None::<&[Desc]>));
        let from_job = reindex.iter().map(|r| (*r, job.as_ref().and_then(|j| j.filter.as_deref())));
        for (objref, filter) in from_dirty.chain(from_job) {
            if !done.insert(objref) {
                continue;
            }
            let obj = match store.read(&system, objref) {
                Ok(o) => o,
                Err(StoreError::NotFound(_)) => {
                    writer.delete_document(objref.id());
                    stats.removed += 1;
                    continue;
                }
                Err(e) => {
                    self.indexing_failed(store, objref, &e);
                    failed.push(objref);
                    continue;
                }
            };
            if let Some(descs) = filter {
                if !descs.iter().any(|d| obj.has_attr(*d)) {
                    continue;
                }
            }
            let indexed = store.delegate().indexed_version_of_object(&obj);
            match terms::collect(store, &schema, indexed.as_ref().unwrap_or(obj.as_ref())) {
                Ok(runs) => {
                    terms::post(&mut writer, objref.id(), &runs);
                    stats.indexed += 1;
                }
                Err(e) => {
                    self.indexing_failed(store, objref, &e);
                    failed.push(objref);
                }
            }
        }
        stats.failed = failed.len();
        let written = writer.commit()?;

        let batch_full = dirty.len() >= self.batch;
        let job_continues = reindex.len() >= TEXT_INDEX_MAX_REINDEX;
        store.db().serializable(|tx| {
            for (objref, upto) in &dirty {
                tx.execute(
                    &format!("DELETE FROM {} WHERE app_id = ?1 AND obj_id = ?2 AND id <= ?3", DIRTY_TEXT_TABLE),
                    params![app, objref.id(), upto],
                )?;
            }
            for objref in &failed {
                tx.execute(
                    &format!("INSERT INTO {}(app_id, obj_id) VALUES (?1, ?2)", DIRTY_TEXT_TABLE),
                    params![app, objref.id()],
                )?;
            }
            if let Some(j) = &job {
                match reindex.last() {
                    Some(last) if job_continues => {
                        tx.execute(
                            &format!("UPDATE {} SET cursor = ?2 WHERE id = ?1", REINDEX_TABLE),
                            params![j.id, last.id()],
                        )?;
                    }
                    _ => {
                        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", REINDEX_TABLE), [j.id])?;
                    }
                }
            }
            Ok(())
        })?;
        if job.is_some() && !job_continues {
            info!(app, "full text reindex finished");
        }

        stats.more = batch_full || job_continues;
        counter!("textidx_objects_indexed_total", stats.indexed as u64);
        histogram!("textidx_batch_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            app,
            indexed = stats.indexed,
            removed = stats.removed,
            failed = stats.failed,
            documents = written,
            "text index batch committed"
        );
        Ok(stats)
    }

    fn indexing_failed(&self, store: &ObjectStore, objref: ObjRef, err: &StoreError) {
        warn!(app = store.app(), obj = %objref, error = %err, "failed to index object; requeued");
        counter!("textidx_failures_total", 1u64);
        store.delegate().textidx_exception_indexing_object(store.app(), objref, err);
    }

    /// Run passes in the background until shut down. Passes run on the
    /// blocking pool; between them the task waits for the trigger, a
    /// control request or the wake timeout.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (tx, rx) = mpsc::channel(8);
        let trigger = self.trigger.clone();
        let join = tokio::spawn(self.run(rx));
        SyncHandle { tx, trigger, join }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Control>) {
        info!(batch = self.batch, timeout_secs = self.wake_timeout.as_secs(), "text index synchronizer started");
        loop {
            // close requests go before any further indexing
            loop {
                match rx.try_recv() {
                    Ok(Control::CloseApp { app, ack }) => self.clone().handle_close(app, ack).await,
                    Ok(Control::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => return self.stopped(),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                }
            }
            let me = self.clone();
            let more = match tokio::task::spawn_blocking(move || me.run_once()).await {
                Ok(Ok(stats)) => stats.more,
                Ok(Err(e)) => {
                    error!(error = %e, "text index pass failed");
                    false
                }
                Err(e) => {
                    error!(error = %e, "text index pass panicked");
                    false
                }
            };
            if more {
                continue;
            }
            tokio::select! {
                _ = self.trigger.notified() => {}
                msg = rx.recv() => match msg {
                    Some(Control::CloseApp { app, ack }) => self.clone().handle_close(app, ack).await,
                    Some(Control::Shutdown) | None => return self.stopped(),
                },
                _ = tokio::time::sleep(self.wake_timeout) => {}
            }
        }
    }

    async fn handle_close(self: Arc<Self>, app: AppId, ack: oneshot::Sender<Result<()>>) {
        let result = match tokio::task::spawn_blocking(move || self.close_app(app)).await {
            Ok(r) => r.map(|_| ()),
            Err(e) => Err(StoreError::IndexingFailure(e.to_string())),
        };
        let _ = ack.send(result);
    }

    fn stopped(&self) {
        info!("text index synchronizer stopped");
    }
}

/// Control side of a spawned [`Synchronizer`].
pub struct SyncHandle {
    tx: mpsc::Sender<Control>,
    trigger: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SyncHandle {
    /// Start a pass now instead of waiting for a write or the timeout.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Close `app` once any pass in progress has finished. Resolves when
    /// the synchronizer has dropped the app's queued work.
    pub async fn close_app(&self, app: AppId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Control::CloseApp { app, ack })
            .await
            .map_err(|_| StoreError::IndexingFailure("synchronizer is not running".into()))?;
        done.await.map_err(|_| StoreError::IndexingFailure("synchronizer stopped before closing".into()))?
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.tx.send(Control::Shutdown).await;
        self.join.await.map_err(|e| StoreError::IndexingFailure(e.to_string()))
    }
}
