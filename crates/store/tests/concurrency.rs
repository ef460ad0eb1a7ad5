use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock, Weak};

use vellum_core::consts::A_TITLE;
use vellum_core::{LabelChanges, LabelList, LabelStatements, Operation, StoreError, StoredObject};
use vellum_labels::OpsStatements;
use vellum_persist::{Db, StoreConfig};
use vellum_store::{Actor, CreateOptions, ObjectChange, ObjectStore, StoreDelegate};

fn temp_db() -> String {
    let dir = std::env::temp_dir();
    let f = format!("vellum-conc-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
    dir.join(f).to_string_lossy().to_string()
}

fn store() -> Arc<ObjectStore> {
    let db = Arc::new(Db::open(StoreConfig::default().with_db_path(temp_db())).unwrap());
    Arc::new(ObjectStore::open(db, 1).unwrap())
}

#[test]
fn racing_updates_from_the_same_version() {
    let s = store();
    let sys = Actor::system();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Original", A_TITLE);
    let base = s.create(&sys, o, CreateOptions::default()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let results: Vec<Result<StoredObject, StoreError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = ["Left", "Right"]
            .into_iter()
            .map(|title| {
                let s = s.clone();
                let barrier = barrier.clone();
                let mut edit = base.clone();
                scope.spawn(move || {
                    edit.delete_attrs(A_TITLE);
                    edit.add_attr(title, A_TITLE);
                    barrier.wait();
                    s.update(&Actor::system(), edit)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].version, 2);
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::ConcurrentModification { .. })))
        .count();
    assert_eq!(conflicts, 1);

    let stored = s.read(&sys, base.objref.unwrap()).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.title().unwrap().text, ok[0].title().unwrap().text);
    assert_eq!(s.history(&sys, base.objref.unwrap()).unwrap().history.len(), 1);
}

#[test]
fn concurrent_relabels_compose() {
    let s = store();
    let sys = Actor::system();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Shared", A_TITLE);
    let r = s.create(&sys, o, CreateOptions::default()).unwrap().objref.unwrap();

    std::thread::scope(|scope| {
        for label in [20, 30, 40, 50] {
            let s = s.clone();
            scope.spawn(move || {
                let mut changes = LabelChanges::default();
                changes.add([label]);
                s.relabel(&Actor::system(), r, changes).unwrap();
            });
        }
    });

    assert_eq!(s.labels_for_ref(r).unwrap(), Some(LabelList::from([10, 20, 30, 40, 50])));
    assert_eq!(s.read(&sys, r).unwrap().version, 1);
}

#[test]
fn reads_after_an_update_see_it_while_other_threads_read() {
    let s = store();
    let sys = Actor::system();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Rev", A_TITLE);
    let r = s.create(&sys, o, CreateOptions::default()).unwrap().objref.unwrap();

    let stop = AtomicBool::new(false);
    let stale = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let _ = s.read(&Actor::system(), r);
                }
            });
        }
        let mut latest = (*s.read(&sys, r).unwrap()).clone();
        for n in 0..500 {
            latest.delete_attrs(A_TITLE);
            latest.add_attr(format!("Rev {}", n).as_str(), A_TITLE);
            latest = s.update(&sys, latest).unwrap();
            if s.read(&sys, r).unwrap().version != latest.version {
                stale.fetch_add(1, Ordering::Relaxed);
            }
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(stale.load(Ordering::Relaxed), 0);
    assert_eq!(s.read(&sys, r).unwrap().version, 501);
}

/// Moves the object from label 10 to 20 with superuser authority the first
/// time a relabel is about to be applied, after the relabel's own checks.
#[derive(Default)]
struct MovesLabelsMidway {
    store: OnceLock<Weak<ObjectStore>>,
    fired: AtomicBool,
}

impl StoreDelegate for MovesLabelsMidway {
    fn update_label_changes_for(
        &self,
        change: ObjectChange,
        obj: &StoredObject,
        _previous: Option<&StoredObject>,
        _is_schema: bool,
        _changes: &mut LabelChanges,
    ) {
        if change != ObjectChange::Relabel || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(store) = self.store.get().and_then(Weak::upgrade) else {
            return;
        };
        let move_away = LabelChanges::new(LabelList::from([20]), LabelList::from([10]));
        store.relabel(&Actor::system(), obj.objref.unwrap(), move_away).unwrap();
    }
}

#[test]
fn relabel_authority_follows_labels_changed_underneath() {
    let db = Arc::new(Db::open(StoreConfig::default().with_db_path(temp_db())).unwrap());
    let delegate = Arc::new(MovesLabelsMidway::default());
    let s = Arc::new(ObjectStore::open(db, 1).unwrap().with_delegate(delegate.clone()));
    let _ = delegate.store.set(Arc::downgrade(&s));

    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Moving", A_TITLE);
    let r = s.create(&Actor::system(), o, CreateOptions::default()).unwrap().objref.unwrap();

    let ops = OpsStatements::new()
        .statement(Operation::Relabel, LabelList::from([10]), LabelList::empty())
        .statement(Operation::Create, LabelList::from([10, 30]), LabelList::empty());
    let limited = Actor::new(5, LabelStatements::Ops(ops));
    let mut changes = LabelChanges::default();
    changes.add([30]);

    let err = s.relabel(&limited, r, changes).unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied { op: Operation::Relabel, .. }));
    assert_eq!(s.labels_for_ref(r).unwrap(), Some(LabelList::from([20])));
}
