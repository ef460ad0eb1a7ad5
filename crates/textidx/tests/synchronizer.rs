use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use vellum_core::consts::{
    A_ATTR_SHORT_NAME, A_PARENT, A_RELEVANCY_WEIGHT, A_RESTRICTION_ATTR_RESTRICTED, A_RESTRICTION_IF_LABEL, A_RESTRICTION_TYPE, A_RESTRICTION_UNRESTRICT_LABEL,
    A_TITLE, A_TYPE, O_LABEL_STRUCTURE, O_TYPE_APP_VISIBLE, O_TYPE_ATTR_DESC, O_TYPE_RESTRICTION,
};
use vellum_core::{Label, LabelChanges, LabelList, LabelStatements, ObjRef, Operation, StoredObject, Text, TextKind};
use vellum_labels::OpsStatements;
use vellum_persist::{Db, StoreConfig};
use vellum_search::Scope;
use vellum_store::{Actor, CreateOptions, ObjectStore, Projection, Query, SortBy};
use vellum_textidx::Synchronizer;

const A_NOTES: i64 = 3_001;

fn temp_db() -> String {
    let dir = std::env::temp_dir();
    let f = format!("vellum-textidx-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
    dir.join(f).to_string_lossy().to_string()
}

fn setup() -> (Arc<ObjectStore>, Arc<Synchronizer>) {
    let config = StoreConfig::default().with_db_path(temp_db());
    let db = Arc::new(Db::open(config.clone()).unwrap());
    let trigger = Arc::new(Notify::new());
    let store = Arc::new(ObjectStore::open(db, 1).unwrap().with_index_trigger(trigger.clone()));
    let sync = Arc::new(Synchronizer::new(&config, trigger));
    sync.register(store.clone()).unwrap();
    (store, sync)
}

fn drain(s: &ObjectStore, sync: &Synchronizer) {
    for _ in 0..20 {
        if !s.is_indexing_outstanding().unwrap() {
            return;
        }
        sync.run_once().unwrap();
    }
    panic!("indexing did not finish");
}

fn reader(labels: &[Label], unrestrict: &[Label]) -> Actor {
    let ops = OpsStatements::new().statement(Operation::Read, LabelList::from(labels), LabelList::empty());
    Actor::new(9, LabelStatements::Ops(ops)).with_unrestrict_labels(LabelList::from(unrestrict))
}

fn search(s: &ObjectStore, actor: &Actor, text: &str, desc: Option<i64>) -> Vec<ObjRef> {
    let mut q = Query::new();
    q.free_text(text, desc, None);
    s.query(actor, &q, SortBy::Relevance, Projection::Refs).unwrap().objrefs().to_vec()
}

#[tokio::test]
async fn titles_are_found_only_by_readers_of_the_object() {
    let (s, sync) = setup();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Contract", A_TITLE);
    let r = s.create(&Actor::system(), o, CreateOptions::default()).unwrap().objref.unwrap();
    drain(&s, &sync);

    assert!(search(&s, &reader(&[20], &[]), "contract", None).is_empty());
    assert_eq!(search(&s, &reader(&[10], &[]), "contract", None), vec![r]);
    assert_eq!(search(&s, &reader(&[10], &[]), "contract", Some(A_TITLE)), vec![r]);
}

fn define_type(s: &ObjectStore, title: &str, parent: Option<ObjRef>) -> ObjRef {
    let mut t = StoredObject::with_labels(LabelList::from([O_LABEL_STRUCTURE]));
    t.add_attr(O_TYPE_APP_VISIBLE, A_TYPE).add_attr(title, A_TITLE);
    if let Some(p) = parent {
        t.add_attr(p, A_PARENT);
    }
    s.create(&Actor::system(), t, CreateOptions::default()).unwrap().objref.unwrap()
}

#[tokio::test]
async fn relabel_into_a_restriction_hides_field_terms() {
    let (s, sync) = setup();
    let sys = Actor::system();
    let record = define_type(&s, "Record", None);
    let minutes = define_type(&s, "Minutes", Some(record));
    let mut rule = StoredObject::with_labels(LabelList::from([O_LABEL_STRUCTURE]));
    rule.add_attr(O_TYPE_RESTRICTION, A_TYPE)
        .add_attr(minutes, A_RESTRICTION_TYPE)
        .add_attr(50i64, A_RESTRICTION_IF_LABEL)
        .add_attr(60i64, A_RESTRICTION_UNRESTRICT_LABEL)
        .add_attr(A_NOTES, A_RESTRICTION_ATTR_RESTRICTED);
    s.create(&sys, rule, CreateOptions::default()).unwrap();

    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr(minutes, A_TYPE).add_attr("Meeting", A_TITLE).add_attr("moonlight rendezvous", A_NOTES);
    let r = s.create(&sys, o, CreateOptions::default()).unwrap().objref.unwrap();
    drain(&s, &sync);

    let viewer = reader(&[10], &[]);
    let unlocked = reader(&[10], &[60]);
    assert_eq!(search(&s, &viewer, "moonlight", Some(A_NOTES)), vec![r]);

    let mut changes = LabelChanges::default();
    changes.add([50]);
    s.relabel(&sys, r, changes).unwrap();
    drain(&s, &sync);

    assert!(search(&s, &viewer, "moonlight", Some(A_NOTES)).is_empty());
    assert!(search(&s, &viewer, "moonlight", None).is_empty());
    assert_eq!(search(&s, &unlocked, "moonlight", Some(A_NOTES)), vec![r]);
    assert_eq!(search(&s, &sys, "moonlight", Some(A_NOTES)), vec![r]);
    assert_eq!(search(&s, &viewer, "meeting", None), vec![r]);
}

#[tokio::test]
async fn linked_titles_are_indexed_with_the_linking_object() {
    let (s, sync) = setup();
    let sys = Actor::system();
    let mut org = StoredObject::with_labels(LabelList::from([10]));
    org.add_attr("Globex", A_TITLE);
    let org = s.create(&sys, org, CreateOptions::default()).unwrap().objref.unwrap();
    let mut doc = StoredObject::with_labels(LabelList::from([10]));
    doc.add_attr("Quarterly report", A_TITLE).add_attr(org, 3_002);
    let doc = s.create(&sys, doc, CreateOptions::default()).unwrap().objref.unwrap();
    drain(&s, &sync);

    let mut hits = search(&s, &sys, "globex", None);
    hits.sort();
    assert_eq!(hits, vec![org, doc]);
    assert_eq!(search(&s, &sys, "globex", Some(3_002)), vec![doc]);
}

#[tokio::test]
async fn linked_terms_take_the_weight_of_the_linking_attribute() {
    let (s, sync) = setup();
    let sys = Actor::system();
    let mut client = StoredObject::with_labels(LabelList::from([O_LABEL_STRUCTURE]));
    client.add_attr(O_TYPE_ATTR_DESC, A_TYPE).add_attr("client", A_ATTR_SHORT_NAME).add_attr(4_000i64, A_RELEVANCY_WEIGHT);
    let heavy = s.create(&sys, client, CreateOptions::default()).unwrap().objref.unwrap().id();

    let mut org = StoredObject::with_labels(LabelList::from([10]));
    org.add_attr("Globex", A_TITLE);
    let org = s.create(&sys, org, CreateOptions::default()).unwrap().objref.unwrap();
    let mut contract = StoredObject::with_labels(LabelList::from([10]));
    contract.add_attr("Contract", A_TITLE).add_attr(org, heavy);
    let contract = s.create(&sys, contract, CreateOptions::default()).unwrap().objref.unwrap();
    let mut memo = StoredObject::with_labels(LabelList::from([10]));
    memo.add_attr("Memo", A_TITLE).add_attr(org, 3_002);
    let memo = s.create(&sys, memo, CreateOptions::default()).unwrap().objref.unwrap();

    let mut scanned = StoredObject::with_labels(LabelList::from([10]));
    scanned.add_attr(Text::new(TextKind::Document, "Initech"), A_TITLE);
    let scanned = s.create(&sys, scanned, CreateOptions::default()).unwrap().objref.unwrap();
    let mut letter = StoredObject::with_labels(LabelList::from([10]));
    letter.add_attr("Letter", A_TITLE).add_attr(scanned, 3_002);
    s.create(&sys, letter, CreateOptions::default()).unwrap();
    drain(&s, &sync);

    let hits = search(&s, &sys, "globex", None);
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0], contract);
    assert_eq!(&hits[1..], &[memo, org]);

    assert_eq!(search(&s, &sys, "initech", None), vec![scanned]);
}

#[tokio::test]
async fn erased_objects_leave_the_index() {
    let (s, sync) = setup();
    let sys = Actor::system();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Ephemeral", A_TITLE);
    let r = s.create(&sys, o, CreateOptions::default()).unwrap().objref.unwrap();
    drain(&s, &sync);
    assert_eq!(s.text_index().document_count().unwrap(), 1);

    s.erase(&sys, r).unwrap();
    drain(&s, &sync);
    assert_eq!(s.text_index().document_count().unwrap(), 0);
    assert!(s.text_index().document_terms(r.id(), Scope::Full).unwrap().is_empty());
}

#[tokio::test]
async fn full_reindex_walks_every_object() {
    let (s, sync) = setup();
    let sys = Actor::system();
    for n in 0..40 {
        let mut o = StoredObject::with_labels(LabelList::from([10]));
        o.add_attr(format!("Item {}", n).as_str(), A_TITLE);
        s.create(&sys, o, CreateOptions::default()).unwrap();
    }
    let first = sync.run_once().unwrap();
    assert_eq!(first.indexed, 16);
    assert!(first.more);
    drain(&s, &sync);
    assert_eq!(s.text_index().document_count().unwrap(), 40);

    s.reindex_all_objects(None).unwrap();
    assert!(s.is_indexing_outstanding().unwrap());
    drain(&s, &sync);
    assert_eq!(s.text_index().document_count().unwrap(), 40);
    assert!(!s.is_indexing_outstanding().unwrap());
}

#[tokio::test]
async fn background_task_indexes_after_writes() {
    let (s, sync) = setup();
    let handle = sync.clone().spawn();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Background", A_TITLE);
    s.create(&Actor::system(), o, CreateOptions::default()).unwrap();

    let mut found = false;
    for _ in 0..100 {
        if s.text_index().document_count().unwrap() == 1 {
            found = true;
            break;
        }
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(found);

    handle.close_app(1).await.unwrap();
    assert!(sync.apps().unwrap().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_reindex_requeues_the_object() {
    let (s, sync) = setup();
    let mut o = StoredObject::with_labels(LabelList::from([10]));
    o.add_attr("Ledger", A_TITLE);
    let r = s.create(&Actor::system(), o, CreateOptions::default()).unwrap().objref.unwrap();
    drain(&s, &sync);
    assert!(!s.is_indexing_outstanding().unwrap());

    s.reindex_text_for_object(r).unwrap();
    assert!(s.is_indexing_outstanding().unwrap());
    drain(&s, &sync);

    s.reindex_object(r).unwrap();
    assert!(s.is_indexing_outstanding().unwrap());
    drain(&s, &sync);
    assert_eq!(search(&s, &Actor::system(), "ledger", None), vec![r]);

    assert!(s.reindex_object(ObjRef(r.id() + 1_000)).is_err());
}
