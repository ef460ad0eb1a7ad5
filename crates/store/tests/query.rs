use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use vellum_core::consts::{A_DATE, A_EMAIL_ADDRESS, A_PARENT, A_TITLE, A_TYPE, MAX_RESERVED_OBJID, O_LABEL_ARCHIVED};
use vellum_core::{
    DateTimeRange, Label, LabelList, LabelStatements, ObjRef, Operation, StoreError, StoredObject, Text, TextKind, Value,
};
use vellum_labels::OpsStatements;
use vellum_persist::{Db, StoreConfig};
use vellum_store::{Actor, CreateOptions, DeletedObjects, ObjectStore, Projection, Query, QueryResults, SortBy, TimeField};

const PERSON: ObjRef = ObjRef(MAX_RESERVED_OBJID + 10);
const BOOK: ObjRef = ObjRef(MAX_RESERVED_OBJID + 11);
const FILM: ObjRef = ObjRef(MAX_RESERVED_OBJID + 12);
const A_AUTHOR: i64 = 3_000;

fn temp_db() -> String {
    let dir = std::env::temp_dir();
    let f = format!("vellum-query-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
    dir.join(f).to_string_lossy().to_string()
}

fn store() -> ObjectStore {
    let db = Arc::new(Db::open(StoreConfig::default().with_db_path(temp_db())).unwrap());
    ObjectStore::open(db, 1).unwrap()
}

fn obj(title: &str, type_ref: ObjRef, labels: &[Label]) -> StoredObject {
    let mut o = StoredObject::with_labels(LabelList::from(labels));
    o.add_attr(type_ref, A_TYPE);
    o.add_attr(title, A_TITLE);
    o
}

fn put(s: &ObjectStore, o: StoredObject) -> ObjRef {
    s.create(&Actor::system(), o, CreateOptions::default()).unwrap().objref.unwrap()
}

fn run(s: &ObjectStore, q: &Query) -> QueryResults {
    s.query(&Actor::system(), q, SortBy::Date, Projection::Refs).unwrap()
}

fn set(r: &QueryResults) -> BTreeSet<ObjRef> {
    r.objrefs().iter().copied().collect()
}

fn refs(items: &[ObjRef]) -> BTreeSet<ObjRef> {
    items.iter().copied().collect()
}

struct Library {
    ann: ObjRef,
    zebra: ObjRef,
    apple: ObjRef,
    film: ObjRef,
}

fn library(s: &ObjectStore) -> Library {
    let ann = put(s, obj("Ann", PERSON, &[10]));
    let mut z = obj("Zebra Book", BOOK, &[10]);
    z.add_attr(ann, A_AUTHOR);
    let zebra = put(s, z);
    let apple = put(s, obj("apple book", BOOK, &[10, 30]));
    let mut f = obj("Film", FILM, &[10]);
    f.add_attr(ann, A_AUTHOR);
    let film = put(s, f);
    Library { ann, zebra, apple, film }
}

#[test]
fn links_types_and_containers() {
    let s = store();
    let l = library(&s);

    let mut q = Query::new();
    q.link(l.ann, Some(A_AUTHOR), None);
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra, l.film]));

    q.object_types(&[BOOK], false);
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra]));

    let mut q = Query::new();
    q.or(|c| {
        c.object_types(&[FILM], false);
        c.exact_title("  Apple   BOOK ");
    });
    assert_eq!(set(&run(&s, &q)), refs(&[l.apple, l.film]));

    let mut q = Query::new();
    q.not(|c| {
        c.object_types(&[BOOK], false);
        c.link(l.ann, Some(A_AUTHOR), None);
    });
    assert_eq!(set(&run(&s, &q)), refs(&[l.apple]));

    let mut q = Query::new();
    q.linked_from(Some(A_AUTHOR), None, |c| {
        c.object_types(&[FILM], false);
    });
    assert_eq!(set(&run(&s, &q)), refs(&[l.ann]));

    let mut q = Query::new();
    q.linked_to(Some(A_AUTHOR), None, |c| {
        c.exact_title("ann");
    });
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra, l.film]));

    let mut q = Query::new();
    q.link_to_any(A_AUTHOR, None);
    q.match_nothing();
    assert!(run(&s, &q).is_empty());
}

#[test]
fn not_needs_two_clauses() {
    let s = store();
    library(&s);
    let mut q = Query::new();
    q.not(|c| {
        c.object_types(&[BOOK], false);
    });
    let err = s.query(&Actor::system(), &q, SortBy::Date, Projection::Refs).unwrap_err();
    assert!(matches!(err, StoreError::MalformedQuery(_)));
}

#[test]
fn title_sort_paging_and_repeatability() {
    let s = store();
    let l = library(&s);
    let q = Query::new();
    let all = s.query(&Actor::system(), &q, SortBy::Title, Projection::Objects).unwrap();
    assert_eq!(all.objrefs(), &[l.ann, l.apple, l.film, l.zebra]);
    assert_eq!(all.object_at(3).unwrap().title().unwrap().text, "Zebra Book");

    let again = s.query(&Actor::system(), &q, SortBy::Title, Projection::Refs).unwrap();
    assert_eq!(again.objrefs(), all.objrefs());

    let desc = s.query(&Actor::system(), &q, SortBy::TitleDesc, Projection::Refs).unwrap();
    assert_eq!(desc.objrefs(), &[l.zebra, l.film, l.apple, l.ann]);

    let mut paged = Query::new();
    paged.offset(1).maximum_results(2);
    let page = s.query(&Actor::system(), &paged, SortBy::Title, Projection::Refs).unwrap();
    assert_eq!(page.objrefs(), &[l.apple, l.film]);
}

#[test]
fn identifiers_and_dates() {
    let s = store();
    let at = Utc::now() - Duration::days(3);
    let mut o = obj("Contact", PERSON, &[10]);
    o.add_attr(Text::new(TextKind::EmailAddress, "Ann@Example.com"), A_EMAIL_ADDRESS);
    o.add_attr(Value::DateTime(DateTimeRange::instant(at)), A_DATE);
    let contact = put(&s, o);
    put(&s, obj("Other", PERSON, &[10]));

    let mut q = Query::new();
    q.identifier(Text::new(TextKind::EmailAddress, " ann@example.com"), Some(A_EMAIL_ADDRESS), None);
    assert_eq!(run(&s, &q).objrefs(), &[contact]);

    let mut q = Query::new();
    q.any_identifier_of_type(TextKind::EmailAddress, None, None);
    assert_eq!(run(&s, &q).objrefs(), &[contact]);

    let mut q = Query::new();
    q.identifier(Text::plain("Contact"), None, None);
    assert!(matches!(
        s.query(&Actor::system(), &q, SortBy::Date, Projection::Refs),
        Err(StoreError::MalformedQuery(_))
    ));

    let mut q = Query::new();
    q.date_range(Some(at - Duration::hours(1)), Some(at + Duration::hours(1)), Some(A_DATE), None);
    assert_eq!(run(&s, &q).objrefs(), &[contact]);

    let mut q = Query::new();
    q.date_range(Some(at + Duration::hours(1)), None, None, None);
    assert!(run(&s, &q).is_empty());
}

#[test]
fn deleted_objects_and_labels() {
    let s = store();
    let l = library(&s);
    s.delete(&Actor::system(), l.apple).unwrap();

    let q = Query::new();
    assert_eq!(set(&run(&s, &q)), refs(&[l.ann, l.zebra, l.film]));

    let mut only = Query::new();
    only.deleted_objects(DeletedObjects::Only);
    assert_eq!(run(&s, &only).objrefs(), &[l.apple]);

    let mut include = Query::new();
    include.deleted_objects(DeletedObjects::Include).all_labels(LabelList::from([10, 30]));
    assert_eq!(run(&s, &include).objrefs(), &[l.apple]);

    let mut any = Query::new();
    any.deleted_objects(DeletedObjects::Include).any_label(LabelList::from([30, 99]));
    assert_eq!(run(&s, &any).objrefs(), &[l.apple]);
}

#[test]
fn results_only_hold_readable_objects() {
    let s = store();
    let l = library(&s);
    let hidden = put(&s, obj("Hidden", BOOK, &[20]));
    let reader = Actor::new(
        7,
        LabelStatements::Ops(OpsStatements::new().statement(Operation::Read, LabelList::from([10]), LabelList::empty())),
    );
    let mut q = Query::new();
    q.object_types(&[BOOK], false);
    let r = s.query(&reader, &q, SortBy::Date, Projection::Refs).unwrap();
    assert_eq!(set(&r), refs(&[l.zebra, l.apple]));
    assert!(!r.objrefs().contains(&hidden));
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra, l.apple, hidden]));
}

#[test]
fn created_by_user() {
    let s = store();
    library(&s);
    let author = Actor::new(
        7,
        LabelStatements::Ops(OpsStatements::new().statement(Operation::Create, LabelList::from([10]), LabelList::empty())),
    );
    let mine = s.create(&author, obj("Mine", BOOK, &[10]), CreateOptions::default()).unwrap().objref.unwrap();
    let mut q = Query::new();
    q.created_by_user(7);
    assert_eq!(run(&s, &q).objrefs(), &[mine]);
}

#[test]
fn type_filter_counts_all_matches() {
    let s = store();
    let l = library(&s);
    let mut q = Query::new();
    q.filter_by_types(&[BOOK], false);
    let r = run(&s, &q);
    assert_eq!(set(&r), refs(&[l.zebra, l.apple]));
    assert_eq!(r.unfiltered_count(), Some(4));
    let counts = r.type_counts().unwrap();
    assert_eq!(counts.get(&BOOK), Some(&2));
    assert_eq!(counts.get(&FILM), Some(&1));
    assert_eq!(counts.get(&PERSON), Some(&1));

    let plain = run(&s, &Query::new());
    assert!(plain.type_counts().is_none());
    assert!(plain.unfiltered_count().is_none());
}

#[test]
fn free_text_ranks_by_relevance() {
    let s = store();
    let l = library(&s);
    let mut w = s.text_index().writer();
    w.start_document(l.zebra.id());
    w.post_terms("zebra book about zebra stripes", None, None, None, 0, 4);
    w.start_document(l.apple.id());
    w.post_terms("apple book with one zebra", None, None, None, 0, 4);
    w.start_document(l.film.id());
    w.post_terms("film", None, None, None, 0, 4);
    w.commit().unwrap();

    let mut q = Query::new();
    q.free_text("zebra", None, None);
    let r = s.query(&Actor::system(), &q, SortBy::Relevance, Projection::Refs).unwrap();
    assert_eq!(r.objrefs(), &[l.zebra, l.apple]);
    assert_eq!(r.highlight_words(), &["zebra".to_string()]);

    q.object_types(&[BOOK], false);
    q.not(|c| {
        c.object_types(&[BOOK], false);
        c.exact_title("zebra book");
    });
    let r = s.query(&Actor::system(), &q, SortBy::Relevance, Projection::Refs).unwrap();
    assert_eq!(r.objrefs(), &[l.apple]);
}

#[test]
fn parent_links_match_descendants_unless_exact() {
    let s = store();
    let region = put(&s, obj("North", PERSON, &[10]));
    let mut c = obj("Harbour Town", PERSON, &[10]);
    c.add_attr(region, A_PARENT);
    let city = put(&s, c);
    let mut st = obj("Quay Street", PERSON, &[10]);
    st.add_attr(city, A_PARENT);
    let street = put(&s, st);

    let mut q = Query::new();
    q.link(region, Some(A_PARENT), None);
    assert_eq!(set(&run(&s, &q)), refs(&[city, street]));

    let mut q = Query::new();
    q.link_exact(region, Some(A_PARENT), None);
    assert_eq!(run(&s, &q).objrefs(), &[city]);
}

#[test]
fn archived_objects_need_asking_for() {
    let s = store();
    let l = library(&s);
    let old = put(&s, obj("Old Book", BOOK, &[10, O_LABEL_ARCHIVED]));

    let mut q = Query::new();
    q.object_types(&[BOOK], false);
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra, l.apple]));

    q.include_archived_objects(true);
    assert_eq!(set(&run(&s, &q)), refs(&[l.zebra, l.apple, old]));
}

#[test]
fn time_intervals_on_creation_and_update() {
    let s = store();
    let l = library(&s);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let current = s.read(&Actor::system(), l.zebra).unwrap();
    let mut changed = (*current).clone();
    changed.add_attr("second edition", A_TITLE);
    let updated = s.update(&Actor::system(), changed).unwrap();
    let at = updated.update_time.unwrap();

    let mut q = Query::new();
    q.constrain_to_time_interval(TimeField::Update, Some(at), None);
    assert_eq!(run(&s, &q).objrefs(), &[l.zebra]);

    let mut q = Query::new();
    q.constrain_to_time_interval(TimeField::Creation, None, Some(at));
    assert_eq!(set(&run(&s, &q)), refs(&[l.ann, l.zebra, l.apple, l.film]));

    let mut q = Query::new();
    q.constrain_to_time_interval(TimeField::Creation, Some(Utc::now() + Duration::hours(1)), None);
    assert!(run(&s, &q).is_empty());
}
