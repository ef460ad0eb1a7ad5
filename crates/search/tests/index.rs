use std::sync::Arc;

use vellum_persist::{Db, StoreConfig};
use vellum_search::{field_prefix, Scope, TextIndex, TextQuery, Visibility};

fn temp_db() -> String {
    let dir = std::env::temp_dir();
    let f = format!("vellum-search-it-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
    dir.join(f).to_string_lossy().to_string()
}

fn db() -> Arc<Db> {
    Arc::new(Db::open(StoreConfig::default().with_db_path(temp_db())).unwrap())
}

fn docs(idx: &TextIndex, q: &str, scope: Scope) -> Vec<i64> {
    idx.search(&TextQuery::parse(q), scope, &Visibility::superuser()).unwrap().iter().map(|h| h.doc).collect()
}

#[test]
fn heavier_postings_rank_first() {
    let idx = TextIndex::open(db(), 1).unwrap();
    let mut w = idx.writer();
    w.start_document(1);
    w.post_terms("annual report", None, None, None, 0, 4);
    w.start_document(2);
    w.post_terms("annual report", None, None, None, 0, 12);
    w.start_document(3);
    w.post_terms("annual budget", None, None, None, 0, 4);
    w.commit().unwrap();

    assert_eq!(docs(&idx, "report", Scope::Full), vec![2, 1]);
    assert_eq!(docs(&idx, "annual", Scope::Full), vec![2, 3, 1]);
}

#[test]
fn reposting_a_document_replaces_its_terms() {
    let idx = TextIndex::open(db(), 1).unwrap();
    let mut w = idx.writer();
    w.start_document(7);
    w.post_terms("draft agenda", None, None, None, 0, 4);
    w.commit().unwrap();

    let mut w = idx.writer();
    w.start_document(7);
    w.post_terms("final minutes", None, None, None, 0, 4);
    w.commit().unwrap();

    assert!(docs(&idx, "agenda", Scope::Full).is_empty());
    assert_eq!(docs(&idx, "minutes", Scope::Full), vec![7]);
    assert_eq!(idx.document_count().unwrap(), 1);
}

#[test]
fn fields_index_separates_descriptors_and_qualifiers() {
    let idx = TextIndex::open(db(), 1).unwrap();
    let plain = field_prefix(300, None);
    let qualified = field_prefix(300, Some(5));
    let other = field_prefix(301, None);
    let mut w = idx.writer();
    w.start_document(1);
    w.post_terms("harbour", None, Some(&plain), Some(&qualified), 0, 4);
    w.start_document(2);
    w.post_terms("harbour", None, Some(&plain), None, 0, 4);
    w.start_document(3);
    w.post_terms("harbour", None, Some(&other), None, 0, 4);
    w.commit().unwrap();

    assert_eq!(docs(&idx, "harbour", Scope::Field { desc: 300, qual: None }), vec![2, 1]);
    assert_eq!(docs(&idx, "harbour", Scope::Field { desc: 300, qual: Some(5) }), vec![1]);
    assert_eq!(docs(&idx, "harbour", Scope::Field { desc: 301, qual: None }), vec![3]);
    assert_eq!(docs(&idx, "harbour", Scope::Full), vec![3, 2, 1]);
}

#[test]
fn prefix_terms_and_applications_are_isolated() {
    let shared = db();
    let one = TextIndex::open(shared.clone(), 1).unwrap();
    let two = TextIndex::open(shared, 2).unwrap();
    let mut w = one.writer();
    w.start_document(1);
    w.post_terms("procurement", None, None, None, 0, 4);
    w.commit().unwrap();

    assert_eq!(docs(&one, "procure*", Scope::Full), vec![1]);
    assert!(docs(&one, "procure", Scope::Full).is_empty());
    assert!(docs(&two, "procure*", Scope::Full).is_empty());
    assert_eq!(two.document_count().unwrap(), 0);
}
