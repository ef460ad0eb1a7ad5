use vellum_core::{AppId, LabelChanges, ObjRef, StoreError, StoredObject};
use vellum_schema::is_schema_object;

/// The kind of write a delegate hook is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectChange {
    Create,
    Update,
    Relabel,
    Erase,
}

/// Application hooks around store operations. Every method has a default
/// so an application only overrides what it uses.
pub trait StoreDelegate: Send + Sync {
    /// Adjust the labels a write will apply. `previous` is the stored
    /// revision for updates and relabels.
    fn update_label_changes_for(
        &self,
        _change: ObjectChange,
        _obj: &StoredObject,
        _previous: Option<&StoredObject>,
        _is_schema: bool,
        _changes: &mut LabelChanges,
    ) {
    }

    /// Called after the write has committed.
    fn post_object_change(&self, _change: ObjectChange, _obj: &StoredObject, _previous: Option<&StoredObject>) {}

    fn is_schema_obj(&self, obj: &StoredObject) -> bool {
        is_schema_object(obj)
    }

    /// The form of an object handed to the text indexer. Return `None` to
    /// index it as stored.
    fn indexed_version_of_object(&self, _obj: &StoredObject) -> Option<StoredObject> {
        None
    }

    /// Adjust a pseudo-object extracted from an attribute group before it
    /// is indexed. Its labels start as the containing object's.
    fn label_extracted_object_group(&self, _group: &mut StoredObject, _container: &StoredObject) {}

    fn textidx_exception_indexing_object(&self, _app: AppId, _objref: ObjRef, _err: &StoreError) {}

    fn notify_schema_changed(&self, _app: AppId) {}
}

/// Delegate with every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDelegate;

impl StoreDelegate for DefaultDelegate {}
