use std::collections::BTreeMap;

use bson::{Bson, Document};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::key_string;
use crate::namespace::Namespace;
use crate::store::{Catalog, DocumentLookup};
use crate::Result;

#[derive(Debug, Clone)]
pub(crate) struct CollectionEntry {
    pub(crate) uuid: Uuid,
    pub(crate) pre_images: bool,
    /// documents keyed by the key string of their `_id`.
    docs: BTreeMap<Vec<u8>, Document>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<Namespace, CollectionEntry>,
    views: BTreeMap<Namespace, Namespace>,
}

/// Collections, views and documents of an in-memory member.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    inner: RwLock<Inner>,
}

impl InMemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        InMemoryCatalog::default()
    }

    /// Does `ns` name a collection?
    pub fn exists(&self, ns: &Namespace) -> bool {
        self.inner.read().collections.contains_key(ns)
    }

    /// Names of the collections of `db`.
    pub fn collections_in(&self, db: &str) -> Vec<Namespace> {
        self.inner
            .read()
            .collections
            .keys()
            .filter(|ns| ns.db == db)
            .cloned()
            .collect()
    }

    /// Is pre-image recording on for `ns`?
    pub fn pre_images_enabled(&self, ns: &Namespace) -> bool {
        self.inner
            .read()
            .collections
            .get(ns)
            .map(|c| c.pre_images)
            .unwrap_or(false)
    }

    /// Number of documents in `ns`.
    pub fn count(&self, ns: &Namespace) -> usize {
        self.inner
            .read()
            .collections
            .get(ns)
            .map(|c| c.docs.len())
            .unwrap_or(0)
    }

    /// The document of `ns` with this `_id`.
    pub fn find(&self, ns: &Namespace, id: &Bson) -> Option<Document> {
        self.inner
            .read()
            .collections
            .get(ns)
            .and_then(|c| c.docs.get(&key_string::encode_value(id)).cloned())
    }

    pub(crate) fn collection(&self, ns: &Namespace) -> Option<CollectionEntry> {
        self.inner.read().collections.get(ns).cloned()
    }

    pub(crate) fn create(&self, ns: Namespace, uuid: Uuid, pre_images: bool) {
        self.inner.write().collections.insert(
            ns,
            CollectionEntry {
                uuid,
                pre_images,
                docs: BTreeMap::new(),
            },
        );
    }

    pub(crate) fn drop_collection(&self, ns: &Namespace) -> Option<Uuid> {
        let mut inner = self.inner.write();
        inner.views.remove(ns);
        inner.collections.remove(ns).map(|c| c.uuid)
    }

    pub(crate) fn rename(&self, from: &Namespace, to: Namespace) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.collections.remove(from) {
            inner.collections.insert(to, entry);
        }
    }

    pub(crate) fn set_pre_images(&self, ns: &Namespace, enabled: bool) {
        if let Some(c) = self.inner.write().collections.get_mut(ns) {
            c.pre_images = enabled;
        }
    }

    pub(crate) fn add_view(&self, view: Namespace, source: Namespace) {
        self.inner.write().views.insert(view, source);
    }

    /// Insert or overwrite a document, keyed by its `_id`.
    pub(crate) fn put(&self, ns: &Namespace, id: &Bson, doc: Document) {
        if let Some(c) = self.inner.write().collections.get_mut(ns) {
            c.docs.insert(key_string::encode_value(id), doc);
        }
    }

    pub(crate) fn remove(&self, ns: &Namespace, id: &Bson) -> Option<Document> {
        self.inner
            .write()
            .collections
            .get_mut(ns)
            .and_then(|c| c.docs.remove(&key_string::encode_value(id)))
    }
}

impl Catalog for InMemoryCatalog {
    fn collection_uuid(&self, ns: &Namespace) -> Result<Option<Uuid>> {
        Ok(self.inner.read().collections.get(ns).map(|c| c.uuid))
    }

    fn view_source(&self, ns: &Namespace) -> Result<Option<Namespace>> {
        Ok(self.inner.read().views.get(ns).cloned())
    }
}

impl DocumentLookup for InMemoryCatalog {
    fn find_by_key(&self, ns: &Namespace, key: &Document) -> Result<Option<Document>> {
        Ok(key.get("_id").and_then(|id| self.find(ns, id)))
    }
}
