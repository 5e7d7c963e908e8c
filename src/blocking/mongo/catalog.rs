use bson::{doc, Bson, Document};
use mongodb::sync::Client;
use uuid::Uuid;

use crate::bson_helper;
use crate::namespace::Namespace;
use crate::store::{Catalog, DocumentLookup};
use crate::Result;

/// Catalog and document lookups of a live deployment.
#[derive(Debug, Clone)]
pub struct MongoCatalog {
    client: Client,
}

impl MongoCatalog {
    /// Catalog read through `client`.
    pub fn new(client: Client) -> Self {
        MongoCatalog { client }
    }

    /// Connect to `uri`.
    pub fn connect(uri: &str) -> Result<Self> {
        Ok(MongoCatalog::new(Client::with_uri_str(uri)?))
    }

    /// `listCollections` entry of `ns`.
    ///
    /// Collection info object:
    /// { name: `collection_name`, type: "collection" | "view", options: {viewOn: ..}, info: {uuid: `uuid`} }
    fn collection_spec(&self, ns: &Namespace) -> Result<Option<Document>> {
        let reply = self.client.database(&ns.db).run_command(
            doc! {"listCollections": 1, "filter": {"name": ns.coll.clone()}},
            None,
        )?;
        let first = reply
            .get_document("cursor")?
            .get_array("firstBatch")?
            .iter()
            .find_map(|spec| match spec {
                Bson::Document(spec) => Some(spec.clone()),
                _ => None,
            });
        Ok(first)
    }
}

impl Catalog for MongoCatalog {
    fn collection_uuid(&self, ns: &Namespace) -> Result<Option<Uuid>> {
        let spec = match self.collection_spec(ns)? {
            Some(spec) => spec,
            None => return Ok(None),
        };
        if spec.get_str("type").unwrap_or("collection") != "collection" {
            return Ok(None);
        }
        Ok(bson_helper::get_optional_uuid(spec.get_document("info")?, "uuid")?)
    }

    fn view_source(&self, ns: &Namespace) -> Result<Option<Namespace>> {
        let spec = match self.collection_spec(ns)? {
            Some(spec) => spec,
            None => return Ok(None),
        };
        if spec.get_str("type").unwrap_or("collection") != "view" {
            return Ok(None);
        }
        let view_on = spec.get_document("options")?.get_str("viewOn")?;
        Ok(Some(Namespace::new(ns.db.clone(), view_on)))
    }
}

impl DocumentLookup for MongoCatalog {
    fn find_by_key(&self, ns: &Namespace, key: &Document) -> Result<Option<Document>> {
        Ok(self
            .client
            .database(&ns.db)
            .collection::<Document>(&ns.coll)
            .find_one(key.clone(), None)?)
    }
}
