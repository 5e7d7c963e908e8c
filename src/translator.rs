//! Turn oplog entries into change events.
use std::sync::Arc;

use bson::{doc, Bson, Document};
use tracing::trace;
use uuid::Uuid;

use crate::cmd_oplog::CmdOplog;
use crate::event::{ChangeEvent, EventKind, EventNamespace, TruncatedArray, UpdateDescription};
use crate::oplog::{OpType, OplogEntry, Position};
use crate::pre_image::PreImageStore;
use crate::resume_token::ResumeTokenData;
use crate::store::DocumentLookup;
use crate::{FeedError, Result, OBJ2_KEY};

/// What a feed asked to see besides the plain events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslateOptions {
    /// attach recorded pre-images to updates, replaces and deletes.
    pub want_pre_images: bool,
    /// look up the current document for updates.
    pub want_post_images: bool,
    /// report index and collMod commands, and create options.
    pub show_expanded_events: bool,
}

/// Translator shared by the cursors of one node.
#[derive(Clone)]
pub struct EventTranslator {
    pre_images: Arc<PreImageStore>,
    lookup: Arc<dyn DocumentLookup>,
    options: TranslateOptions,
}

impl EventTranslator {
    /// A translator reading pre-images from `pre_images` and post-images from `lookup`.
    pub fn new(
        pre_images: Arc<PreImageStore>,
        lookup: Arc<dyn DocumentLookup>,
        options: TranslateOptions,
    ) -> Self {
        EventTranslator {
            pre_images,
            lookup,
            options,
        }
    }

    /// Options of this translator.
    pub fn options(&self) -> TranslateOptions {
        self.options
    }

    /// Translate one logical operation, `None` when it has no user facing event.
    ///
    /// Transaction wrappers must be expanded before, see
    /// [expand_entry](crate::blocking::transaction::expand_entry).
    pub fn translate(&self, entry: &OplogEntry) -> Result<Option<ChangeEvent>> {
        let event = match entry.op {
            OpType::Noop => None,
            OpType::Insert => Some(self.translate_insert(entry)?),
            OpType::Update => Some(self.translate_update(entry)?),
            OpType::Delete => Some(self.translate_delete(entry)),
            OpType::Command => self.translate_command(entry)?,
        };
        if event.is_none() {
            trace!(ts = ?entry.ts, ns = %entry.ns, "Oplog entry has no change event.");
        }
        Ok(event)
    }

    /// The terminal event following the DDL event `trigger`.
    pub fn invalidate_event(&self, trigger: &ChangeEvent) -> ChangeEvent {
        let data = trigger
            .id
            .decode()
            .map(|d| d.position())
            .unwrap_or_else(|_| Position::at(trigger.cluster_time));
        let mut event = self.invalidate_at(data, trigger.collection_uuid);
        event.wall_time = trigger.wall_time;
        event
    }

    /// An invalidate event for a DDL logged at `position`.
    pub fn invalidate_at(&self, position: Position, uuid: Option<Uuid>) -> ChangeEvent {
        let mut data = ResumeTokenData::event(position, uuid, None);
        data.from_invalidate = true;
        ChangeEvent {
            id: data.encode(),
            cluster_time: position.timestamp(),
            wall_time: None,
            ns: None,
            collection_uuid: uuid,
            lsid: None,
            txn_number: None,
            kind: EventKind::Invalidate,
        }
    }

    fn translate_insert(&self, entry: &OplogEntry) -> Result<ChangeEvent> {
        let document_key = entry
            .document_key()
            .ok_or_else(|| missing_field(entry, "_id"))?;
        let kind = EventKind::Insert {
            document_key: document_key.clone(),
            full_document: entry.obj.clone(),
        };
        Ok(self.crud_event(entry, document_key, kind))
    }

    fn translate_update(&self, entry: &OplogEntry) -> Result<ChangeEvent> {
        let document_key = entry
            .document_key()
            .ok_or_else(|| missing_field(entry, OBJ2_KEY))?;
        let pre_image = self.pre_image(entry);

        let kind = match update_description(&entry.obj)? {
            None => EventKind::Replace {
                document_key: document_key.clone(),
                full_document: entry.obj.clone(),
                full_document_before_change: pre_image,
            },
            Some(update_description) => {
                let full_document = if self.options.want_post_images {
                    // a miss is fine: the document may be gone by now.
                    self.lookup.find_by_key(&entry.ns, &document_key)?
                } else {
                    None
                };
                EventKind::Update {
                    document_key: document_key.clone(),
                    update_description,
                    full_document,
                    full_document_before_change: pre_image,
                }
            }
        };
        Ok(self.crud_event(entry, document_key, kind))
    }

    fn translate_delete(&self, entry: &OplogEntry) -> ChangeEvent {
        let document_key = entry.obj.clone();
        let pre_image = self.pre_image(entry);
        let kind = EventKind::Delete {
            document_key: document_key.clone(),
            full_document: pre_image.clone(),
            full_document_before_change: pre_image,
        };
        self.crud_event(entry, document_key, kind)
    }

    fn translate_command(&self, entry: &OplogEntry) -> Result<Option<ChangeEvent>> {
        let cmd = match CmdOplog::from_entry(entry)? {
            Some(cmd) => cmd,
            None => return Ok(None),
        };
        let expanded = self.options.show_expanded_events;
        let (ns, kind) = match &cmd {
            CmdOplog::CreateCollection(ns) => {
                let operation_description = if expanded {
                    let mut options = entry.obj.clone();
                    options.remove("create");
                    Some(options)
                } else {
                    None
                };
                (
                    EventNamespace::collection(&ns.to_namespace()),
                    EventKind::Create {
                        operation_description,
                    },
                )
            }
            CmdOplog::DropCollection(ns) => {
                (EventNamespace::collection(&ns.to_namespace()), EventKind::Drop)
            }
            CmdOplog::RenameCollection {
                from,
                to,
                drop_target,
            } => (
                EventNamespace::collection(&from.to_namespace()),
                EventKind::Rename {
                    to: EventNamespace::collection(&to.to_namespace()),
                    drop_target: *drop_target,
                },
            ),
            CmdOplog::DropDatabase(db) => (EventNamespace::database(db), EventKind::DropDatabase),
            CmdOplog::CreateIndexes { ns, .. } | CmdOplog::CommitIndexBuild { ns, .. }
                if expanded =>
            {
                (
                    EventNamespace::collection(&ns.to_namespace()),
                    EventKind::CreateIndexes {
                        indexes: cmd.index_specs(),
                    },
                )
            }
            CmdOplog::DropIndexes { ns, name } if expanded => (
                EventNamespace::collection(&ns.to_namespace()),
                EventKind::DropIndexes {
                    indexes: vec![doc! {"name": *name}],
                },
            ),
            CmdOplog::CollMod { ns, obj } if expanded => (
                EventNamespace::collection(&ns.to_namespace()),
                EventKind::Modify {
                    operation_description: (*obj).clone(),
                },
            ),
            _ => return Ok(None),
        };
        let data = ResumeTokenData::event(entry.position(), entry.uuid, None);
        Ok(Some(ChangeEvent {
            id: data.encode(),
            cluster_time: entry.ts,
            wall_time: entry.wall,
            ns: Some(ns),
            collection_uuid: entry.uuid,
            lsid: entry.lsid.clone(),
            txn_number: entry.txn_number,
            kind,
        }))
    }

    fn crud_event(&self, entry: &OplogEntry, document_key: Document, kind: EventKind) -> ChangeEvent {
        let data = ResumeTokenData::event(entry.position(), entry.uuid, Some(document_key));
        ChangeEvent {
            id: data.encode(),
            cluster_time: entry.ts,
            wall_time: entry.wall,
            ns: Some(EventNamespace::collection(&entry.ns)),
            collection_uuid: entry.uuid,
            lsid: entry.lsid.clone(),
            txn_number: entry.txn_number,
            kind,
        }
    }

    fn pre_image(&self, entry: &OplogEntry) -> Option<Document> {
        if !self.options.want_pre_images {
            return None;
        }
        // not recorded is not an error, the field is just left out.
        entry
            .uuid
            .and_then(|uuid| self.pre_images.lookup(uuid, entry.position()))
    }
}

fn missing_field(entry: &OplogEntry, field: &str) -> FeedError {
    FeedError::BsonValueError {
        key: field.to_string(),
        val: format!("missing in {} oplog at {}", entry.op.as_str(), entry.position()),
    }
}

/// Delta carried by an update oplog, `None` when the oplog replaces the whole document.
///
/// Two formats exist:
/// - `{$v: 2, diff: {...}}`, see [apply_diff].
/// - modifier style `{$set: {"a.b": 1}, $unset: {"c": true}}`.
pub fn update_description(obj: &Document) -> Result<Option<UpdateDescription>> {
    let mut desc = UpdateDescription::default();
    if let Ok(diff) = obj.get_document("diff") {
        apply_diff(&mut desc, "", diff)?;
        return Ok(Some(desc));
    }
    if !obj.keys().any(|k| k.starts_with('$')) {
        return Ok(None);
    }
    if let Ok(set) = obj.get_document("$set") {
        for (path, value) in set {
            desc.updated_fields.insert(path.clone(), value.clone());
        }
    }
    if let Ok(unset) = obj.get_document("$unset") {
        desc.removed_fields.extend(unset.keys().cloned());
    }
    Ok(Some(desc))
}

/// Walk a `$v: 2` diff.
///
/// - `u`, `i`: updated or inserted fields.
/// - `d`: deleted fields.
/// - `s<field>`: nested diff of a sub document, or of an array when it holds `a: true`.
///   Array diffs carry `l` (new length) and `u<index>` / `s<index>` entries.
fn apply_diff(desc: &mut UpdateDescription, prefix: &str, diff: &Document) -> Result<()> {
    for (key, value) in diff {
        match key.as_str() {
            "u" | "i" => {
                for (field, v) in as_document(key, value)? {
                    desc.updated_fields.insert(join(prefix, field), v.clone());
                }
            }
            "d" => {
                for field in as_document(key, value)?.keys() {
                    desc.removed_fields.push(join(prefix, field));
                }
            }
            _ if key.starts_with('s') => {
                let path = join(prefix, &key[1..]);
                let sub = as_document(key, value)?;
                if sub.get_bool("a").unwrap_or(false) {
                    apply_array_diff(desc, &path, sub)?;
                } else {
                    apply_diff(desc, &path, sub)?;
                }
            }
            _ => {
                return Err(FeedError::BsonValueError {
                    key: key.clone(),
                    val: value.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn apply_array_diff(desc: &mut UpdateDescription, path: &str, diff: &Document) -> Result<()> {
    for (key, value) in diff {
        match key.as_str() {
            "a" => {}
            "l" => {
                let new_size = match value {
                    Bson::Int32(v) => *v as i64,
                    Bson::Int64(v) => *v,
                    other => {
                        return Err(FeedError::BsonValueError {
                            key: "l".to_string(),
                            val: other.to_string(),
                        })
                    }
                };
                desc.truncated_arrays.push(TruncatedArray {
                    field: path.to_string(),
                    new_size,
                });
            }
            _ if key.starts_with('u') => {
                desc.updated_fields
                    .insert(join(path, &key[1..]), value.clone());
            }
            _ if key.starts_with('s') => {
                let sub = as_document(key, value)?;
                let sub_path = join(path, &key[1..]);
                if sub.get_bool("a").unwrap_or(false) {
                    apply_array_diff(desc, &sub_path, sub)?;
                } else {
                    apply_diff(desc, &sub_path, sub)?;
                }
            }
            _ => {
                return Err(FeedError::BsonValueError {
                    key: key.clone(),
                    val: value.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn as_document<'a>(key: &str, value: &'a Bson) -> Result<&'a Document> {
    value.as_document().ok_or_else(|| FeedError::BsonValueError {
        key: key.to_string(),
        val: value.to_string(),
    })
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}
