//! File-backed document store.
//!
//! Collections live as newline-delimited JSON under
//! `<root>/<store>/<collection>.jsonl`, one document per line, in insertion
//! order. Filters are equality matches on (dotted) field paths; projections
//! follow the usual include (`1`/`true`) or exclude (`0`/`false`) form.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{DocumentStore, DocumentStoreError, DocumentStream};
use crate::domain::QueryIdentity;

/// JSONL-backed document store
pub struct JsonlDocumentStore {
    /// Directory containing one subdirectory per store
    root: PathBuf,
}

impl JsonlDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a collection file.
    ///
    /// Both names must be single path components; separators and `..` are
    /// rejected so a query cannot read outside the root.
    pub fn collection_path(&self, store: &str, collection: &str) -> Result<PathBuf, DocumentStoreError> {
        check_name("store", store)?;
        check_name("collection", collection)?;
        Ok(self.root.join(store).join(format!("{}.jsonl", collection)))
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), DocumentStoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        || Path::new(name).is_absolute();
    if invalid {
        return Err(DocumentStoreError::InvalidName(format!("{} {:?}", kind, name)));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for JsonlDocumentStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn find(&self, identity: &QueryIdentity) -> Result<DocumentStream, DocumentStoreError> {
        let path = self.collection_path(&identity.store_name, &identity.collection_name)?;
        if !path.exists() {
            return Err(DocumentStoreError::CollectionNotFound(identity.namespace()));
        }

        let filter = identity.filter.clone();
        let projection = identity.projection.clone();
        let stream = jsonl_stream(&path).await?.try_filter_map(move |document| {
            let matched = matches_filter(&document, &filter)
                .then(|| apply_projection(document, &projection));
            futures::future::ready(Ok(matched))
        });

        Ok(Box::pin(stream))
    }
}

/// Stream every document of a JSONL file, in file order.
///
/// Blank lines are skipped; a malformed line ends the stream with an error
/// naming `path:line`.
pub async fn jsonl_stream(path: &Path) -> Result<DocumentStream, DocumentStoreError> {
    let file = File::open(path).await?;
    let lines = BufReader::new(file).lines();

    let stream = futures::stream::unfold(
        (lines, 0u64, path.to_path_buf()),
        |(mut lines, mut line_no, path)| async move {
            loop {
                line_no += 1;
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), (lines, line_no, path))),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str::<Value>(&line).map_err(|e| {
                    DocumentStoreError::Malformed {
                        location: format!("{}:{}", path.display(), line_no),
                        message: e.to_string(),
                    }
                });
                return Some((parsed, (lines, line_no, path)));
            }
        },
    );

    Ok(Box::pin(stream))
}

/// Look up a dotted path (`a.b.c`) in a document
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.as_object()?.get(segment))
}

/// Equality match on every filter field
pub fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(conditions) => conditions
            .iter()
            .all(|(path, expected)| lookup(document, path) == Some(expected)),
        None => filter.is_null(),
    }
}

fn is_truthy(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

/// Apply an include/exclude projection to top-level fields.
///
/// An empty projection returns the document unchanged. Any truthy flag other
/// than on `_id` switches to inclusion mode; `_id` is kept unless excluded.
pub fn apply_projection(document: Value, projection: &Value) -> Value {
    let fields = match projection.as_object() {
        Some(fields) if !fields.is_empty() => fields,
        _ => return document,
    };
    let source = match document {
        Value::Object(source) => source,
        other => return other,
    };

    let inclusive = fields
        .iter()
        .any(|(name, flag)| name != "_id" && is_truthy(flag));
    let id_excluded = fields.get("_id").map(|f| !is_truthy(f)).unwrap_or(false);

    let mut projected = Map::new();
    for (name, value) in source {
        let keep = if name == "_id" {
            !id_excluded
        } else if inclusive {
            fields.get(&name).map(is_truthy).unwrap_or(false)
        } else {
            fields.get(&name).map(is_truthy).unwrap_or(true)
        };
        if keep {
            projected.insert(name, value);
        }
    }
    Value::Object(projected)
}
