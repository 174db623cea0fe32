use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use serde_json::Map;
use serde_json::Value;

use crate::db::Condition;
use crate::db::Filter;
use crate::db::UpdateOp;
use crate::models::DocId;

pub const ID_FIELD: &str = "_id";

/// Text form of a document identity, as used for the primary key column.
pub fn id_key(value: &Value) -> Option<String> {
  match value {
    Value::Number(number) => number.as_i64().map(|v| v.to_string()),
    Value::String(text) => Some(text.clone()),
    _ => None,
  }
}

pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split('.')
    .try_fold(document, |current, segment| current.as_object()?.get(segment))
}

pub fn matches(document: &Value, filter: &Filter) -> bool {
  filter.conditions().iter().all(|(path, condition)| {
    let field = lookup(document, path).unwrap_or(&Value::Null);
    if path == ID_FIELD {
      let key = id_key(field);
      return match condition {
        Condition::Eq(value) => key.is_some() && key == id_key(value),
        Condition::In(values) => key.is_some() && values.iter().any(|value| id_key(value) == key),
      };
    }
    match condition {
      Condition::Eq(value) => field == value,
      Condition::In(values) => values.contains(field),
    }
  })
}

fn set_path(document: &mut Value, path: &str, value: Value) -> Result<()> {
  let segments: Vec<&str> = path.split('.').collect();
  let (last, parents) = segments.split_last().ok_or_else(|| anyhow!("empty field path"))?;
  let mut current = document;
  for segment in parents {
    if current.is_null() {
      *current = Value::Object(Map::new());
    }
    let object = current
      .as_object_mut()
      .ok_or_else(|| anyhow!("cannot set {path}: {segment} is not an object"))?;
    current = object.entry(segment.to_string()).or_insert(Value::Null);
  }
  if current.is_null() {
    *current = Value::Object(Map::new());
  }
  let object = current
    .as_object_mut()
    .ok_or_else(|| anyhow!("cannot set {path}: parent is not an object"))?;
  object.insert(last.to_string(), value);
  Ok(())
}

pub fn apply_update(document: &mut Value, update: &UpdateOp) -> Result<()> {
  match update {
    UpdateOp::Set(fields) => {
      for (path, value) in fields {
        set_path(document, path, value.clone())?;
      }
    },
    UpdateOp::Inc(fields) => {
      for (path, delta) in fields {
        let current = match lookup(document, path) {
          None | Some(Value::Null) => 0,
          Some(value) => value
            .as_i64()
            .ok_or_else(|| anyhow!("cannot increment non-integer field {path}"))?,
        };
        let next = current
          .checked_add(*delta)
          .ok_or_else(|| anyhow!("increment of {path} overflows"))?;
        set_path(document, path, Value::from(next))?;
      }
    },
  }
  Ok(())
}

/// Starting document for an upsert: the filter's equality fields.
pub fn seed_from_filter(filter: &Filter) -> Result<Value> {
  let mut document = Value::Object(Map::new());
  for (path, condition) in filter.conditions() {
    if let Condition::Eq(value) = condition {
      set_path(&mut document, path, value.clone())?;
    }
  }
  Ok(document)
}

/// Drops a null `_id`, generating one when absent. Returns the primary key.
pub fn prepare_insert(document: &mut Value) -> Result<String> {
  let Some(object) = document.as_object_mut() else {
    bail!("only objects can be stored");
  };
  if object.get(ID_FIELD).is_none_or(Value::is_null) {
    object.remove(ID_FIELD);
    object.insert(ID_FIELD.to_string(), serde_json::to_value(DocId::generate())?);
  }
  object
    .get(ID_FIELD)
    .and_then(id_key)
    .ok_or_else(|| anyhow!("unsupported _id value"))
}
