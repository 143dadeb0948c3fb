use serde_json::Value;

const COLLECTION_FIELDS: &[&str] = &["data", "items", "results", "records"];

/// Number of business records in an API response body.
///
/// A JSON array counts its elements; an envelope object counts the array under
/// `data`, `items`, `results` or `records`; any other JSON value is one record.
/// Bodies that are not JSON hold no records.
pub fn count_records(body: &[u8]) -> u64 {
  let Ok(value) = serde_json::from_slice::<Value>(body) else {
    return 0;
  };

  match &value {
    Value::Array(items) => items.len() as u64,
    Value::Object(map) => COLLECTION_FIELDS
      .iter()
      .find_map(|field| map.get(*field).and_then(Value::as_array))
      .map(|items| items.len() as u64)
      .unwrap_or(1),
    _ => 1,
  }
}
