pub mod color;
pub mod note;
pub mod task;

/// Table-store row as it crosses the wire. Typed records decode from this at the store boundary.
pub type Row = serde_json::Map<String, serde_json::Value>;
