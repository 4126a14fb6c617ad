/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a node inside a job graph (the string key ComfyUI uses).
pub type NodeId = String;
