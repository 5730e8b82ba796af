pub mod cli;
pub mod config;
pub mod hash;
pub mod pipeline;
pub mod query;
pub mod source;
pub mod splitter;
pub mod storage;

/// A structured record as it flows between sources, engines and the merge step
pub type Record = serde_json::Map<String, serde_json::Value>;
