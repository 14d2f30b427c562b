//! The two incremental extraction pipelines. Both share one design:
//! load the domain checkpoint, filter for records strictly newer than it,
//! forward what matches, and commit the checkpoint only after a run that
//! actually handed records off.

pub mod db;
pub mod logs;

pub use db::DbExtractor;
pub use logs::LogExtractor;
