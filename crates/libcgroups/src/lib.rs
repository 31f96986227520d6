//! Control groups used by the lifecycle engine: freezing for pause/resume,
//! resource snapshots for `stats`, limit updates and removal on delete.

pub mod common;
pub mod stats;
pub mod v1;
pub mod v2;
