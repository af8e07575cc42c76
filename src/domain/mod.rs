pub mod games;
pub mod snapshots;
