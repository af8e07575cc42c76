pub mod backup;
pub mod database;
pub mod db;
pub mod domain;
pub mod error;
pub mod remote;
pub mod services;
pub mod settings;
pub mod system;

pub use backup::copy::{CopyProgress, ProgressFn, TaskControl};
pub use backup::engine::{EngineOptions, SnapshotEngine};
pub use backup::store::SnapshotStore;
pub use backup::Checkpoint;
pub use domain::games::{Game, NewGame, UpdateGame};
pub use domain::snapshots::{RestoreFailure, RestoreResult, Snapshot};
pub use error::{CheckpointError, ErrorKind, Result};
pub use remote::{DriveStore, GoogleSession, MemoryRemote, RemoteEntry, RemoteStore, Session};
pub use services::games::GameRegistry;
pub use settings::Settings;
pub use system::{ProcessMonitor, SystemProcessMonitor};
