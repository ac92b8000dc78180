//! passwd-sync: converge local accounts towards a directory of record.
//!
//! The crate exposes the [`Syncer`] trait consumed by a synchronization engine
//! and one backend, [`BusyboxSyncer`], which reads the passwd/group databases
//! and delegates every change to the system account tools
//! (`adduser`, `addgroup`, `usermod`, `userdel`, `groupadd`, `groupdel`).
//!
//! Used by:
//! - The passwd-sync CLI (main.rs)
//! - Integration tests
//! - Fuzz targets (validate, accounts)

pub mod accounts;
pub mod busybox;
pub mod error;
pub mod pubkeys;
pub mod runner;
pub mod syncer;
pub mod types;
pub mod validate;

pub use accounts::{AccountDb, AccountDbConfig, GroupEntry, PasswdEntry};
pub use busybox::{BusyboxSyncer, ToolsConfig};
pub use error::{CommandError, ErrorKind, Step, SyncError, SyncResult};
pub use runner::{CommandRunner, Invocation, RecordingRunner, SystemRunner};
pub use syncer::Syncer;
pub use types::{Group, User};
