//! The capability set a synchronization engine drives.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SyncResult;
use crate::types::{Group, User};

/// Converges one local user or group per call.
///
/// `ctx` is the caller's cancellation signal. Lookups (including the
/// existence pre-checks of create/delete) stop with
/// [`crate::SyncError::Cancelled`] when it fires; a mutation that has been
/// started always runs to completion regardless of `ctx` or of the returned
/// future being dropped.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Resolve a user. `Ok(None)` when the name is unknown.
    async fn lookup_user(&self, ctx: &CancellationToken, name: &str) -> SyncResult<Option<User>>;

    /// Resolve a group. `Ok(None)` when the name is unknown.
    async fn lookup_group(&self, ctx: &CancellationToken, name: &str)
    -> SyncResult<Option<Group>>;

    /// Create a user and add it to each of `user.groups`, in order.
    ///
    /// Fails with [`crate::SyncError::UserExists`] if the name resolves.
    /// Only ever adds memberships.
    async fn add_user(&self, ctx: &CancellationToken, user: &User) -> SyncResult<()>;

    /// Delete a user together with its home directory.
    async fn remove_user(&self, ctx: &CancellationToken, name: &str) -> SyncResult<()>;

    async fn set_display_name(
        &self,
        ctx: &CancellationToken,
        name: &str,
        display_name: &str,
    ) -> SyncResult<()>;

    async fn set_primary_group(
        &self,
        ctx: &CancellationToken,
        name: &str,
        group: &str,
    ) -> SyncResult<()>;

    /// Replace the whole supplemental group set. An empty slice clears it.
    async fn set_supplemental_groups(
        &self,
        ctx: &CancellationToken,
        name: &str,
        groups: &[String],
    ) -> SyncResult<()>;

    async fn set_shell(&self, ctx: &CancellationToken, name: &str, shell: &str)
    -> SyncResult<()>;

    /// Replace the user's authorized SSH keys.
    async fn set_pub_keys(
        &self,
        ctx: &CancellationToken,
        name: &str,
        keys: &[String],
    ) -> SyncResult<()>;

    /// Disable password authentication without deleting the account.
    async fn lock_password(&self, ctx: &CancellationToken, name: &str) -> SyncResult<()>;

    /// Create a group with an explicit GID.
    async fn add_group(&self, ctx: &CancellationToken, group: &Group) -> SyncResult<()>;

    async fn remove_group(&self, ctx: &CancellationToken, name: &str) -> SyncResult<()>;
}
