//! Backend for hosts with busybox-style account tools.
//!
//! Reads current state from the passwd/group databases and applies every
//! change through external commands:
//!
//! | change              | command                                               |
//! |---------------------|-------------------------------------------------------|
//! | create user         | `adduser -c DISPLAY -G GROUP -s SHELL -u UID -D NAME` |
//! | add membership      | `addgroup NAME GROUP`                                 |
//! | delete user         | `userdel -f -r NAME`                                  |
//! | modify attribute    | `usermod FLAG [VALUE] NAME`                           |
//! | create group        | `groupadd -g GID NAME`                                |
//! | delete group        | `groupdel NAME`                                       |
//!
//! Pre-checks exist only where firing twice would be destructive
//! (create/delete). Attribute setters rely on the tool failing for an unknown
//! account.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountDb;
use crate::error::{Step, SyncError, SyncResult};
use crate::pubkeys;
use crate::runner::{CommandRunner, Invocation, SystemRunner};
use crate::syncer::Syncer;
use crate::types::{Group, User};
use crate::validate::{
    validate_display_name, validate_group_list, validate_name, validate_pub_key, validate_shell,
};

/// Program names (or absolute paths) of the account tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub adduser: String,
    pub addgroup: String,
    pub userdel: String,
    pub usermod: String,
    pub groupadd: String,
    pub groupdel: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            adduser: "adduser".to_string(),
            addgroup: "addgroup".to_string(),
            userdel: "userdel".to_string(),
            usermod: "usermod".to_string(),
            groupadd: "groupadd".to_string(),
            groupdel: "groupdel".to_string(),
        }
    }
}

/// The ordered commands of one operation, built fresh per call.
struct Mutation {
    runner: Arc<dyn CommandRunner>,
    steps: Vec<(Step, Invocation)>,
}

impl Mutation {
    /// Run the steps in order, stopping at the first failure.
    async fn apply(self) -> SyncResult<()> {
        for (step, invocation) in self.steps {
            debug!("{step}: {invocation}");
            self.runner
                .run(&invocation)
                .await
                .map_err(|source| SyncError::Command { step, source })?;
        }
        Ok(())
    }
}

/// Run `task` on its own tokio task and wait for it.
///
/// The caller's token is never handed to `task`, and dropping the returned
/// future leaves the spawned task running.
async fn detached<F>(task: F) -> SyncResult<()>
where
    F: Future<Output = SyncResult<()>> + Send + 'static,
{
    tokio::spawn(task)
        .await
        .map_err(|e| SyncError::Aborted(e.to_string()))?
}

/// Await a read-only lookup unless `ctx` fires first.
async fn cancellable<T, F>(ctx: &CancellationToken, lookup: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(SyncError::Cancelled),
        result = lookup => result,
    }
}

/// Syncs local users and groups using busybox-style account tools.
#[derive(Clone)]
pub struct BusyboxSyncer {
    runner: Arc<dyn CommandRunner>,
    db: AccountDb,
    tools: ToolsConfig,
}

impl BusyboxSyncer {
    /// Backend executing real commands against `db`.
    pub fn new(db: AccountDb) -> Self {
        Self::with_runner(db, Arc::new(SystemRunner))
    }

    /// Backend with a substituted command executor.
    pub fn with_runner(db: AccountDb, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            db,
            tools: ToolsConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolsConfig) -> Self {
        self.tools = tools;
        self
    }

    pub fn account_db(&self) -> &AccountDb {
        &self.db
    }

    pub fn tools(&self) -> &ToolsConfig {
        &self.tools
    }

    pub fn create_user_command(&self, user: &User) -> Invocation {
        Invocation::new(&self.tools.adduser)
            .args([
                "-c",
                user.display_name.as_str(),
                "-G",
                user.group.as_str(),
                "-s",
                user.shell.as_str(),
                "-u",
            ])
            .arg(user.uid.to_string())
            .arg("-D")
            .arg(&user.name)
    }

    pub fn add_membership_command(&self, name: &str, group: &str) -> Invocation {
        Invocation::new(&self.tools.addgroup).args([name, group])
    }

    pub fn delete_user_command(&self, name: &str) -> Invocation {
        Invocation::new(&self.tools.userdel).args(["-f", "-r", name])
    }

    /// `usermod FLAG [VALUE] NAME`
    pub fn usermod_command(&self, flag: &str, value: Option<&str>, name: &str) -> Invocation {
        let mut invocation = Invocation::new(&self.tools.usermod).arg(flag);
        if let Some(value) = value {
            invocation = invocation.arg(value);
        }
        invocation.arg(name)
    }

    pub fn create_group_command(&self, group: &Group) -> Invocation {
        Invocation::new(&self.tools.groupadd)
            .arg("-g")
            .arg(group.gid.to_string())
            .arg(&group.name)
    }

    pub fn delete_group_command(&self, name: &str) -> Invocation {
        Invocation::new(&self.tools.groupdel).arg(name)
    }

    fn mutation(&self, steps: Vec<(Step, Invocation)>) -> Mutation {
        Mutation {
            runner: Arc::clone(&self.runner),
            steps,
        }
    }

    async fn modify_user(
        &self,
        name: &str,
        attribute: &'static str,
        flag: &str,
        value: Option<&str>,
    ) -> SyncResult<()> {
        validate_name(name).map_err(SyncError::InvalidInput)?;

        info!("Setting {} of user '{}'", attribute, name);
        let step = Step::ModifyUser {
            user: name.to_string(),
            attribute,
        };
        let invocation = self.usermod_command(flag, value, name);
        detached(self.mutation(vec![(step, invocation)]).apply()).await
    }
}

#[async_trait]
impl Syncer for BusyboxSyncer {
    async fn lookup_user(&self, ctx: &CancellationToken, name: &str) -> SyncResult<Option<User>> {
        cancellable(ctx, self.db.lookup_user(name)).await
    }

    async fn lookup_group(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> SyncResult<Option<Group>> {
        cancellable(ctx, self.db.lookup_group(name)).await
    }

    async fn add_user(&self, ctx: &CancellationToken, user: &User) -> SyncResult<()> {
        validate_name(&user.name).map_err(SyncError::InvalidInput)?;
        validate_name(&user.group)
            .map_err(|e| SyncError::InvalidInput(format!("primary group: {e}")))?;
        validate_display_name(&user.display_name).map_err(SyncError::InvalidInput)?;
        validate_shell(&user.shell).map_err(SyncError::InvalidInput)?;
        validate_group_list(&user.groups).map_err(SyncError::InvalidInput)?;

        if cancellable(ctx, self.db.passwd_entry(&user.name))
            .await?
            .is_some()
        {
            return Err(SyncError::UserExists(user.name.clone()));
        }

        info!(
            "Creating user '{}' with UID {} (group '{}', {} supplemental)",
            user.name,
            user.uid,
            user.group,
            user.groups.len()
        );

        let mut steps = Vec::with_capacity(user.groups.len() + 1);
        steps.push((
            Step::CreateUser {
                user: user.name.clone(),
            },
            self.create_user_command(user),
        ));
        for group in &user.groups {
            steps.push((
                Step::AddMembership {
                    user: user.name.clone(),
                    group: group.clone(),
                },
                self.add_membership_command(&user.name, group),
            ));
        }

        detached(self.mutation(steps).apply()).await
    }

    async fn remove_user(&self, ctx: &CancellationToken, name: &str) -> SyncResult<()> {
        validate_name(name).map_err(SyncError::InvalidInput)?;

        if cancellable(ctx, self.db.passwd_entry(name)).await?.is_none() {
            return Err(SyncError::UserNotFound(name.to_string()));
        }

        info!("Deleting user '{}' and its home directory", name);
        let step = Step::DeleteUser {
            user: name.to_string(),
        };
        let invocation = self.delete_user_command(name);
        detached(self.mutation(vec![(step, invocation)]).apply()).await
    }

    async fn set_display_name(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        display_name: &str,
    ) -> SyncResult<()> {
        validate_display_name(display_name).map_err(SyncError::InvalidInput)?;
        self.modify_user(name, "display name", "-c", Some(display_name))
            .await
    }

    async fn set_primary_group(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        group: &str,
    ) -> SyncResult<()> {
        validate_name(group).map_err(|e| SyncError::InvalidInput(format!("primary group: {e}")))?;
        self.modify_user(name, "primary group", "-g", Some(group))
            .await
    }

    async fn set_supplemental_groups(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        groups: &[String],
    ) -> SyncResult<()> {
        validate_group_list(groups).map_err(SyncError::InvalidInput)?;
        let joined = groups.join(",");
        self.modify_user(name, "supplemental groups", "-G", Some(&joined))
            .await
    }

    async fn set_shell(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        shell: &str,
    ) -> SyncResult<()> {
        validate_shell(shell).map_err(SyncError::InvalidInput)?;
        self.modify_user(name, "shell", "-s", Some(shell)).await
    }

    async fn set_pub_keys(
        &self,
        ctx: &CancellationToken,
        name: &str,
        keys: &[String],
    ) -> SyncResult<()> {
        validate_name(name).map_err(SyncError::InvalidInput)?;
        for key in keys {
            validate_pub_key(key).map_err(SyncError::InvalidInput)?;
        }

        let entry = cancellable(ctx, self.db.passwd_entry(name))
            .await?
            .ok_or_else(|| SyncError::UserNotFound(name.to_string()))?;

        let user = entry.name;
        let home: PathBuf = entry.home;
        let (uid, gid) = (entry.uid, entry.gid);
        let keys = keys.to_vec();

        // spawn_blocking tasks are not aborted when the handle is dropped
        tokio::task::spawn_blocking(move || {
            pubkeys::save_pub_keys(&home, uid, gid, &keys)
                .map_err(|source| SyncError::PubKeys { user, source })
        })
        .await
        .map_err(|e| SyncError::Aborted(e.to_string()))?
    }

    async fn lock_password(&self, _ctx: &CancellationToken, name: &str) -> SyncResult<()> {
        self.modify_user(name, "password lock", "-L", None).await
    }

    async fn add_group(&self, ctx: &CancellationToken, group: &Group) -> SyncResult<()> {
        validate_name(&group.name).map_err(SyncError::InvalidInput)?;

        if cancellable(ctx, self.db.group_entry(&group.name))
            .await?
            .is_some()
        {
            return Err(SyncError::GroupExists(group.name.clone()));
        }

        info!("Creating group '{}' with GID {}", group.name, group.gid);
        let step = Step::CreateGroup {
            group: group.name.clone(),
        };
        let invocation = self.create_group_command(group);
        detached(self.mutation(vec![(step, invocation)]).apply()).await
    }

    async fn remove_group(&self, ctx: &CancellationToken, name: &str) -> SyncResult<()> {
        validate_name(name).map_err(SyncError::InvalidInput)?;

        if cancellable(ctx, self.db.group_entry(name)).await?.is_none() {
            return Err(SyncError::GroupNotFound(name.to_string()));
        }

        info!("Deleting group '{}'", name);
        let step = Step::DeleteGroup {
            group: name.to_string(),
        };
        let invocation = self.delete_group_command(name);
        detached(self.mutation(vec![(step, invocation)]).apply()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;

    fn syncer() -> (BusyboxSyncer, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        let syncer = BusyboxSyncer::with_runner(AccountDb::default(), runner.clone());
        (syncer, runner)
    }

    fn new_user() -> User {
        User {
            name: "newuser".to_string(),
            uid: 1000,
            display_name: "displayName".to_string(),
            group: "usersgroup".to_string(),
            shell: "/sbin/nologin".to_string(),
            groups: vec!["group1".to_string(), "group2".to_string()],
        }
    }

    #[test]
    fn test_create_user_command() {
        let (syncer, _) = syncer();
        assert_eq!(
            syncer.create_user_command(&new_user()).to_string(),
            "adduser -c displayName -G usersgroup -s /sbin/nologin -u 1000 -D newuser"
        );
    }

    #[test]
    fn test_display_name_with_spaces_stays_one_argument() {
        let (syncer, _) = syncer();
        let user = User {
            display_name: "Jane Doe".to_string(),
            ..new_user()
        };
        let inv = syncer.create_user_command(&user);
        assert_eq!(inv.args[1], "Jane Doe");
        assert_eq!(inv.args.len(), 10);
    }

    #[test]
    fn test_other_commands() {
        let (syncer, _) = syncer();
        assert_eq!(
            syncer.add_membership_command("newuser", "group1").to_string(),
            "addgroup newuser group1"
        );
        assert_eq!(
            syncer.delete_user_command("olduser").to_string(),
            "userdel -f -r olduser"
        );
        assert_eq!(
            syncer.usermod_command("-L", None, "alice").to_string(),
            "usermod -L alice"
        );
        assert_eq!(
            syncer
                .create_group_command(&Group {
                    name: "devs".to_string(),
                    gid: 1500
                })
                .to_string(),
            "groupadd -g 1500 devs"
        );
        assert_eq!(syncer.delete_group_command("devs").to_string(), "groupdel devs");
    }

    #[test]
    fn test_custom_tool_paths() {
        let (syncer, _) = syncer();
        let syncer = syncer.with_tools(ToolsConfig {
            userdel: "/usr/sbin/userdel".to_string(),
            ..Default::default()
        });
        assert_eq!(
            syncer.delete_user_command("olduser").to_string(),
            "/usr/sbin/userdel -f -r olduser"
        );
    }

    #[tokio::test]
    async fn test_setters_issue_one_usermod_each() {
        let (syncer, runner) = syncer();
        let ctx = CancellationToken::new();

        syncer.set_display_name(&ctx, "alice", "Alice A").await.unwrap();
        syncer.set_primary_group(&ctx, "alice", "staff").await.unwrap();
        syncer.set_shell(&ctx, "alice", "/bin/ash").await.unwrap();
        syncer.lock_password(&ctx, "alice").await.unwrap();

        let executed = runner.executed();
        assert_eq!(executed.len(), 4);
        assert_eq!(executed[0].args, vec!["-c", "Alice A", "alice"]);
        assert_eq!(executed[1].to_string(), "usermod -g staff alice");
        assert_eq!(executed[2].to_string(), "usermod -s /bin/ash alice");
        assert_eq!(executed[3].to_string(), "usermod -L alice");
    }

    #[tokio::test]
    async fn test_set_supplemental_groups_joins_with_comma() {
        let (syncer, runner) = syncer();
        let ctx = CancellationToken::new();
        let groups = vec!["wheel".to_string(), "docker".to_string()];

        syncer
            .set_supplemental_groups(&ctx, "alice", &groups)
            .await
            .unwrap();

        assert_eq!(runner.command_lines(), vec!["usermod -G wheel,docker alice"]);
    }

    #[tokio::test]
    async fn test_set_supplemental_groups_empty_clears() {
        let (syncer, runner) = syncer();
        let ctx = CancellationToken::new();

        syncer
            .set_supplemental_groups(&ctx, "alice", &[])
            .await
            .unwrap();

        let executed = runner.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].args, vec!["-G", "", "alice"]);
    }

    #[tokio::test]
    async fn test_setter_failure_reports_attribute() {
        let runner = Arc::new(RecordingRunner::failing_on("usermod"));
        let syncer = BusyboxSyncer::with_runner(AccountDb::default(), runner);
        let ctx = CancellationToken::new();

        let err = syncer.set_shell(&ctx, "ghost", "/bin/sh").await.unwrap_err();
        assert_eq!(
            err.step(),
            Some(&Step::ModifyUser {
                user: "ghost".to_string(),
                attribute: "shell"
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_input_issues_no_commands() {
        let (syncer, runner) = syncer();
        let ctx = CancellationToken::new();

        let err = syncer.set_shell(&ctx, "-r", "/bin/sh").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        let err = syncer
            .set_display_name(&ctx, "alice", "x:0:0")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        let err = syncer
            .set_supplemental_groups(&ctx, "alice", &["a,b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        assert!(runner.executed().is_empty());
    }

    #[tokio::test]
    async fn test_setters_ignore_cancelled_context() {
        let (syncer, runner) = syncer();
        let ctx = CancellationToken::new();
        ctx.cancel();

        syncer.lock_password(&ctx, "alice").await.unwrap();
        assert_eq!(runner.command_lines(), vec!["usermod -L alice"]);
    }
}
