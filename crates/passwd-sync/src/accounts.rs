//! Read-only access to the local passwd and group databases.
//!
//! Every lookup re-reads the files; nothing is cached between calls. A name
//! that does not resolve is `Ok(None)`, not an error.

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{SyncError, SyncResult};
use crate::types::{Group, User};

/// Default location of the user database.
pub const DEFAULT_PASSWD_FILE: &str = "/etc/passwd";

/// Default location of the group database.
pub const DEFAULT_GROUP_FILE: &str = "/etc/group";

/// Where the account database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountDbConfig {
    /// Path to the passwd file.
    pub passwd_file: PathBuf,
    /// Path to the group file.
    pub group_file: PathBuf,
}

impl Default for AccountDbConfig {
    fn default() -> Self {
        Self {
            passwd_file: PathBuf::from(DEFAULT_PASSWD_FILE),
            group_file: PathBuf::from(DEFAULT_GROUP_FILE),
        }
    }
}

/// A parsed passwd line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub shell: String,
}

impl PasswdEntry {
    /// The first GECOS subfield.
    pub fn display_name(&self) -> &str {
        self.gecos.split(',').next().unwrap_or_default()
    }
}

/// A parsed group line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// Lines that carry no entry: blanks, comments and NIS compat markers.
fn is_skipped(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.starts_with('+')
        || trimmed.starts_with('-')
}

/// Find and parse the passwd entry for `name`.
///
/// Only the matching line is parsed strictly; unrelated lines are never
/// rejected. Errors carry the 1-based line number.
pub fn parse_passwd(contents: &str, name: &str) -> Result<Option<PasswdEntry>, String> {
    for (idx, line) in contents.lines().enumerate() {
        if is_skipped(line) {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields[0] != name {
            continue;
        }

        let lineno = idx + 1;
        // passwd format: name:password:uid:gid:gecos:home:shell
        if fields.len() != 7 {
            return Err(format!(
                "line {lineno}: expected 7 fields, found {}",
                fields.len()
            ));
        }
        let uid = fields[2]
            .parse::<u32>()
            .map_err(|_| format!("line {lineno}: invalid uid '{}'", fields[2]))?;
        let gid = fields[3]
            .parse::<u32>()
            .map_err(|_| format!("line {lineno}: invalid gid '{}'", fields[3]))?;

        return Ok(Some(PasswdEntry {
            name: fields[0].to_string(),
            uid,
            gid,
            gecos: fields[4].to_string(),
            home: PathBuf::from(fields[5]),
            shell: fields[6].to_string(),
        }));
    }
    Ok(None)
}

/// Strictly parse one group line.
fn parse_group_line(line: &str, lineno: usize) -> Result<GroupEntry, String> {
    // group format: name:password:gid:member,member
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 4 {
        return Err(format!(
            "line {lineno}: expected 4 fields, found {}",
            fields.len()
        ));
    }
    let gid = fields[2]
        .parse::<u32>()
        .map_err(|_| format!("line {lineno}: invalid gid '{}'", fields[2]))?;
    let members = fields[3]
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    Ok(GroupEntry {
        name: fields[0].to_string(),
        gid,
        members,
    })
}

/// Find and parse the group entry for `name`.
///
/// Like [`parse_passwd`], only the matching line is parsed strictly.
pub fn parse_group(contents: &str, name: &str) -> Result<Option<GroupEntry>, String> {
    for (idx, line) in contents.lines().enumerate() {
        if is_skipped(line) || line.split(':').next() != Some(name) {
            continue;
        }
        return parse_group_line(line, idx + 1).map(Some);
    }
    Ok(None)
}

/// Group entries needed to resolve `user`.
///
/// A line that lists `user` as a member must be well-formed. Any other
/// malformed line is skipped.
pub fn parse_groups_for(contents: &str, user: &str) -> Result<Vec<GroupEntry>, String> {
    let mut groups = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if is_skipped(line) {
            continue;
        }
        match parse_group_line(line, idx + 1) {
            Ok(entry) => groups.push(entry),
            Err(reason) if lists_member(line, user) => return Err(reason),
            Err(_) => {}
        }
    }
    Ok(groups)
}

/// Whether the raw member field of a group line names `user`.
fn lists_member(line: &str, user: &str) -> bool {
    line.split(':')
        .nth(3)
        .is_some_and(|members| members.split(',').any(|m| m.trim() == user))
}

/// Build the user record for `entry` out of the parsed group database.
fn resolve_user(entry: &PasswdEntry, groups: &[GroupEntry]) -> Result<User, String> {
    let primary = groups
        .iter()
        .find(|g| g.gid == entry.gid)
        .ok_or_else(|| {
            format!(
                "user '{}' has primary gid {} with no group entry",
                entry.name, entry.gid
            )
        })?;

    let mut supplemental: Vec<String> = Vec::new();
    for group in groups {
        if group.gid == entry.gid || !group.members.iter().any(|m| m == &entry.name) {
            continue;
        }
        if !supplemental.contains(&group.name) {
            supplemental.push(group.name.clone());
        }
    }

    Ok(User {
        name: entry.name.clone(),
        uid: entry.uid,
        display_name: entry.display_name().to_string(),
        group: primary.name.clone(),
        shell: entry.shell.clone(),
        groups: supplemental,
    })
}

/// Handle on the passwd/group databases.
#[derive(Debug, Clone)]
pub struct AccountDb {
    passwd_file: PathBuf,
    group_file: PathBuf,
}

impl Default for AccountDb {
    fn default() -> Self {
        Self::new(&AccountDbConfig::default())
    }
}

impl AccountDb {
    pub fn new(config: &AccountDbConfig) -> Self {
        Self {
            passwd_file: config.passwd_file.clone(),
            group_file: config.group_file.clone(),
        }
    }

    pub fn passwd_file(&self) -> &Path {
        &self.passwd_file
    }

    pub fn group_file(&self) -> &Path {
        &self.group_file
    }

    async fn read(path: &Path) -> SyncResult<String> {
        fs::read_to_string(path)
            .await
            .map_err(|source| SyncError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    fn corrupt(path: &Path, reason: String) -> SyncError {
        SyncError::Corrupt {
            path: path.to_path_buf(),
            reason,
        }
    }

    /// Raw passwd entry for `name`, including home directory and GID.
    pub async fn passwd_entry(&self, name: &str) -> SyncResult<Option<PasswdEntry>> {
        let contents = Self::read(&self.passwd_file).await?;
        parse_passwd(&contents, name).map_err(|reason| Self::corrupt(&self.passwd_file, reason))
    }

    /// Raw group entry for `name`.
    pub async fn group_entry(&self, name: &str) -> SyncResult<Option<GroupEntry>> {
        let contents = Self::read(&self.group_file).await?;
        parse_group(&contents, name).map_err(|reason| Self::corrupt(&self.group_file, reason))
    }

    /// Resolve `name` to a full user record.
    pub async fn lookup_user(&self, name: &str) -> SyncResult<Option<User>> {
        let Some(entry) = self.passwd_entry(name).await? else {
            debug!("User '{}' not found in {}", name, self.passwd_file.display());
            return Ok(None);
        };

        let contents = Self::read(&self.group_file).await?;
        let groups = parse_groups_for(&contents, &entry.name)
            .map_err(|reason| Self::corrupt(&self.group_file, reason))?;
        let user =
            resolve_user(&entry, &groups).map_err(|reason| Self::corrupt(&self.group_file, reason))?;

        debug!("Resolved user '{}' (uid {})", user.name, user.uid);
        Ok(Some(user))
    }

    /// Resolve `name` to a group record.
    pub async fn lookup_group(&self, name: &str) -> SyncResult<Option<Group>> {
        let group = self.group_entry(name).await?.map(|g| Group {
            name: g.name,
            gid: g.gid,
        });
        if group.is_none() {
            debug!("Group '{}' not found in {}", name, self.group_file.display());
        }
        Ok(group)
    }
}
