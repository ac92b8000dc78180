//! Test utilities and common setup.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use passwd_sync::{
    AccountDb, AccountDbConfig, BusyboxSyncer, CommandError, CommandRunner, Invocation, User,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

/// A passwd/group pair in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub db: AccountDb,
}

impl Fixture {
    /// Default accounts: root, alice (uid 1000) and keyholder, whose ids
    /// are the ids of the test process so its key file can be chowned.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let keyholder_home = dir.path().join("home").join("keyholder");
        fs::create_dir_all(&keyholder_home).unwrap();

        let passwd = format!(
            "root:x:0:0:root:/root:/bin/bash\n\
             alice:x:1000:1000:Alice Example,,,:/home/alice:/bin/zsh\n\
             keyholder:x:{uid}:{gid}:Key Holder:{}:/bin/sh\n",
            keyholder_home.display()
        );
        let group = "\
root:x:0:
wheel:x:10:alice
alice:x:1000:
usersgroup:x:100:
group1:x:1001:
group2:x:1002:
docker:x:999:alice
";
        Self::write(dir, &passwd, group)
    }

    pub fn with_files(passwd: &str, group: &str) -> Self {
        Self::write(tempfile::tempdir().unwrap(), passwd, group)
    }

    fn write(dir: TempDir, passwd: &str, group: &str) -> Self {
        let config = AccountDbConfig {
            passwd_file: dir.path().join("passwd"),
            group_file: dir.path().join("group"),
        };
        fs::write(&config.passwd_file, passwd).unwrap();
        fs::write(&config.group_file, group).unwrap();
        let db = AccountDb::new(&config);
        Self { dir, db }
    }

    pub fn passwd_path(&self) -> PathBuf {
        self.db.passwd_file().to_path_buf()
    }

    pub fn group_path(&self) -> PathBuf {
        self.db.group_file().to_path_buf()
    }

    pub fn keyholder_home(&self) -> PathBuf {
        self.dir.path().join("home").join("keyholder")
    }

    pub fn syncer(&self, runner: Arc<dyn CommandRunner>) -> BusyboxSyncer {
        BusyboxSyncer::with_runner(self.db.clone(), runner)
    }

    pub fn passwd_contents(&self) -> String {
        fs::read_to_string(self.passwd_path()).unwrap()
    }

    pub fn group_contents(&self) -> String {
        fs::read_to_string(self.group_path()).unwrap()
    }
}

/// The record used throughout the account tool examples.
pub fn new_user() -> User {
    User {
        name: "newuser".to_string(),
        uid: 1000,
        display_name: "displayName".to_string(),
        group: "usersgroup".to_string(),
        shell: "/sbin/nologin".to_string(),
        groups: vec!["group1".to_string(), "group2".to_string()],
    }
}

fn tool_failure(invocation: &Invocation, message: &str) -> CommandError {
    CommandError::Exit {
        program: invocation.program.clone(),
        status: "1".to_string(),
        stderr: message.to_string(),
    }
}

fn append_line(path: &Path, line: &str) {
    let mut contents = fs::read_to_string(path).unwrap();
    contents.push_str(line);
    contents.push('\n');
    fs::write(path, contents).unwrap();
}

fn remove_entry(path: &Path, name: &str) -> bool {
    let contents = fs::read_to_string(path).unwrap();
    let prefix = format!("{name}:");
    let kept: Vec<&str> = contents
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .collect();
    let removed = kept.len() != contents.lines().count();
    let mut body = kept.join("\n");
    body.push('\n');
    fs::write(path, body).unwrap();
    removed
}

/// Applies the account tool command lines to the fixture files, the way the
/// real tools would, and records every command line it saw.
pub struct FakeAccountTools {
    passwd: PathBuf,
    group: PathBuf,
    executed: Mutex<Vec<String>>,
}

impl FakeAccountTools {
    pub fn new(fixture: &Fixture) -> Self {
        Self {
            passwd: fixture.passwd_path(),
            group: fixture.group_path(),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn gid_of(&self, group: &str) -> Option<String> {
        let prefix = format!("{group}:");
        fs::read_to_string(&self.group)
            .unwrap()
            .lines()
            .find(|line| line.starts_with(&prefix))
            .and_then(|line| line.split(':').nth(2).map(str::to_string))
    }

    fn add_member(&self, invocation: &Invocation, name: &str, group: &str) -> Result<(), CommandError> {
        let contents = fs::read_to_string(&self.group).unwrap();
        let prefix = format!("{group}:");
        let mut found = false;
        let lines: Vec<String> = contents
            .lines()
            .map(|line| {
                if !line.starts_with(&prefix) {
                    return line.to_string();
                }
                found = true;
                if line.ends_with(':') {
                    format!("{line}{name}")
                } else {
                    format!("{line},{name}")
                }
            })
            .collect();
        if !found {
            return Err(tool_failure(invocation, &format!("unknown group {group}")));
        }
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&self.group, body).unwrap();
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeAccountTools {
    async fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        self.executed.lock().unwrap().push(invocation.to_string());

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        match (invocation.program.as_str(), args.as_slice()) {
            ("adduser", ["-c", gecos, "-G", group, "-s", shell, "-u", uid, "-D", name]) => {
                let gid = self
                    .gid_of(group)
                    .ok_or_else(|| tool_failure(invocation, "unknown group"))?;
                append_line(
                    &self.passwd,
                    &format!("{name}:x:{uid}:{gid}:{gecos}:/home/{name}:{shell}"),
                );
            }
            ("addgroup", [name, group]) => self.add_member(invocation, name, group)?,
            ("userdel", ["-f", "-r", name]) => {
                if !remove_entry(&self.passwd, name) {
                    return Err(tool_failure(invocation, "unknown user"));
                }
            }
            ("groupadd", ["-g", gid, name]) => {
                append_line(&self.group, &format!("{name}:x:{gid}:"));
            }
            ("groupdel", [name]) => {
                if !remove_entry(&self.group, name) {
                    return Err(tool_failure(invocation, "unknown group"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Blocks every command until [`GatedRunner::open`] is called.
pub struct GatedRunner {
    started: Notify,
    gate: Semaphore,
    completed: Mutex<Vec<String>>,
}

impl GatedRunner {
    pub fn new() -> Self {
        Self {
            started: Notify::new(),
            gate: Semaphore::new(0),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Resolves once the first command is blocked at the gate.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }

    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    /// Poll until `count` commands have completed.
    pub async fn wait_completed(&self, count: usize) {
        for _ in 0..500 {
            if self.completed().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "only {} of {count} commands completed",
            self.completed().len()
        );
    }
}

#[async_trait]
impl CommandRunner for GatedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        self.started.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| tool_failure(invocation, "gate closed"))?;
        drop(permit);
        self.completed.lock().unwrap().push(invocation.to_string());
        Ok(())
    }
}
