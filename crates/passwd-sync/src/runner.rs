//! External command execution.
//!
//! All account mutations go through a [`CommandRunner`]. The production
//! implementation spawns the program; [`RecordingRunner`] only records what
//! would have run (tests and `--dry-run`).

use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::CommandError;

/// One external command: program plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Space-joined command line. Arguments are not quoted.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs an external command to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<(), CommandError>;
}

/// Spawns the program and waits for it. Children are never killed on drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        debug!("Running: {} {:?}", invocation.program, invocation.args);

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let status = output
                .status
                .code()
                .map_or("signal".to_string(), |c| c.to_string());
            tracing::error!(
                "Account tool failed (exit {}): {} {:?}\nstderr: {}",
                status,
                invocation.program,
                invocation.args,
                stderr.trim()
            );
            return Err(CommandError::Exit {
                program: invocation.program.clone(),
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Records invocations instead of running them.
///
/// Optionally fails every invocation of one program, to exercise partial
/// failure paths.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    executed: Mutex<Vec<Invocation>>,
    fail_program: Option<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record everything, but report failure for `program`.
    pub fn failing_on(program: impl Into<String>) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            fail_program: Some(program.into()),
        }
    }

    /// Invocations seen so far, in order.
    pub fn executed(&self) -> Vec<Invocation> {
        match self.executed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Invocations rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.executed().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        match self.executed.lock() {
            Ok(mut guard) => guard.push(invocation.clone()),
            Err(poisoned) => poisoned.into_inner().push(invocation.clone()),
        }

        if self.fail_program.as_deref() == Some(invocation.program.as_str()) {
            return Err(CommandError::Exit {
                program: invocation.program.clone(),
                status: "1".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}
