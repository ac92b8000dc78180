use std::env;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use passwd_sync::pubkeys::authorized_keys_path;
use passwd_sync::{
    AccountDb, AccountDbConfig, BusyboxSyncer, CommandRunner, ErrorKind, Group, RecordingRunner,
    SyncError, Syncer, SystemRunner, ToolsConfig, User,
};

const APP_NAME: &str = "passwd-sync";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(exit_code(&err));
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: AccountCommand) -> Result<()> {
    handle_account(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command {
        Command::Account(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

/// Process exit status for a failed run.
fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>())
        .map(SyncError::kind);
    match kind {
        Some(ErrorKind::Conflict) => 3,
        Some(ErrorKind::Missing) => 4,
        Some(ErrorKind::Corrupt) => 5,
        Some(ErrorKind::InvalidInput) => 64,
        Some(ErrorKind::Cancelled) => 130,
        _ => 1,
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "passwd-sync - converge local users, groups and SSH keys.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    /// Print the commands instead of running them
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Account(AccountCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// One account operation per invocation.
#[derive(Debug, Subcommand)]
enum AccountCommand {
    /// Show a user as recorded in the account database
    LookupUser { name: String },
    /// Show a group as recorded in the account database
    LookupGroup { name: String },
    /// Create a user and add it to its supplemental groups
    AddUser(AddUserCommand),
    /// Delete a user together with its home directory
    RemoveUser { name: String },
    /// Replace the display name (GECOS) of a user
    SetDisplayName { name: String, display_name: String },
    /// Replace the primary group of a user
    SetPrimaryGroup { name: String, group: String },
    /// Replace the login shell of a user
    SetShell { name: String, shell: String },
    /// Replace the supplemental groups of a user (none clears them)
    SetGroups { name: String, groups: Vec<String> },
    /// Replace the authorized SSH keys of a user
    SetPubkeys(SetPubKeysCommand),
    /// Disable password authentication for a user
    LockPassword { name: String },
    /// Create a group with an explicit GID
    AddGroup {
        name: String,
        #[arg(long)]
        gid: u32,
    },
    /// Delete a group
    RemoveGroup { name: String },
}

impl AccountCommand {
    fn is_mutation(&self) -> bool {
        !matches!(
            self,
            AccountCommand::LookupUser { .. } | AccountCommand::LookupGroup { .. }
        )
    }
}

#[derive(Debug, Clone, Args)]
struct AddUserCommand {
    name: String,
    #[arg(long)]
    uid: u32,
    /// Primary group name
    #[arg(long)]
    group: String,
    #[arg(long = "display-name", default_value = "")]
    display_name: String,
    /// Login shell (absolute path)
    #[arg(long)]
    shell: String,
    /// Supplemental groups, comma separated
    #[arg(long, value_delimiter = ',')]
    groups: Vec<String>,
}

impl From<AddUserCommand> for User {
    fn from(cmd: AddUserCommand) -> Self {
        User {
            name: cmd.name,
            uid: cmd.uid,
            display_name: cmd.display_name,
            group: cmd.group,
            shell: cmd.shell,
            groups: cmd.groups,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct SetPubKeysCommand {
    name: String,
    /// Keys given inline, one per argument
    keys: Vec<String>,
    /// Read additional keys from a file, or stdin with "-"
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level().as_str().to_ascii_lowercase();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("passwd_sync={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let ansi = !self.common.no_color
                && env::var_os("NO_COLOR").is_none()
                && io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(ansi)
                        .with_target(false),
                )
                .try_init()
                .ok();
        }

        // Fallback for log users when no tracing subscriber could be installed
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Write a serializable result in the selected output format.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        let rendered = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            text()
        };
        println!("{}", rendered.trim_end());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    accounts: AccountDbConfig,
    tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_account(ctx: &RuntimeContext, cmd: AccountCommand) -> Result<()> {
    let db = AccountDb::new(&ctx.config.accounts);
    let recorder = Arc::new(RecordingRunner::new());
    let runner: Arc<dyn CommandRunner> = if ctx.common.dry_run {
        recorder.clone()
    } else {
        Arc::new(SystemRunner)
    };
    let syncer = BusyboxSyncer::with_runner(db, runner).with_tools(ctx.config.tools.clone());

    if cmd.is_mutation() && !ctx.common.dry_run && !rustix::process::geteuid().is_root() {
        warn!("Not running as root; the account tools will likely refuse to make changes");
    }

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    match cmd {
        AccountCommand::LookupUser { name } => {
            let user = syncer
                .lookup_user(&token, &name)
                .await
                .with_context(|| format!("looking up user '{name}'"))?;
            ctx.emit(&user, || match &user {
                Some(user) => format_user(user),
                None => format!("user '{name}' not found"),
            })?;
        }
        AccountCommand::LookupGroup { name } => {
            let group = syncer
                .lookup_group(&token, &name)
                .await
                .with_context(|| format!("looking up group '{name}'"))?;
            ctx.emit(&group, || match &group {
                Some(group) => format_group(group),
                None => format!("group '{name}' not found"),
            })?;
        }
        AccountCommand::AddUser(cmd) => {
            let user = User::from(cmd);
            syncer
                .add_user(&token, &user)
                .await
                .with_context(|| format!("adding user '{}'", user.name))?;
        }
        AccountCommand::RemoveUser { name } => {
            syncer
                .remove_user(&token, &name)
                .await
                .with_context(|| format!("removing user '{name}'"))?;
        }
        AccountCommand::SetDisplayName { name, display_name } => {
            syncer
                .set_display_name(&token, &name, &display_name)
                .await
                .with_context(|| format!("setting display name of '{name}'"))?;
        }
        AccountCommand::SetPrimaryGroup { name, group } => {
            syncer
                .set_primary_group(&token, &name, &group)
                .await
                .with_context(|| format!("setting primary group of '{name}'"))?;
        }
        AccountCommand::SetShell { name, shell } => {
            syncer
                .set_shell(&token, &name, &shell)
                .await
                .with_context(|| format!("setting shell of '{name}'"))?;
        }
        AccountCommand::SetGroups { name, groups } => {
            syncer
                .set_supplemental_groups(&token, &name, &groups)
                .await
                .with_context(|| format!("setting groups of '{name}'"))?;
        }
        AccountCommand::SetPubkeys(cmd) => {
            let mut keys = cmd.keys;
            if let Some(ref file) = cmd.file {
                keys.extend(read_key_file(file)?);
            }

            if ctx.common.dry_run {
                return show_pub_keys_target(ctx, syncer.account_db(), &cmd.name, &keys).await;
            }
            syncer
                .set_pub_keys(&token, &cmd.name, &keys)
                .await
                .with_context(|| format!("setting public keys of '{}'", cmd.name))?;
        }
        AccountCommand::LockPassword { name } => {
            syncer
                .lock_password(&token, &name)
                .await
                .with_context(|| format!("locking password of '{name}'"))?;
        }
        AccountCommand::AddGroup { name, gid } => {
            let group = Group { name, gid };
            syncer
                .add_group(&token, &group)
                .await
                .with_context(|| format!("adding group '{}'", group.name))?;
        }
        AccountCommand::RemoveGroup { name } => {
            syncer
                .remove_group(&token, &name)
                .await
                .with_context(|| format!("removing group '{name}'"))?;
        }
    }

    if ctx.common.dry_run {
        let lines = recorder.command_lines();
        ctx.emit(&lines, || lines.join("\n"))?;
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Signal received, cancelling; a started change will still finish");
        token.cancel();
    });
}

/// Keys from `path` (or stdin for "-"), skipping blank and comment lines.
fn read_key_file(path: &Path) -> Result<Vec<String>> {
    let contents = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading keys from stdin")?;
        buffer
    } else {
        fs::read_to_string(path).with_context(|| format!("reading keys from {}", path.display()))?
    };

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Serialize)]
struct PubKeysPlan<'a> {
    path: PathBuf,
    keys: &'a [String],
}

async fn show_pub_keys_target(
    ctx: &RuntimeContext,
    db: &AccountDb,
    name: &str,
    keys: &[String],
) -> Result<()> {
    let entry = db
        .passwd_entry(name)
        .await
        .with_context(|| format!("looking up user '{name}'"))?
        .ok_or_else(|| SyncError::UserNotFound(name.to_string()))?;

    let plan = PubKeysPlan {
        path: authorized_keys_path(&entry.home),
        keys,
    };
    ctx.emit(&plan, || {
        format!(
            "would write {} key(s) to {} (owner {}:{})",
            keys.len(),
            plan.path.display(),
            entry.uid,
            entry.gid
        )
    })
}

fn format_user(user: &User) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "name:          {}", user.name);
    let _ = writeln!(out, "uid:           {}", user.uid);
    let _ = writeln!(out, "display name:  {}", user.display_name);
    let _ = writeln!(out, "primary group: {}", user.group);
    let _ = writeln!(out, "shell:         {}", user.shell);
    let _ = writeln!(out, "groups:        {}", user.groups.join(", "));
    out
}

fn format_group(group: &Group) -> String {
    format!("name: {}\ngid:  {}", group.name, group.gid)
}

fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        debug!(
            "no config at {}, using defaults (run `{APP_NAME} init` to create one)",
            paths.config_file.display()
        );
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", paths.config_file.display()))?;

    let mut config: AppConfig = built.try_deserialize()?;
    config.accounts.passwd_file = expand_path(config.accounts.passwd_file)?;
    config.accounts.group_file = expand_path(config.accounts.group_file)?;

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "PASSWD_SYNC");
    }

    #[test]
    fn test_exit_code_from_error_kind() {
        let err = anyhow::Error::new(SyncError::UserExists("alice".to_string()))
            .context("adding user 'alice'");
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::new(SyncError::Cancelled);
        assert_eq!(exit_code(&err), 130);

        assert_eq!(exit_code(&anyhow!("something else")), 1);
    }

    #[test]
    fn test_parse_add_user() {
        let cli = Cli::try_parse_from([
            APP_NAME,
            "add-user",
            "newuser",
            "--uid",
            "1000",
            "--group",
            "usersgroup",
            "--display-name",
            "displayName",
            "--shell",
            "/sbin/nologin",
            "--groups",
            "group1,group2",
        ])
        .unwrap();

        let Command::Account(AccountCommand::AddUser(cmd)) = cli.command else {
            panic!("expected add-user");
        };
        let user = User::from(cmd);
        assert_eq!(user.groups, vec!["group1", "group2"]);
        assert_eq!(user.display_name, "displayName");
    }

    #[test]
    fn test_parse_set_groups_empty() {
        let cli = Cli::try_parse_from([APP_NAME, "set-groups", "alice"]).unwrap();
        let Command::Account(AccountCommand::SetGroups { name, groups }) = cli.command else {
            panic!("expected set-groups");
        };
        assert_eq!(name, "alice");
        assert!(groups.is_empty());
    }

    #[test]
    fn test_common_options() {
        let cli = Cli::try_parse_from([APP_NAME, "--no-color", "--dry-run", "lookup-user", "root"])
            .unwrap();
        assert!(cli.common.no_color);
        assert!(cli.common.dry_run);
        assert!(Cli::try_parse_from([APP_NAME, "--diagnostics", "lookup-user", "root"]).is_err());
        assert!(Cli::try_parse_from([APP_NAME, "--color", "always", "lookup-user", "root"]).is_err());
    }

    #[test]
    fn test_lookups_are_not_mutations() {
        let cli = Cli::try_parse_from([APP_NAME, "lookup-user", "root"]).unwrap();
        let Command::Account(cmd) = cli.command else {
            panic!("expected account command");
        };
        assert!(!cmd.is_mutation());
    }

    #[test]
    fn test_read_key_file_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        fs::write(&path, "# laptop\nssh-ed25519 AAAA a@b\n\n  ssh-rsa BBBB  \n").unwrap();

        let keys = read_key_file(&path).unwrap();
        assert_eq!(keys, vec!["ssh-ed25519 AAAA a@b", "ssh-rsa BBBB"]);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.contains("passwd_file = \"/etc/passwd\""));
        assert!(text.contains("usermod = \"usermod\""));
    }

    #[test]
    fn test_format_user() {
        let user = User {
            name: "alice".to_string(),
            uid: 1000,
            display_name: "Alice".to_string(),
            group: "alice".to_string(),
            shell: "/bin/sh".to_string(),
            groups: vec!["wheel".to_string(), "docker".to_string()],
        };
        let text = format_user(&user);
        assert!(text.contains("uid:           1000"));
        assert!(text.contains("groups:        wheel, docker"));
    }
}
