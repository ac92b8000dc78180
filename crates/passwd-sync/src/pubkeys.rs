//! authorized_keys provisioning.
//!
//! The file is always rewritten in full through a temporary file in the same
//! directory, then renamed into place, so readers never see partial content
//! and a previous file with different ownership is replaced, not edited.

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, chown, fchown};
use std::path::{Path, PathBuf};

use log::info;

/// Directory under the home directory holding SSH configuration.
pub const SSH_DIR: &str = ".ssh";

/// Key file name inside [`SSH_DIR`].
pub const AUTHORIZED_KEYS: &str = "authorized_keys";

/// Where the key file of a user with home directory `home` lives.
pub fn authorized_keys_path(home: &Path) -> PathBuf {
    home.join(SSH_DIR).join(AUTHORIZED_KEYS)
}

/// File content for `keys`: one key per line, newline-terminated.
pub fn render_authorized_keys(keys: &[String]) -> String {
    let mut body = String::with_capacity(keys.iter().map(|k| k.len() + 1).sum());
    for key in keys {
        body.push_str(key);
        body.push('\n');
    }
    body
}

/// Make sure `<home>/.ssh` is a real directory owned by `uid:gid`.
fn ensure_ssh_dir(ssh_dir: &Path, uid: u32, gid: u32) -> io::Result<()> {
    match fs::symlink_metadata(ssh_dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(io::Error::other(format!(
                "{} is a symlink",
                ssh_dir.display()
            )));
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(io::Error::other(format!(
                "{} is not a directory",
                ssh_dir.display()
            )));
        }
        Ok(_) => fs::set_permissions(ssh_dir, Permissions::from_mode(0o700))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new().mode(0o700).create(ssh_dir)?;
        }
        Err(e) => return Err(e),
    }
    chown(ssh_dir, Some(uid), Some(gid))
}

/// Replace the authorized keys of the account with home `home`.
///
/// Blocking; call from a blocking-capable context. `home` must be absolute;
/// an empty or relative home from the passwd file is refused before anything
/// is created.
pub fn save_pub_keys(home: &Path, uid: u32, gid: u32, keys: &[String]) -> io::Result<()> {
    if !home.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("home directory '{}' is not an absolute path", home.display()),
        ));
    }
    let ssh_dir = home.join(SSH_DIR);
    ensure_ssh_dir(&ssh_dir, uid, gid)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".authorized_keys")
        .tempfile_in(&ssh_dir)?;
    tmp.write_all(render_authorized_keys(keys).as_bytes())?;

    let file = tmp.as_file();
    file.set_permissions(Permissions::from_mode(0o600))?;
    fchown(file, Some(uid), Some(gid))?;
    file.sync_all()?;

    let target = ssh_dir.join(AUTHORIZED_KEYS);
    tmp.persist(&target).map_err(|e| e.error)?;

    info!(
        "Wrote {} public key(s) to {} (owner {}:{})",
        keys.len(),
        target.display(),
        uid,
        gid
    );
    Ok(())
}
