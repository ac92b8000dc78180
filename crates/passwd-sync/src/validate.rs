//! Input validation for account tool arguments.
//!
//! All validation is pure (no side effects) and fully testable.
//! Every function returns Ok(()) or Err(String) with a human-readable message.

/// Maximum account/group name length (Linux limit is 32).
pub const NAME_MAX_LEN: usize = 32;

/// Maximum display name (GECOS) length.
pub const DISPLAY_NAME_MAX_LEN: usize = 256;

/// Validate a user or group name.
///
/// Rules:
/// - Not empty, max 32 characters
/// - Only ascii letters, digits, underscore, hyphen, dot
/// - Optional single trailing '$' (machine accounts)
/// - Must not start with '-' (would be read as an option by the tools)
/// - Must not be "." or ".."
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".into());
    }
    if name.len() > NAME_MAX_LEN {
        return Err(format!("name too long ({} > {NAME_MAX_LEN})", name.len()));
    }
    if name.starts_with('-') {
        return Err(format!("name '{name}' must not start with '-'"));
    }
    if name == "." || name == ".." {
        return Err(format!("name '{name}' is reserved"));
    }
    let body = name.strip_suffix('$').unwrap_or(name);
    if body.is_empty() {
        return Err("name has nothing before '$'".into());
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(format!(
            "name '{}' contains invalid characters (allowed: A-Z, a-z, 0-9, _, -, .)",
            name.escape_debug()
        ));
    }
    Ok(())
}

/// Validate a display name (GECOS field). Empty is allowed.
pub fn validate_display_name(display_name: &str) -> Result<(), String> {
    if display_name.len() > DISPLAY_NAME_MAX_LEN {
        return Err(format!(
            "display name too long ({} > {DISPLAY_NAME_MAX_LEN})",
            display_name.len()
        ));
    }
    // Reject characters that could break /etc/passwd
    if display_name.contains(':') {
        return Err("display name contains ':' (passwd field separator)".into());
    }
    if display_name.contains('\n') {
        return Err("display name contains newline".into());
    }
    if display_name.contains('\r') {
        return Err("display name contains carriage return".into());
    }
    if display_name.contains('\0') {
        return Err("display name contains null byte".into());
    }
    Ok(())
}

/// Validate a login shell path.
pub fn validate_shell(shell: &str) -> Result<(), String> {
    if !shell.starts_with('/') {
        return Err(format!("shell '{}' must be an absolute path", shell.escape_debug()));
    }
    if shell.contains(':') {
        return Err("shell contains ':' (passwd field separator)".into());
    }
    if shell.chars().any(|c| c.is_control()) {
        return Err("shell contains control characters".into());
    }
    Ok(())
}

/// Validate a supplemental group list. Empty is allowed.
pub fn validate_group_list(groups: &[String]) -> Result<(), String> {
    for group in groups {
        validate_name(group).map_err(|e| format!("supplemental group: {e}"))?;
    }
    Ok(())
}

/// Validate one line of SSH key material.
pub fn validate_pub_key(key: &str) -> Result<(), String> {
    if key.contains('\n') || key.contains('\r') {
        return Err("public key contains a line break".into());
    }
    if key.contains('\0') {
        return Err("public key contains null byte".into());
    }
    Ok(())
}
