//! Desired/observed account records.

use serde::{Deserialize, Serialize};

/// One local user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name. Unique key in the account database.
    pub name: String,
    /// Numeric user ID. Always caller-supplied.
    pub uid: u32,
    /// Free-text display name (first GECOS subfield).
    #[serde(default)]
    pub display_name: String,
    /// Primary group name.
    pub group: String,
    /// Login shell path.
    pub shell: String,
    /// Supplemental group names.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// One local group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_deserializes_without_optional_fields() {
        let user: User = serde_json::from_str(
            r#"{"name":"alice","uid":1000,"group":"users","shell":"/bin/sh"}"#,
        )
        .unwrap();
        assert_eq!(user.display_name, "");
        assert!(user.groups.is_empty());
    }
}
