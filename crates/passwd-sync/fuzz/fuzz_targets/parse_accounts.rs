#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_sync::accounts::{parse_group, parse_groups_for, parse_passwd};

/// Arbitrary database contents must parse or be rejected, never panic.
fuzz_target!(|data: &str| {
    let name = data
        .lines()
        .next()
        .and_then(|line| line.split(':').next())
        .unwrap_or("root");

    if let Ok(Some(entry)) = parse_passwd(data, name) {
        assert_eq!(entry.name, name);
        assert!(!entry.display_name().contains(','));
    }

    if let Ok(Some(group)) = parse_group(data, name) {
        assert_eq!(group.name, name);
    }

    if let Ok(groups) = parse_groups_for(data, name) {
        for group in &groups {
            assert!(!group.name.contains(':'));
            assert!(group.members.iter().all(|m| !m.contains(',')));
        }
    }
});
