#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_sync::validate::*;

fuzz_target!(|data: &str| {
    let result = validate_name(data);

    // Invariant: an accepted name is a single, option-free tool argument
    if result.is_ok() {
        assert!(!data.is_empty(), "Accepted empty name");
        assert!(
            data.len() <= NAME_MAX_LEN,
            "Accepted name too long: {data:?}"
        );
        assert!(
            !data.starts_with('-'),
            "Accepted option-like name: {data:?}"
        );
        assert!(
            data != "." && data != "..",
            "Accepted reserved name: {data:?}"
        );
        let body = data.strip_suffix('$').unwrap_or(data);
        assert!(
            body.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'),
            "Accepted name with invalid chars: {data:?}"
        );
        assert!(!data.contains(':'), "Accepted name with colon: {data:?}");
        assert!(!data.contains(','), "Accepted name with comma: {data:?}");
        assert!(
            !data.contains(char::is_whitespace),
            "Accepted name with whitespace: {data:?}"
        );
    }
});
