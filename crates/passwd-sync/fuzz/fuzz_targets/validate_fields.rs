#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_sync::validate::*;

/// Whatever the validators accept must not be able to break a passwd line
/// or an authorized_keys line.
fuzz_target!(|data: &str| {
    if validate_display_name(data).is_ok() {
        assert!(data.len() <= DISPLAY_NAME_MAX_LEN);
        assert!(!data.contains(':'), "Accepted GECOS with colon: {data:?}");
        assert!(!data.contains('\n'), "Accepted GECOS with newline: {data:?}");
        assert!(!data.contains('\0'), "Accepted GECOS with null byte: {data:?}");
    }

    if validate_shell(data).is_ok() {
        assert!(data.starts_with('/'), "Accepted relative shell: {data:?}");
        assert!(!data.contains(':'), "Accepted shell with colon: {data:?}");
        assert!(
            !data.chars().any(char::is_control),
            "Accepted shell with control chars: {data:?}"
        );
    }

    if validate_pub_key(data).is_ok() {
        assert_eq!(
            data.lines().count().max(1),
            1,
            "Accepted multi-line key: {data:?}"
        );
    }
});
