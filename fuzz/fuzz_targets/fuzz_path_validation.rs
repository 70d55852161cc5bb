#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;

use linkwall::media::validate::{resolve_within_base, validate_local_path};

// Never created, so resolution stays lexical and touches no real files.
const ROOT: &str = "/linkwall-fuzz-root/media";

fuzz_target!(|data: &[u8]| {
    let Ok(rel) = std::str::from_utf8(data) else {
        return;
    };

    let accepted = validate_local_path(rel);
    if accepted {
        assert!(!rel.contains(".."), "accepted parent reference: {rel:?}");
        assert!(!rel.contains('\0'));
    }

    match resolve_within_base(Path::new(ROOT), rel) {
        Ok(resolved) => {
            assert!(accepted, "resolved a path the validator rejects: {rel:?}");
            assert!(
                resolved.abs.starts_with(ROOT),
                "{rel:?} escaped to {}",
                resolved.abs.display()
            );
        }
        Err(_) => {}
    }
});
