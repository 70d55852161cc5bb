#![no_main]

use libfuzzer_sys::fuzz_target;

use linkwall::media::validate::{sniff_content_type, validate_content_matches_extension};
use linkwall::media::MediaKind;

const EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "mp4", "webm", "svg", "",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, bytes)) = data.split_first() else {
        return;
    };
    let ext = EXTENSIONS[selector as usize % EXTENSIONS.len()];

    if let Ok(kind) = validate_content_matches_extension(bytes, ext) {
        assert_eq!(MediaKind::from_extension(ext), Some(kind));
        assert!(kind.matches_signature(bytes));
    }

    // Sniffing must tolerate any input.
    let _ = sniff_content_type(bytes);
});
