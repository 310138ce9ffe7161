//! Extension and MIME tables, plus media classification.

use sinobridge_common::types::MediaKind;

const EXT_MIME: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("amr", "audio/amr"),
    ("speex", "audio/speex"),
    ("wav", "audio/wav"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("zip", "application/zip"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("html", "text/html"),
];

/// MIME type for a filename, from its extension.
#[must_use]
pub fn mime_for_filename(filename: &str) -> &'static str {
    extension_of(filename)
        .and_then(|ext| {
            EXT_MIME
                .iter()
                .find(|(e, _)| ext.eq_ignore_ascii_case(e))
                .map(|(_, m)| *m)
        })
        .unwrap_or("application/octet-stream")
}

/// Preferred extension (without the dot) for a MIME type.
#[must_use]
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let bare = mime.split(';').next().unwrap_or(mime).trim();
    EXT_MIME
        .iter()
        .find(|(_, m)| bare.eq_ignore_ascii_case(m))
        .map(|(e, _)| *e)
}

#[must_use]
pub fn extension_of(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && !ext.contains(' ') => Some(ext),
        _ => None,
    }
}

/// Map a filename (and the caller-declared MIME, when present) to the
/// platform media class.
///
/// SVG is shipped as a file — the platforms do not render it as an image.
/// `wav`/`mp3` only count as voice when the caller will transcode them to
/// a platform voice codec; otherwise they go out as files too.
#[must_use]
pub fn classify(filename: &str, declared_mime: Option<&str>, voice_transcode: bool) -> MediaKind {
    let ext = extension_of(filename).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("svg") => return MediaKind::File,
        Some("amr" | "speex") => return MediaKind::Voice,
        Some("wav" | "mp3") => {
            return if voice_transcode {
                MediaKind::Voice
            } else {
                MediaKind::File
            };
        },
        _ => {},
    }

    let mime = declared_mime
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| mime_for_filename(filename).to_string());
    if mime == "image/svg+xml" {
        MediaKind::File
    } else if mime.starts_with("image/") {
        MediaKind::Image
    } else if mime.starts_with("video/") {
        MediaKind::Video
    } else if mime.starts_with("audio/") {
        // Remaining audio formats are not voice codecs on these platforms.
        MediaKind::File
    } else {
        MediaKind::File
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("photo.JPG", "image/jpeg")]
    #[case("a/b/c.png", "image/png")]
    #[case("noext", "application/octet-stream")]
    fn mime_lookup(#[case] filename: &str, #[case] mime: &str) {
        assert_eq!(mime_for_filename(filename), mime);
    }

    #[test]
    fn mime_reverse_lookup_ignores_parameters() {
        assert_eq!(extension_for_mime("image/jpeg; charset=binary"), Some("jpg"));
        assert_eq!(extension_for_mime("application/x-unknown"), None);
    }

    #[rstest]
    #[case("pic.png", None, false, MediaKind::Image)]
    #[case("diagram.svg", Some("image/svg+xml"), false, MediaKind::File)]
    #[case("note.amr", None, false, MediaKind::Voice)]
    #[case("note.wav", None, false, MediaKind::File)]
    #[case("note.wav", None, true, MediaKind::Voice)]
    #[case("song.mp3", None, false, MediaKind::File)]
    #[case("clip.mp4", None, false, MediaKind::Video)]
    #[case("doc.pdf", None, false, MediaKind::File)]
    fn classification(
        #[case] filename: &str,
        #[case] mime: Option<&str>,
        #[case] transcode: bool,
        #[case] expected: MediaKind,
    ) {
        assert_eq!(classify(filename, mime, transcode), expected);
    }

    #[test]
    fn declared_mime_wins_over_missing_extension() {
        assert_eq!(classify("blob", Some("image/png"), false), MediaKind::Image);
    }
}
