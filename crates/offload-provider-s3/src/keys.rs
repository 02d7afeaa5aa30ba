//! Object key and URL helpers.

/// Normalize a local relative path into key form: forward slashes, no
/// leading slash, no `.` or empty segments.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join non-empty prefix segments into a prefix ending with `/`.
///
/// `join_prefix(&["uploads", "2024/01/"])` is `"uploads/2024/01/"`; all-empty
/// input yields `""`.
pub fn join_prefix(segments: &[&str]) -> String {
    let joined = segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        joined
    } else {
        format!("{}/", joined)
    }
}

/// Remote key for `relative_path` under `prefix`.
pub fn generate_object_key(relative_path: &str, prefix: &str) -> String {
    let relative = normalize_relative_path(relative_path);
    format!("{}{}", join_prefix(&[prefix]), relative)
}

/// Percent-encode each key segment, keeping the `/` separators.
pub fn encode_key_for_url(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Key of the throwaway object used by the permission check.
pub fn sentinel_key(token: &str) -> String {
    format!("offload-permission-check-{}.txt", token)
}

/// Best-effort MIME type from the file extension.
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "text/javascript",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    };
    Some(mime)
}
