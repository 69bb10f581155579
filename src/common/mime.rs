//! Extension <-> MIME type lookup for payload metadata.

/// Fallback when neither an explicit type nor a known extension is available.
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// MIME type for a file extension, if known. Compound extensions such as
/// `.tar.gz` are looked up by their last component.
pub fn from_extension(extension: &str) -> Option<&'static str> {
    let extension = extension.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    let mime = match extension.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "wasm" => "application/wasm",
        "bin" | "exe" | "dll" | "so" => "application/octet-stream",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => return None,
    };
    Some(mime)
}

/// Preferred extension (with leading dot) for a MIME type, if known.
///
/// Parameters such as `; charset=utf-8` are ignored.
pub fn extension_for(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "text/plain" => ".txt",
        "text/markdown" => ".md",
        "text/csv" => ".csv",
        "text/html" => ".html",
        "text/css" => ".css",
        "text/javascript" | "application/javascript" => ".js",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/yaml" => ".yaml",
        "application/toml" => ".toml",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/x-tar" => ".tar",
        "application/wasm" => ".wasm",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "audio/mpeg" => ".mp3",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        _ => return None,
    };
    Some(ext)
}

/// Explicit type wins, then the extension table, then [`DEFAULT_MIME_TYPE`].
pub fn resolve(explicit: Option<&str>, extension: Option<&str>) -> String {
    if let Some(mime) = explicit.filter(|m| !m.trim().is_empty()) {
        return mime.to_string();
    }
    extension
        .and_then(from_extension)
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string()
}
