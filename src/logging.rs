use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::Serialize;

use crate::config::relay_home_dir;

/// Upper bound for body previews embedded in request log lines.
pub const BODY_PREVIEW_MAX: usize = 4 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RequestLogOptions {
    pub max_bytes: u64,
    pub max_files: usize,
}

pub fn request_log_options() -> RequestLogOptions {
    static OPT: OnceLock<RequestLogOptions> = OnceLock::new();
    *OPT.get_or_init(|| {
        let max_bytes = std::env::var("COPILOT_RELAY_REQUEST_LOG_MAX_BYTES")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(50 * 1024 * 1024);
        let max_files = std::env::var("COPILOT_RELAY_REQUEST_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(10);
        RequestLogOptions {
            max_bytes,
            max_files,
        }
    })
}

pub fn log_dir() -> PathBuf {
    relay_home_dir().join("logs")
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Clone)]
pub struct BodyPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

fn normalize_content_type(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?.trim();
    let (base, _) = ct.split_once(';').unwrap_or((ct, ""));
    let base = base.trim();
    if base.is_empty() { None } else { Some(base) }
}

fn is_textual_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = normalize_content_type(content_type) else {
        return false;
    };
    ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct == "application/xml"
        || ct.ends_with("+xml")
}

pub fn make_body_preview(bytes: &[u8], content_type: Option<&str>, max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];

    let (encoding, data) = if is_textual_content_type(content_type) {
        ("utf8", String::from_utf8_lossy(slice).into_owned())
    } else {
        (
            "base64",
            base64::engine::general_purpose::STANDARD.encode(slice),
        )
    };
    BodyPreview {
        content_type: normalize_content_type(content_type).map(|s| s.to_string()),
        encoding: encoding.to_string(),
        data,
        truncated,
        original_len,
    }
}

/// One line of `requests.jsonl`. Relayed 200 responses are written once the body has
/// been fully sent or dropped, so `duration_ms` includes the stream.
#[derive(Debug, Serialize, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub timestamp_ms: u64,
    pub endpoint: &'static str,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    /// Coarse failure class, e.g. `bad_request`, `timeout`, `upstream_transport_error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_response_body: Option<BodyPreview>,
}

/// Appends `RequestLog` lines to a JSONL file, rotating it once it grows past the
/// configured size. A disabled logger drops every entry.
#[derive(Clone)]
pub struct RequestLogger {
    path: Option<PathBuf>,
    opt: RequestLogOptions,
    lock: Arc<Mutex<()>>,
}

impl RequestLogger {
    pub fn disabled() -> Self {
        Self {
            path: None,
            opt: request_log_options(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn at_path(path: PathBuf, opt: RequestLogOptions) -> Self {
        Self {
            path: Some(path),
            opt,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(enabled: bool) -> Self {
        if enabled {
            Self::at_path(log_dir().join("requests.jsonl"), request_log_options())
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn write(&self, entry: &RequestLog) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };

        rotate_and_prune_if_needed(path, self.opt);
        if let Ok(line) = serde_json::to_string(entry)
            && let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path)
        {
            let _ = writeln!(file, "{}", line);
        }
    }
}

fn rotate_and_prune_if_needed(path: &Path, opt: RequestLogOptions) {
    if opt.max_bytes == 0 {
        return;
    }
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < opt.max_bytes {
        return;
    }

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("requests");
    let rotated_path = path.with_file_name(format!("{prefix}.{}.jsonl", now_ms()));
    let _ = fs::rename(path, &rotated_path);

    let Some(dir) = path.parent() else {
        return;
    };
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    let rotated_prefix = format!("{prefix}.");
    let mut rotated: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|s| s.starts_with(&rotated_prefix) && s.ends_with(".jsonl"))
        })
        .collect();
    if rotated.len() <= opt.max_files {
        return;
    }
    rotated.sort();
    let remove_count = rotated.len().saturating_sub(opt.max_files);
    for p in rotated.into_iter().take(remove_count) {
        let _ = fs::remove_file(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(status: u16) -> RequestLog {
        RequestLog {
            request_id: "r1".to_string(),
            timestamp_ms: 1,
            endpoint: "chat",
            path: "/v1/chat/completions".to_string(),
            status_code: status,
            duration_ms: 3,
            requested_model: Some("gpt-4".to_string()),
            upstream_model: Some("gpt-4o".to_string()),
            upstream_url: None,
            upstream_status: None,
            error_class: None,
            error: None,
            upstream_response_body: None,
        }
    }

    #[test]
    fn textual_preview_is_utf8_and_truncated() {
        let p = make_body_preview(b"{\"error\":\"quota\"}", Some("application/json; charset=utf-8"), 5);
        assert_eq!(p.encoding, "utf8");
        assert_eq!(p.data, "{\"err");
        assert!(p.truncated);
        assert_eq!(p.original_len, 17);
        assert_eq!(p.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn binary_preview_is_base64() {
        let p = make_body_preview(&[0xff, 0x00], Some("application/octet-stream"), 64);
        assert_eq!(p.encoding, "base64");
        assert_eq!(p.data, "/wA=");
        assert!(!p.truncated);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = RequestLogger::disabled();
        assert!(!logger.is_enabled());
        logger.write(&entry(200));
    }

    #[test]
    fn logger_appends_json_lines_and_rotates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("requests.jsonl");
        let logger = RequestLogger::at_path(
            path.clone(),
            RequestLogOptions {
                max_bytes: 1,
                max_files: 1,
            },
        );

        logger.write(&entry(200));
        let text = fs::read_to_string(&path).expect("read");
        let v: serde_json::Value = serde_json::from_str(text.trim()).expect("json line");
        assert_eq!(v["endpoint"], "chat");
        assert_eq!(v["status_code"], 200);
        assert!(v.get("error").is_none());

        // The file is over max_bytes now, so the next write rotates it first.
        logger.write(&entry(500));
        let current = fs::read_to_string(&path).expect("read");
        assert!(current.contains("\"status_code\":500"));
        let rotated = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("requests.") && name != "requests.jsonl")
            .count();
        assert_eq!(rotated, 1);
    }
}
