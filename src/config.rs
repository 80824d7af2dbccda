use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_INSTRUCT_MODEL: &str = "gpt-3.5-turbo-instruct";

/// Relay configuration. Field names match the keys of the desktop app's `config.json`,
/// so older files load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    /// Optional outbound proxy for upstream calls (http/https/socks).
    pub proxy_url: String,
    /// Upstream client timeout in seconds; 0 disables it.
    pub timeout: u64,

    pub codex_api_base: String,
    pub codex_api_key: String,
    pub codex_api_organization: String,
    pub codex_api_project: String,
    pub codex_max_tokens: i64,
    pub code_instruct_model: String,

    pub chat_api_base: String,
    pub chat_api_key: String,
    pub chat_api_organization: String,
    pub chat_api_project: String,
    pub chat_max_tokens: i64,
    pub chat_model_default: String,
    pub chat_locale: String,

    /// When non-empty, completion routes are mounted under `/{auth_token}/...`.
    pub auth_token: String,
    /// Append one JSON line per proxied request to `~/.copilot-relay/logs/requests.jsonl`.
    pub request_log: bool,

    /// Inbound model id -> upstream model id; unmapped models use `chat_model_default`.
    pub chat_model_map: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8181".to_string(),
            proxy_url: String::new(),
            timeout: 600,
            codex_api_base: DEFAULT_API_BASE.to_string(),
            codex_api_key: String::new(),
            codex_api_organization: String::new(),
            codex_api_project: String::new(),
            codex_max_tokens: 500,
            code_instruct_model: DEFAULT_INSTRUCT_MODEL.to_string(),
            chat_api_base: DEFAULT_API_BASE.to_string(),
            chat_api_key: String::new(),
            chat_api_organization: String::new(),
            chat_api_project: String::new(),
            chat_max_tokens: 4096,
            chat_model_default: "gpt-4".to_string(),
            chat_locale: String::new(),
            auth_token: String::new(),
            request_log: false,
            chat_model_map: HashMap::new(),
        }
    }
}

/// Connection settings for one upstream API.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTarget<'a> {
    pub base_url: &'a str,
    pub api_key: &'a str,
    pub organization: &'a str,
    pub project: &'a str,
}

impl RelayConfig {
    pub fn chat_target(&self) -> UpstreamTarget<'_> {
        UpstreamTarget {
            base_url: &self.chat_api_base,
            api_key: &self.chat_api_key,
            organization: &self.chat_api_organization,
            project: &self.chat_api_project,
        }
    }

    pub fn codex_target(&self) -> UpstreamTarget<'_> {
        UpstreamTarget {
            base_url: &self.codex_api_base,
            api_key: &self.codex_api_key,
            organization: &self.codex_api_organization,
            project: &self.codex_api_project,
        }
    }

    /// Copy suitable for printing: keys and the auth token are masked.
    pub fn redacted(&self) -> Self {
        fn mask(s: &str) -> String {
            if s.is_empty() {
                String::new()
            } else {
                "[REDACTED]".to_string()
            }
        }
        let mut out = self.clone();
        out.codex_api_key = mask(&out.codex_api_key);
        out.chat_api_key = mask(&out.chat_api_key);
        out.auth_token = mask(&out.auth_token);
        out
    }
}

type Setter = fn(&mut RelayConfig, &str) -> Result<(), String>;

fn set_string(slot: &mut String, value: &str) -> Result<(), String> {
    *slot = value.to_string();
    Ok(())
}

fn parse_int<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("expected an integer, got {value:?}"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(format!("expected a boolean, got {value:?}")),
    }
}

/// `OVERRIDE_<FIELD>` environment overrides, one explicit setter per field.
const OVERRIDES: &[(&str, Setter)] = &[
    ("bind", |c, v| set_string(&mut c.bind, v)),
    ("proxy_url", |c, v| set_string(&mut c.proxy_url, v)),
    ("timeout", |c, v| {
        c.timeout = parse_int(v)?;
        Ok(())
    }),
    ("codex_api_base", |c, v| set_string(&mut c.codex_api_base, v)),
    ("codex_api_key", |c, v| set_string(&mut c.codex_api_key, v)),
    ("codex_api_organization", |c, v| {
        set_string(&mut c.codex_api_organization, v)
    }),
    ("codex_api_project", |c, v| {
        set_string(&mut c.codex_api_project, v)
    }),
    ("codex_max_tokens", |c, v| {
        c.codex_max_tokens = parse_int(v)?;
        Ok(())
    }),
    ("code_instruct_model", |c, v| {
        set_string(&mut c.code_instruct_model, v)
    }),
    ("chat_api_base", |c, v| set_string(&mut c.chat_api_base, v)),
    ("chat_api_key", |c, v| set_string(&mut c.chat_api_key, v)),
    ("chat_api_organization", |c, v| {
        set_string(&mut c.chat_api_organization, v)
    }),
    ("chat_api_project", |c, v| {
        set_string(&mut c.chat_api_project, v)
    }),
    ("chat_max_tokens", |c, v| {
        c.chat_max_tokens = parse_int(v)?;
        Ok(())
    }),
    ("chat_model_default", |c, v| {
        set_string(&mut c.chat_model_default, v)
    }),
    ("chat_model_map", |c, v| {
        c.chat_model_map = serde_json::from_str(v)
            .map_err(|e| format!("expected a JSON object of strings: {e}"))?;
        Ok(())
    }),
    ("chat_locale", |c, v| set_string(&mut c.chat_locale, v)),
    ("auth_token", |c, v| set_string(&mut c.auth_token, v)),
    ("request_log", |c, v| {
        c.request_log = parse_bool(v)?;
        Ok(())
    }),
];

pub fn override_var_name(field: &str) -> String {
    format!("OVERRIDE_{}", field.to_ascii_uppercase())
}

/// Apply overrides from an arbitrary variable source. Values that fail to parse are
/// skipped with a warning; the loaded value stays in place.
pub fn apply_overrides_from<F>(cfg: &mut RelayConfig, lookup: F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = Vec::new();
    for (field, setter) in OVERRIDES {
        let var = override_var_name(field);
        let Some(value) = lookup(&var) else {
            continue;
        };
        match setter(cfg, &value) {
            Ok(()) => applied.push(*field),
            Err(err) => warn!("ignoring {var}: {err}"),
        }
    }
    applied
}

pub fn apply_env_overrides(cfg: &mut RelayConfig) -> Vec<&'static str> {
    apply_overrides_from(cfg, |name| env::var(name).ok())
}

/// 获取 copilot-relay 的主目录（用于配置、日志等）
pub fn relay_home_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".copilot-relay")
}

pub fn default_config_path() -> PathBuf {
    relay_home_dir().join("config.toml")
}

/// Resolve which file `load_config` would read. Working-directory files win over the
/// home directory, TOML over JSON.
pub fn config_file_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let home = relay_home_dir();
    [
        PathBuf::from("config.toml"),
        PathBuf::from("config.json"),
        home.join("config.toml"),
        home.join("config.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

pub fn parse_config(path: &Path, text: &str) -> Result<RelayConfig> {
    if is_toml(path) {
        toml::from_str::<RelayConfig>(text)
            .with_context(|| format!("failed to parse {}", path.display()))
    } else {
        serde_json::from_str::<RelayConfig>(text)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Load the config file (if any) and apply `OVERRIDE_*` environment variables.
pub async fn load_config(explicit: Option<&Path>) -> Result<(RelayConfig, Option<PathBuf>)> {
    let path = config_file_path(explicit);
    let mut cfg = match path.as_deref() {
        Some(p) => {
            let text = fs::read_to_string(p)
                .await
                .with_context(|| format!("failed to read {}", p.display()))?;
            parse_config(p, &text)?
        }
        None => RelayConfig::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, path))
}

pub async fn save_config(cfg: &RelayConfig, path: &Path) -> Result<()> {
    let data = if is_toml(path) {
        toml::to_string_pretty(cfg)?.into_bytes()
    } else {
        serde_json::to_vec_pretty(cfg)?
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).await?;

    // 先备份旧文件，再用临时文件 + rename 原子写入。
    if path.exists() {
        let backup = path.with_extension(format!(
            "{}.bak",
            path.extension().and_then(|e| e.to_str()).unwrap_or("cfg")
        ));
        if let Err(err) = fs::copy(path, &backup).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup, err);
        }
    }

    let tmp_path = dir.join(".copilot-relay-config.tmp");
    fs::write(&tmp_path, &data).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

const CONFIG_TOML_TEMPLATE: &str = r#"# copilot-relay config.toml
#
# Lookup order: --config PATH, ./config.toml, ./config.json,
# ~/.copilot-relay/config.toml, ~/.copilot-relay/config.json.
# Every key can be overridden with OVERRIDE_<KEY> (e.g. OVERRIDE_CHAT_API_KEY).

bind = "127.0.0.1:8181"
# Outbound proxy for upstream calls, e.g. "http://127.0.0.1:7890".
proxy_url = ""
# Upstream timeout in seconds (0 = none).
timeout = 600

# If set, completion routes become /<auth_token>/v1/...
auth_token = ""

# --- code completions (/v1/engines/copilot-codex/completions) ---
codex_api_base = "https://api.openai.com/v1"
codex_api_key = ""
codex_api_organization = ""
codex_api_project = ""
codex_max_tokens = 500
# "stable-code*" models get a FIM chat prompt; "deepseek-coder*" is limited to n = 1.
code_instruct_model = "gpt-3.5-turbo-instruct"

# --- chat completions (/v1/chat/completions) ---
chat_api_base = "https://api.openai.com/v1"
chat_api_key = ""
chat_api_organization = ""
chat_api_project = ""
chat_max_tokens = 4096
# Used for any model that is not listed in chat_model_map.
chat_model_default = "gpt-4"
# Empty means zh_CN.
chat_locale = ""

# Write ~/.copilot-relay/logs/requests.jsonl.
request_log = false

[chat_model_map]
# "gpt-4" = "gpt-4o"
# "gpt-3.5-turbo" = "gpt-4o-mini"
"#;

pub async fn init_config_toml(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {:?}; use --force to overwrite",
            path
        );
    }
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    Ok(path.to_path_buf())
}
