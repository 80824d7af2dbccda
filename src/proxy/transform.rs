//! Request body rewriting for the chat and code-completion endpoints.
//!
//! Both transforms edit a JSON object in place and never fail: fields with an unexpected
//! shape are left alone. Only the fields named here are touched; everything else keeps
//! its value and position.

use serde_json::{Map, Value, json};

use crate::config::RelayConfig;

pub const LOCALE_MARKER: &str = "Respond in the following locale";
pub const DEFAULT_LOCALE: &str = "zh_CN";
pub const STABLE_CODE_FAMILY: &str = "stable-code";
pub const DEEPSEEK_CODER_FAMILY: &str = "deepseek-coder";

const CHAT_DROPPED_FIELDS: [&str; 3] = ["intent", "intent_threshold", "intent_content"];
const CODE_DROPPED_FIELDS: [&str; 2] = ["extra", "nwo"];

/// How the configured code model expects its prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePromptStyle {
    /// Chat request carrying a single FIM-wrapped user message.
    FimChat,
    /// Legacy prompt/suffix completion limited to one choice per call.
    SingleChoice,
    /// Legacy prompt/suffix completion, unchanged.
    Completion,
}

impl CodePromptStyle {
    pub fn for_model(code_instruct_model: &str) -> Self {
        if code_instruct_model.contains(STABLE_CODE_FAMILY) {
            Self::FimChat
        } else if code_instruct_model.starts_with(DEEPSEEK_CODER_FAMILY) {
            Self::SingleChoice
        } else {
            Self::Completion
        }
    }
}

fn number_exceeds(value: &Value, ceiling: i64) -> bool {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i > ceiling,
            None => n.as_f64().is_some_and(|f| f > ceiling as f64),
        },
        _ => false,
    }
}

/// Clamp a numeric field to `ceiling`. Absent or non-numeric fields are left as they are.
fn clamp_field(body: &mut Map<String, Value>, field: &str, ceiling: i64) {
    if let Some(v) = body.get_mut(field)
        && number_exceeds(v, ceiling)
    {
        *v = Value::from(ceiling);
    }
}

fn remove_fields(body: &mut Map<String, Value>, fields: &[&str]) {
    for f in fields {
        // shift_remove keeps the remaining keys in their original order.
        body.shift_remove(*f);
    }
}

pub fn map_chat_model<'a>(cfg: &'a RelayConfig, requested: &str) -> &'a str {
    cfg.chat_model_map
        .get(requested)
        .map(String::as_str)
        .unwrap_or(cfg.chat_model_default.as_str())
}

pub fn locale_suffix(cfg: &RelayConfig) -> String {
    let locale = if cfg.chat_locale.is_empty() {
        DEFAULT_LOCALE
    } else {
        cfg.chat_locale.as_str()
    };
    format!("{LOCALE_MARKER}: {locale}.")
}

/// Append the locale instruction to the last message, once.
fn append_locale(body: &mut Map<String, Value>, suffix: &str) {
    let Some(last) = body
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .and_then(|m| m.last_mut())
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    match last.get_mut("content") {
        Some(Value::String(content)) => {
            if !content.contains(LOCALE_MARKER) {
                content.push_str(suffix);
            }
        }
        None | Some(Value::Null) => {
            last.insert("content".to_string(), Value::String(suffix.to_string()));
        }
        // Multi-part content is forwarded untouched.
        Some(_) => {}
    }
}

pub fn transform_chat(body: &mut Map<String, Value>, cfg: &RelayConfig) {
    let requested = body.get("model").and_then(Value::as_str).unwrap_or("");
    let model = map_chat_model(cfg, requested).to_string();
    body.insert("model".to_string(), Value::String(model));

    if !body.contains_key("function_call") {
        append_locale(body, &locale_suffix(cfg));
    }

    remove_fields(body, &CHAT_DROPPED_FIELDS);
    clamp_field(body, "max_tokens", cfg.chat_max_tokens);
}

pub fn fim_prompt(prefix: &str, suffix: &str) -> String {
    format!("<fim_prefix>{prefix}<fim_suffix>{suffix}<fim_middle>")
}

pub fn transform_code(body: &mut Map<String, Value>, cfg: &RelayConfig) -> CodePromptStyle {
    remove_fields(body, &CODE_DROPPED_FIELDS);
    body.insert(
        "model".to_string(),
        Value::String(cfg.code_instruct_model.clone()),
    );
    clamp_field(body, "max_tokens", cfg.codex_max_tokens);

    let style = CodePromptStyle::for_model(&cfg.code_instruct_model);
    match style {
        CodePromptStyle::FimChat => {
            let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or("");
            let suffix = body.get("suffix").and_then(Value::as_str).unwrap_or("");
            let content = fim_prompt(prompt, suffix);
            remove_fields(body, &["prompt", "suffix"]);
            body.insert(
                "messages".to_string(),
                json!([{ "role": "user", "content": content }]),
            );
        }
        CodePromptStyle::SingleChoice => clamp_field(body, "n", 1),
        CodePromptStyle::Completion => {}
    }
    style
}

/// Replace `\u003c` / `\u003e` escapes with literal angle brackets. Only escapes produced by
/// the serializer are touched; an escaped backslash followed by `u003c` is left alone.
pub fn unescape_angle_brackets(json: &[u8]) -> Vec<u8> {
    const LT: &[u8] = b"\\u003c";
    const GT: &[u8] = b"\\u003e";

    let mut out = Vec::with_capacity(json.len());
    let mut i = 0;
    while i < json.len() {
        if json[i] == b'\\' {
            let rest = &json[i..];
            if rest.len() >= LT.len() && rest[..LT.len()].eq_ignore_ascii_case(LT) {
                out.push(b'<');
                i += LT.len();
                continue;
            }
            if rest.len() >= GT.len() && rest[..GT.len()].eq_ignore_ascii_case(GT) {
                out.push(b'>');
                i += GT.len();
                continue;
            }
            // Any other escape: copy it whole so its second byte is never re-read.
            out.push(b'\\');
            if let Some(&next) = json.get(i + 1) {
                out.push(next);
            }
            i += 2;
            continue;
        }
        out.push(json[i]);
        i += 1;
    }
    out
}

/// Serialize a transformed code body. FIM chat bodies get literal angle brackets.
pub fn encode_code_body(
    body: &Map<String, Value>,
    style: CodePromptStyle,
) -> serde_json::Result<Vec<u8>> {
    let bytes = serde_json::to_vec(body)?;
    Ok(match style {
        CodePromptStyle::FimChat => unescape_angle_brackets(&bytes),
        _ => bytes,
    })
}
