//! Folds standalone legacy option rows into the unified config blob.

use serde_json::{json, Map, Value};

use crate::aliases::{config_key, CONFIG_SECTION_ALIASES};
use crate::db::{OptionRow, Transaction};
use crate::error::{BackupError, BackupResult};
use crate::naming::snake_case_keys;

/// Option name under which the unified config blob is stored.
pub const CONFIG_OPTION_NAME: &str = "configs";
const OPTIONS_TABLE: &str = "options";

/// Defaults for every section of the unified config.
#[must_use]
pub fn default_config() -> Value {
    json!({
        "seo": {"title": "", "description": "", "keywords": []},
        "url": {"web_url": "", "admin_url": "", "server_url": "", "ws_url": ""},
        "mail_options": {
            "enable": false,
            "user": "",
            "pass": "",
            "options": {"host": "", "port": 465, "secure": true}
        },
        "comment_options": {
            "anti_spam": false,
            "disable_comment": false,
            "spam_keywords": [],
            "block_ips": [],
            "disable_no_chinese": false,
            "comment_should_audit": false,
            "record_ip_location": true
        },
        "backup_options": {
            "enable": false,
            "endpoint": null,
            "bucket": null,
            "region": null,
            "secret_id": null,
            "secret_key": null
        },
        "baidu_search_options": {"enable": false, "token": null},
        "bing_search_options": {"enable": false, "token": null},
        "algolia_search_options": {
            "enable": false,
            "api_key": "",
            "app_id": "",
            "index_name": "",
            "max_truncate_size": 10000
        },
        "meili_search_options": {"enable": false, "host": "", "api_key": "", "index_name": ""},
        "admin_extra": {"enable_admin_proxy": true, "background": "", "gaode_map_api_key": ""},
        "friend_link_options": {
            "allow_apply": true,
            "allow_sub_path": false,
            "enable_avatar_internalization": true
        },
        "text_options": {"macros": true},
        "feature_list": {"email_subscribe": false},
        "third_party_service_integration": {"github_token": ""},
        "auth_security": {"disable_password_login": false},
        "ai": {
            "enable_summary": false,
            "enable_auto_generate_summary": false,
            "ai_summary_target_language": "auto"
        }
    })
}

/// Merge legacy per-section option rows into the unified config and write it
/// back. Returns the sections that were replaced.
///
/// Rows are applied in lexicographic order of option name and each one
/// replaces its whole section, so when two rows map to one section the later
/// name wins. Nothing is written when no legacy row matched.
///
/// # Errors
/// Returns [`BackupError::Database`] when the options table cannot be read or written.
pub fn migrate_legacy_config<T: Transaction>(tx: &T) -> BackupResult<Vec<String>> {
    let mut options = tx.list_options().map_err(database_error)?;
    options.sort_by(|left, right| left.name.cmp(&right.name));

    let legacy: Vec<(&'static str, &OptionRow)> = options
        .iter()
        .filter(|row| row.name != CONFIG_OPTION_NAME)
        .filter_map(|row| {
            CONFIG_SECTION_ALIASES
                .get(config_key(&row.name).as_str())
                .map(|section| (*section, row))
        })
        .collect();
    if legacy.is_empty() {
        return Ok(Vec::new());
    }

    let existing = options.iter().find(|row| row.name == CONFIG_OPTION_NAME);
    let mut config = base_config(existing);

    let mut sections = Vec::new();
    for (section, row) in legacy {
        let Some(raw) = row.value.as_deref() else {
            tracing::debug!(option = row.name.as_str(), "skipping legacy option without a value");
            continue;
        };
        config.insert(section.to_string(), snake_case_keys(parse_legacy_value(raw)));
        tracing::info!(option = row.name.as_str(), section, "migrated legacy config section");
        if !sections.iter().any(|known| known == section) {
            sections.push(section.to_string());
        }
    }
    if sections.is_empty() {
        return Ok(sections);
    }

    let text = serde_json::to_string(&Value::Object(config))?;
    tx.put_option(CONFIG_OPTION_NAME, &text).map_err(database_error)?;
    Ok(sections)
}

fn database_error(source: crate::error::DbError) -> BackupError {
    BackupError::Database { table: OPTIONS_TABLE.to_string(), source }
}

/// Defaults overlaid section by section with the stored blob, if it parses.
fn base_config(existing: Option<&OptionRow>) -> Map<String, Value> {
    let mut config = match default_config() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let Some(raw) = existing.and_then(|row| row.value.as_deref()) else {
        return config;
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(stored)) => config.extend(stored),
        Ok(_) | Err(_) => {
            tracing::warn!("stored config blob is not a JSON object; starting from defaults");
        }
    }
    config
}

/// Best-effort typing of a legacy option value: JSON, then integer, float,
/// boolean, and finally the raw string.
#[must_use]
pub fn parse_legacy_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(raw.to_string())
}
