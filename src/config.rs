#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing::debug;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "harvest.db";
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_REGION: &str = "RU";
pub const DEFAULT_LANGUAGE: &str = "ru";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    /// Absent until the user provides one; only network commands need it.
    pub api_key: Option<String>,
    pub database_path: PathBuf,
    pub concurrency: usize,
    pub pool_size: usize,
    pub region_code: String,
    pub relevance_language: String,
    /// Upper bound on comment-thread pages per video; `None` walks them all.
    pub comment_page_limit: Option<usize>,
    pub api_base: String,
}

impl HarvestSettings {
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("YOUTUBE_API_KEY not set (export it or add it to the .env file)")
    }
}

pub fn load_settings() -> Result<HarvestSettings> {
    resolve_settings(SettingsOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub api_key: Option<String>,
    pub database_path: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<HarvestSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<HarvestSettings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<HarvestSettings> {
    let api_key = non_blank(overrides.api_key)
        .or_else(|| lookup_value("YOUTUBE_API_KEY", file_vars, &env_lookup));
    let database_path = overrides
        .database_path
        .or_else(|| lookup_value("HARVEST_DATABASE", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let concurrency = overrides
        .concurrency
        .filter(|value| *value > 0)
        .or_else(|| lookup_positive("HARVEST_CONCURRENCY", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_CONCURRENCY);
    let pool_size = lookup_positive("HARVEST_POOL_SIZE", file_vars, &env_lookup)
        .unwrap_or(DEFAULT_POOL_SIZE);
    let region_code = lookup_value("HARVEST_REGION", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    let relevance_language = lookup_value("HARVEST_LANGUAGE", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    let comment_page_limit = lookup_positive("HARVEST_COMMENT_PAGES", file_vars, &env_lookup);
    let api_base = lookup_value("YOUTUBE_API_BASE", file_vars, &env_lookup)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

    Ok(HarvestSettings {
        api_key,
        database_path,
        concurrency,
        pool_size,
        region_code,
        relevance_language,
        comment_page_limit,
        api_base,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

fn lookup_positive(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<usize> {
    lookup_value(key, file_vars, env_lookup)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

/// Reads `KEY=value` lines from a `.env` style file. A missing file yields no
/// values; lines that are not assignments are skipped and logged.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;

    let mut vars = HashMap::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_env_line(trimmed) {
            Some((key, value)) => {
                vars.insert(key.to_string(), value.to_string());
            }
            None => debug!(
                file = %path.display(),
                line = index + 1,
                "ignoring line that is not a KEY=value assignment"
            ),
        }
    }
    Ok(vars)
}

fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(value)
}
