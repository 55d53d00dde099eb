//! Pure checks applied to search parameters before any network or database
//! work happens, plus video-id extraction from raw ids and URLs.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{HarvestError, HarvestResult};

pub const VIDEO_ID_LEN: usize = 11;
pub const MIN_CATEGORY: u8 = 1;
pub const MAX_CATEGORY: u8 = 44;
pub const DATE_FORMAT: &str = "%Y-%m-%d";

static BARE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z_-]{11}$").unwrap());

// Order matters: the first pattern that matches wins.
static EMBEDDED_ID_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?:v=|/)([0-9A-Za-z_-]{11})").unwrap(),
        Regex::new(r"youtu\.be/([0-9A-Za-z_-]{11})").unwrap(),
    ]
});

/// Returns the 11-character video id carried by `input`, which may be the id
/// itself, a `watch?v=` URL, a path form such as `/shorts/<id>` or a
/// `youtu.be/<id>` short link.
pub fn extract_video_id(input: &str) -> Option<String> {
    if input.len() == VIDEO_ID_LEN && BARE_ID.is_match(input) {
        return Some(input.to_string());
    }

    EMBEDDED_ID_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(input)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().to_string())
    })
}

pub fn validate_query(query: &str) -> HarvestResult<String> {
    let trimmed = query.trim();
    if trimmed.chars().count() < 2 {
        return Err(HarvestError::invalid(
            "Query must be at least 2 non-whitespace characters long",
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_category(category: &str) -> HarvestResult<u8> {
    let value: i64 = category
        .trim()
        .parse()
        .map_err(|_| HarvestError::invalid(format!("Category '{category}' is not a number")))?;
    if !(i64::from(MIN_CATEGORY)..=i64::from(MAX_CATEGORY)).contains(&value) {
        return Err(HarvestError::invalid(format!(
            "The videoCategoryId takes positions from {MIN_CATEGORY} to {MAX_CATEGORY}"
        )));
    }
    Ok(value as u8)
}

pub fn validate_max_results(max_results: i64) -> HarvestResult<u32> {
    if max_results <= 0 {
        return Err(HarvestError::invalid(
            "The result cannot be negative or zero",
        ));
    }
    u32::try_from(max_results)
        .map_err(|_| HarvestError::invalid(format!("max results {max_results} is too large")))
}

pub fn validate_date(input: &str) -> HarvestResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).map_err(|_| {
        HarvestError::invalid(format!("'{input}' is not a valid date (expected YYYY-MM-DD)"))
    })
}

pub fn validate_date_range(after: NaiveDate, before: NaiveDate) -> HarvestResult<()> {
    if after > before {
        return Err(HarvestError::invalid(format!(
            "published-after {after} is later than published-before {before}"
        )));
    }
    Ok(())
}
