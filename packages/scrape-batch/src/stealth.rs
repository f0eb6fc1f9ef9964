//! Anti-detection request headers.
//!
//! Plain lookup tables: a weighted user-agent pool plus browser-like
//! header sets per stealth level.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

const CHROME_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
];

const SAFARI_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
];

const FIREFOX_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

const EDGE_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,es;q=0.8",
    "en-US,en;q=0.9,de;q=0.8",
    "en-US,en;q=0.9,fr;q=0.8",
];

const REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://www.duckduckgo.com/",
];

/// How much browser disguise to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StealthLevel {
    /// No headers
    Off,
    /// User agent only
    Low,
    /// Browser-like accept and fetch headers
    Medium,
    /// Client hints and a referer on top of `Medium`
    High,
}

impl StealthLevel {
    pub const ALL: [StealthLevel; 4] = [
        StealthLevel::Off,
        StealthLevel::Low,
        StealthLevel::Medium,
        StealthLevel::High,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StealthLevel::Off => "off",
            StealthLevel::Low => "low",
            StealthLevel::Medium => "medium",
            StealthLevel::High => "high",
        }
    }
}

impl fmt::Display for StealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StealthLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "stealth level",
                name: s.to_string(),
            })
    }
}

/// Stealth settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StealthConfig {
    pub level: StealthLevel,

    /// Pick a random user agent per request
    pub rotate_user_agent: bool,

    /// Headers that override generated ones
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self::preset(StealthLevel::Off)
    }
}

impl StealthConfig {
    pub fn preset(level: StealthLevel) -> Self {
        Self {
            level,
            rotate_user_agent: true,
            custom_headers: BTreeMap::new(),
        }
    }

    /// Add a header that always wins over generated ones.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.level != StealthLevel::Off
    }
}

/// Header generator.
#[derive(Debug, Clone, Default)]
pub struct StealthHeaders;

impl StealthHeaders {
    pub fn new() -> Self {
        Self
    }

    /// Random user agent, weighted toward common browsers.
    pub fn random_user_agent(&self) -> &'static str {
        let mut rng = rand::thread_rng();
        // 65% Chrome, 20% Safari, 10% Firefox, 5% Edge
        let pool = match rng.gen_range(0..20) {
            0..=12 => CHROME_AGENTS,
            13..=16 => SAFARI_AGENTS,
            17..=18 => FIREFOX_AGENTS,
            _ => EDGE_AGENTS,
        };
        pool.choose(&mut rng).copied().unwrap_or(CHROME_AGENTS[0])
    }

    /// Headers for one request at the configured level.
    pub fn headers(&self, config: &StealthConfig) -> BTreeMap<String, String> {
        if !config.is_enabled() {
            return config.custom_headers.clone();
        }

        let mut headers = BTreeMap::new();

        if config.rotate_user_agent {
            headers.insert("User-Agent".to_string(), self.random_user_agent().to_string());
        }

        if matches!(config.level, StealthLevel::Medium | StealthLevel::High) {
            let mut rng = rand::thread_rng();
            let language = ACCEPT_LANGUAGES.choose(&mut rng).copied().unwrap_or("en-US,en;q=0.9");
            for (name, value) in [
                (
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
                ),
                ("Accept-Encoding", "gzip, deflate, br"),
                ("Accept-Language", language),
                ("DNT", "1"),
                ("Connection", "keep-alive"),
                ("Upgrade-Insecure-Requests", "1"),
                ("Sec-Fetch-Dest", "document"),
                ("Sec-Fetch-Mode", "navigate"),
                ("Sec-Fetch-Site", "none"),
                ("Sec-Fetch-User", "?1"),
                ("Cache-Control", "max-age=0"),
            ] {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        if config.level == StealthLevel::High {
            let is_chrome = headers
                .get("User-Agent")
                .is_some_and(|ua| ua.contains("Chrome"));
            if is_chrome {
                headers.insert(
                    "sec-ch-ua".to_string(),
                    r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#.to_string(),
                );
                headers.insert("sec-ch-ua-mobile".to_string(), "?0".to_string());
                headers.insert("sec-ch-ua-platform".to_string(), r#""Windows""#.to_string());
            }
            let referer = REFERERS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(REFERERS[0]);
            headers.insert("Referer".to_string(), referer.to_string());
        }

        headers.extend(config.custom_headers.clone());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("HIGH".parse::<StealthLevel>().unwrap(), StealthLevel::High);
        assert_eq!(StealthLevel::Medium.to_string(), "medium");
        assert!("ninja".parse::<StealthLevel>().is_err());
    }

    #[test]
    fn test_off_adds_nothing() {
        let headers = StealthHeaders::new().headers(&StealthConfig::preset(StealthLevel::Off));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_low_is_user_agent_only() {
        let headers = StealthHeaders::new().headers(&StealthConfig::preset(StealthLevel::Low));
        assert_eq!(headers.keys().map(String::as_str).collect::<Vec<_>>(), ["User-Agent"]);
        assert!(headers["User-Agent"].starts_with("Mozilla/5.0"));
    }

    #[test]
    fn test_medium_adds_browser_headers() {
        let headers = StealthHeaders::new().headers(&StealthConfig::preset(StealthLevel::Medium));
        assert_eq!(headers.get("DNT").map(String::as_str), Some("1"));
        assert!(headers.contains_key("Accept-Language"));
        assert!(!headers.contains_key("Referer"));
    }

    #[test]
    fn test_high_adds_referer() {
        let headers = StealthHeaders::new().headers(&StealthConfig::preset(StealthLevel::High));
        assert!(REFERERS.contains(&headers["Referer"].as_str()));
        if headers["User-Agent"].contains("Chrome") {
            assert!(headers.contains_key("sec-ch-ua"));
        }
    }

    #[test]
    fn test_custom_headers_win() {
        let config = StealthConfig::preset(StealthLevel::Medium)
            .with_header("User-Agent", "my-agent")
            .with_header("X-Trace", "1");
        let headers = StealthHeaders::new().headers(&config);
        assert_eq!(headers["User-Agent"], "my-agent");
        assert_eq!(headers["X-Trace"], "1");
    }
}
