//! Page context captured fresh for every dispatched event.

use std::collections::BTreeMap;

use crate::now_ms;

/// Ambient facts about where an event happened.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageContext {
    pub timestamp_ms: u64,
    /// `url`, `userAgent`, `platform`, `browser`, `referrer`; empty values
    /// are omitted.
    pub values: BTreeMap<String, String>,
}

/// Host hook producing the page context. Called once per dispatch.
pub trait PageContextProvider {
    fn capture(&self) -> PageContext;
}

/// Fixed page facts with a live (or pinned) clock.
#[derive(Debug, Clone)]
pub struct StaticPageContext {
    pub url: String,
    pub user_agent: String,
    pub platform: String,
    pub browser: String,
    pub referrer: String,
    /// Pin the timestamp instead of reading the clock.
    pub fixed_time_ms: Option<u64>,
}

impl Default for StaticPageContext {
    fn default() -> Self {
        Self {
            url: String::new(),
            user_agent: format!("abtune/{}", env!("CARGO_PKG_VERSION")),
            platform: std::env::consts::OS.to_string(),
            browser: String::new(),
            referrer: String::new(),
            fixed_time_ms: None,
        }
    }
}

impl StaticPageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.fixed_time_ms = Some(timestamp_ms);
        self
    }
}

impl PageContextProvider for StaticPageContext {
    fn capture(&self) -> PageContext {
        let values = [
            ("url", &self.url),
            ("userAgent", &self.user_agent),
            ("platform", &self.platform),
            ("browser", &self.browser),
            ("referrer", &self.referrer),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();

        PageContext {
            timestamp_ms: self.fixed_time_ms.unwrap_or_else(now_ms),
            values,
        }
    }
}
