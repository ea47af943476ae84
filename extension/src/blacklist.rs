// Phishing domain gate
//
// Flagged navigations are redirected to the warning page with a one-time override token.
// Redeeming the token lets exactly one navigation of that tab to that domain through.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use url::Url;

use crate::config::BlacklistConfig;
use crate::host::TabId;

/// Host of `url`, lowercased, without a leading `www.`
pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(normalize(&host))
}

fn normalize(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    match domain.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => domain,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationVerdict {
    Allowed,
    /// Blacklisted, but the user already confirmed this visit
    Overridden,
    Flagged { redirect: String, token: String },
}

#[derive(Debug, Clone)]
struct OverrideToken {
    tab: TabId,
    domain: String,
    url: String,
    expires_at_ms: u64,
}

pub struct DomainBlacklist {
    config: BlacklistConfig,
    domains: HashSet<String>,
    tokens: HashMap<String, OverrideToken>,
    allowances: HashMap<TabId, String>,
}

impl DomainBlacklist {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            config,
            domains: HashSet::new(),
            tokens: HashMap::new(),
            allowances: HashMap::new(),
        }
    }

    /// Replace the whole set (install/update bulk load)
    pub fn load<I, S>(&mut self, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.domains = domains
            .into_iter()
            .map(|d| normalize(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        tracing::info!("🛡️ Blacklist loaded: {} domains", self.domains.len());
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn is_blacklisted(&self, domain: &str) -> bool {
        self.domains.contains(&normalize(domain))
    }

    pub fn check_navigation(&mut self, tab: TabId, url: &str, now_ms: u64) -> NavigationVerdict {
        self.tokens.retain(|_, t| t.expires_at_ms > now_ms);

        let Some(domain) = extract_domain(url) else {
            return NavigationVerdict::Allowed;
        };
        if !self.domains.contains(&domain) {
            return NavigationVerdict::Allowed;
        }
        if self.allowances.get(&tab) == Some(&domain) {
            self.allowances.remove(&tab);
            tracing::info!("User-confirmed visit to flagged domain {}", domain);
            return NavigationVerdict::Overridden;
        }

        let token = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
        let redirect = format!(
            "{}?flaggedSite={}&token={}",
            self.config.warning_page, encoded, token
        );
        tracing::warn!("⚠️ Blocked navigation to {} in tab {}", domain, tab);
        self.tokens.insert(
            token.clone(),
            OverrideToken {
                tab,
                domain,
                url: url.to_string(),
                expires_at_ms: now_ms.saturating_add(self.config.override_ttl_ms),
            },
        );
        NavigationVerdict::Flagged { redirect, token }
    }

    /// Consume an override token; returns the tab and original destination
    pub fn redeem(&mut self, token: &str, now_ms: u64) -> Option<(TabId, String)> {
        let entry = self.tokens.remove(token)?;
        if entry.expires_at_ms <= now_ms {
            tracing::debug!("Override token for {} expired", entry.domain);
            return None;
        }
        self.allowances.insert(entry.tab, entry.domain);
        Some((entry.tab, entry.url))
    }

    pub fn tab_closed(&mut self, tab: TabId) {
        self.allowances.remove(&tab);
        self.tokens.retain(|_, t| t.tab != tab);
    }
}
