//! Search collaborator over a JSON web-search endpoint
//!
//! Runs a fixed set of query templates for the region, canonicalizes every hit,
//! keeps official domains and stops at `max_results`.

use async_trait::async_trait;
use regex::RegexSet;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use super::{CollaboratorError, SearchHit, SearchProvider};

/// Hits requested per query template
const RESULTS_PER_QUERY: usize = 20;

/// Query templates issued, one after another, for each search
pub const QUERY_COUNT: usize = 4;

/// Domain patterns of official support portals
const OFFICIAL_PATTERNS: &[&str] = &[
    r"\.gov\.ru$",
    r"\.gosuslugi\.ru$",
    r"\.tatarstan\.ru$",
    r"\.mos\.ru$",
    r"\.spb\.ru$",
    r"moibiznes",
    r"мойбизнес",
    r"moibusiness",
    r"mb\d+",
    r"min\w+\.ru$",
    r"fond\w*\.ru$",
    r"invest\w*\.ru$",
    r"support\w*\.ru$",
    r"grant\w*\.ru$",
    r"\.edu\.ru$",
];

fn query_templates(region: &str) -> [String; QUERY_COUNT] {
    [
        format!("меры поддержки бизнес {} официальный сайт", region),
        format!("субсидии гранты {} мой бизнес официальный сайт", region),
        format!("фонд поддержки предпринимательства {} программа положение pdf", region),
        format!("постановление правительства {} субсидия 2025 site:*.ru", region),
    ]
}

/// Force https, lowercase the host, drop query and fragment
pub fn canonicalize(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_scheme("https").ok()?;
    url.set_query(None);
    url.set_fragment(None);
    // Hosts of http(s) URLs come back lowercased from the parser
    url.host_str()?;
    Some(url.to_string())
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    href: Option<String>,
    link: Option<String>,
    url: Option<String>,
}

impl SearchResult {
    fn location(&self) -> Option<&str> {
        self.href
            .as_deref()
            .or(self.link.as_deref())
            .or(self.url.as_deref())
    }
}

pub struct HttpSearch {
    client: Client,
    endpoint: String,
    official: RegexSet,
}

impl HttpSearch {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder().timeout(timeout).user_agent(user_agent).build()?;
        let official = RegexSet::new(OFFICIAL_PATTERNS)
            .map_err(|e| CollaboratorError::Other(format!("invalid domain pattern: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            official,
        })
    }

    pub fn is_official_domain(&self, domain: &str) -> bool {
        self.official.is_match(&domain.to_lowercase())
    }

    async fn query(&self, text: &str) -> Result<Vec<String>, CollaboratorError> {
        let limit = RESULTS_PER_QUERY.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", text), ("max_results", limit.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                status: response.status().as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let body: SearchResponse = response.json().await?;
        Ok(body
            .results
            .iter()
            .filter_map(|r| r.location().map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl SearchProvider for HttpSearch {
    async fn search(
        &self,
        region: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, CollaboratorError> {
        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        for text in query_templates(region) {
            for raw in self.query(&text).await? {
                let Some(url) = canonicalize(&raw) else {
                    continue;
                };
                let official = Url::parse(&url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| self.is_official_domain(h)))
                    .unwrap_or(false);

                if official && seen.insert(url.clone()) {
                    hits.push(SearchHit {
                        url,
                        is_official: true,
                    });
                }
                if hits.len() >= max_results {
                    tracing::debug!(region, count = hits.len(), "Search result limit reached");
                    return Ok(hits);
                }
            }
        }

        tracing::debug!(region, count = hits.len(), "Search finished");
        Ok(hits)
    }
}
