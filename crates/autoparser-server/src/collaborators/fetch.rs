//! Fetch collaborator: plain HTTP GET plus HTML-to-text cleaning

use async_trait::async_trait;
use autoparser_common::checksum::content_hash;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use scraper::{ElementRef, Html, Node};
use std::time::Duration;

use super::{CollaboratorError, FetchedPage, Fetcher};

/// Elements whose text never reaches the cleaned output
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Elements that start a new line in the cleaned output
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "section", "article", "header",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "title", "main", "nav", "aside", "dd", "dt",
];

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, CollaboratorError> {
        let client = Client::builder().timeout(timeout).user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, CollaboratorError> {
        let response = self.client.get(url).send().await?;
        let http_status = response.status().as_u16();
        let charset = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_of);

        let raw_content = response.text().await?;
        let clean_text = clean_html(&raw_content);

        tracing::debug!(
            url,
            http_status,
            bytes = raw_content.len(),
            chars = clean_text.chars().count(),
            "Page fetched"
        );

        Ok(FetchedPage {
            http_status,
            content_hash: content_hash(&raw_content),
            raw_content,
            clean_text,
            charset: charset.or_else(|| Some("utf-8".to_string())),
        })
    }
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("charset="))
        .map(|c| c.trim_matches('"').to_lowercase())
}

/// Visible text of an HTML document, one block per line, whitespace collapsed
pub fn clean_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    collect_text(document.root_element(), &mut raw);

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_ELEMENTS.contains(&name) {
        return;
    }
    let block = BLOCK_ELEMENTS.contains(&name);
    if block {
        out.push('\n');
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
            },
            _ => {},
        }
    }

    if block {
        out.push('\n');
    }
}
