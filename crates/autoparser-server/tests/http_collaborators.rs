//! HTTP collaborators against mock endpoints

use autoparser_common::checksum::content_hash;
use autoparser_server::collaborators::{
    CollaboratorError, Extractor, Fetcher, HttpExtractor, HttpFetcher, HttpSearch, SearchProvider,
};
use autoparser_server::pipeline::{ExtractionStage, VariableBag};
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn search_results() -> serde_json::Value {
    json!({
        "results": [
            { "href": "http://MB.Tatarstan.ru/grants?utm_source=search" },
            { "href": "https://vc.ru/money/grants-2025" },
            { "href": "https://mert.tatarstan.ru/grant#apply" },
            { "link": "https://fondrt.ru/programs" },
            { "url": "https://minpromtorg.gov.ru/support" },
            { "title": "no location" },
            { "href": "ftp://files.gov.ru/order.pdf" }
        ]
    })
}

async fn search_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("max_results", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_results()))
        .mount(&server)
        .await;
    server
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_keeps_official_canonical_urls() {
    let server = search_server().await;
    let search = HttpSearch::new(format!("{}/search", server.uri()), TIMEOUT, "autoparser-test").unwrap();

    let hits = search.search("Татарстан", 50).await.unwrap();
    let urls: Vec<_> = hits.iter().map(|h| h.url.as_str()).collect();

    // Every query template returns the same results; duplicates collapse
    assert_eq!(
        urls,
        vec![
            "https://mb.tatarstan.ru/grants",
            "https://mert.tatarstan.ru/grant",
            "https://fondrt.ru/programs",
            "https://minpromtorg.gov.ru/support",
        ]
    );
    assert!(hits.iter().all(|h| h.is_official));
}

#[tokio::test]
async fn test_search_stops_at_max_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_results()))
        .expect(1)
        .mount(&server)
        .await;

    let search = HttpSearch::new(format!("{}/search", server.uri()), TIMEOUT, "autoparser-test").unwrap();
    let hits = search.search("Татарстан", 2).await.unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].url, "https://mb.tatarstan.ru/grants");
}

#[tokio::test]
async fn test_search_empty_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let search = HttpSearch::new(format!("{}/search", server.uri()), TIMEOUT, "autoparser-test").unwrap();
    assert!(search.search("Татарстан", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_search_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let search = HttpSearch::new(format!("{}/search", server.uri()), TIMEOUT, "autoparser-test").unwrap();
    let err = search.search("Татарстан", 10).await.unwrap_err();

    assert!(matches!(err, CollaboratorError::Status { status: 503, .. }), "got {:?}", err);
}

// ============================================================================
// Fetch
// ============================================================================

#[tokio::test]
async fn test_fetch_cleans_page() {
    let server = MockServer::start().await;
    let html = "<html><head><script>track()</script></head>\
                <body><h1>Грант</h1><p>До 500 000 рублей</p></body></html>";
    Mock::given(method("GET"))
        .and(path("/grant"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=UTF-8")
                .set_body_string(html),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(TIMEOUT, "autoparser-test").unwrap();
    let page = fetcher.fetch(&format!("{}/grant", server.uri())).await.unwrap();

    assert_eq!(page.http_status, 200);
    assert!(page.is_success());
    assert_eq!(page.raw_content, html);
    assert_eq!(page.clean_text, "Грант\nДо 500 000 рублей");
    assert_eq!(page.content_hash, content_hash(html));
    assert_eq!(page.charset.as_deref(), Some("utf-8"));
}

#[tokio::test]
async fn test_fetch_returns_error_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("<p>Страница не найдена</p>"))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(TIMEOUT, "autoparser-test").unwrap();
    let page = fetcher.fetch(&format!("{}/missing", server.uri())).await.unwrap();

    assert_eq!(page.http_status, 404);
    assert!(!page.is_success());
    assert_eq!(page.clean_text, "Страница не найдена");
}

#[tokio::test]
async fn test_fetch_unreachable_host() {
    let fetcher = HttpFetcher::new(Duration::from_millis(500), "autoparser-test").unwrap();
    let err = fetcher.fetch("http://127.0.0.1:1/nothing").await.unwrap_err();

    assert!(matches!(err, CollaboratorError::Http(_)), "got {:?}", err);
}

// ============================================================================
// Extract
// ============================================================================

fn bag() -> VariableBag {
    let mut bag = VariableBag::new();
    bag.insert("REGION".into(), "Татарстан".into());
    bag.insert("msr_srclnk".into(), "https://mert.tatarstan.ru/grant".into());
    bag
}

#[tokio::test]
async fn test_extract_sends_stage_and_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(header("authorization", "Bearer secret-key"))
        .and(body_partial_json(json!({
            "stage": "E4",
            "variables": { "REGION": "Татарстан" }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "msr_segmnt": "MSP", "msr_typeid": "GRANT" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let extractor = HttpExtractor::new(
        format!("{}/extract", server.uri()),
        Some("secret-key".to_string()),
        TIMEOUT,
    )
    .unwrap();
    let output = extractor
        .extract(ExtractionStage::E4, ExtractionStage::E4.prompt_key(), &bag())
        .await
        .unwrap();

    assert_eq!(output, json!({ "msr_segmnt": "MSP", "msr_typeid": "GRANT" }));
}

#[tokio::test]
async fn test_extract_reply_wrapped_in_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "Результат извлечения:\n```json\n{\"msr_geocde\": \"16\", \"msr_prglvl\": \"REG\"}\n```",
        ))
        .mount(&server)
        .await;

    let extractor = HttpExtractor::new(format!("{}/extract", server.uri()), None, TIMEOUT).unwrap();
    let output = extractor
        .extract(ExtractionStage::E1, ExtractionStage::E1.prompt_key(), &bag())
        .await
        .unwrap();

    assert_eq!(output, json!({ "msr_geocde": "16", "msr_prglvl": "REG" }));
}

#[tokio::test]
async fn test_extract_unparseable_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Не удалось найти данные"))
        .mount(&server)
        .await;

    let extractor = HttpExtractor::new(format!("{}/extract", server.uri()), None, TIMEOUT).unwrap();
    let err = extractor
        .extract(ExtractionStage::E2, ExtractionStage::E2.prompt_key(), &bag())
        .await
        .unwrap_err();

    assert!(matches!(err, CollaboratorError::InvalidResponse(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_extract_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let extractor = HttpExtractor::new(format!("{}/extract", server.uri()), None, TIMEOUT).unwrap();
    let err = extractor
        .extract(ExtractionStage::E3, ExtractionStage::E3.prompt_key(), &bag())
        .await
        .unwrap_err();

    assert!(matches!(err, CollaboratorError::Status { status: 429, .. }), "got {:?}", err);
}
