use crate::config::TransportConfig;
use crate::feed::dtd::{self, DtdPolicy};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors from a single fetch-and-parse attempt.
///
/// Every variant is non-fatal to the surrounding ingestion pass: the pipeline
/// logs it, leaves the source's watermark untouched, and moves on. The client
/// itself never retries; retry policy belongs to the host's scheduler.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("request timed out")]
    Timeout,
    /// Document carries a DTD and the policy prohibits it
    #[error("feed declares a DTD, rejected by policy (set transport dtd_policy to \"allow\" or \"ignore\" if this source is trusted)")]
    DtdProhibited,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("malformed feed: {0}")]
    Malformed(String),
    /// Fetch succeeded but the body contained no feed data
    #[error("response contained no feed data")]
    EmptyFeed,
    /// Response body exceeded the 10MB size limit
    #[error("response too large")]
    ResponseTooLarge,
}

/// Parsed feed: entries in feed listing order, which is not necessarily
/// chronological.
#[derive(Debug, Clone)]
pub struct Feed {
    pub entries: Vec<FeedEntry>,
}

/// One normalized syndication entry.
#[derive(Debug, Clone, Default)]
pub struct FeedEntry {
    pub title: String,
    pub summary: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// HTTP + XML front end for feed sources.
///
/// Built from an explicit [`TransportConfig`] so proxy and DTD settings are
/// visible at the call site rather than ambient process state. The client is
/// cheap to clone (reqwest pools connections internally) and safe to share
/// across concurrent fetches.
#[derive(Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    dtd_policy: DtdPolicy,
    timeout: Duration,
}

impl FeedClient {
    pub fn new(config: &TransportConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy_url) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(proxy_url)?;
            let bypass = config.no_proxy_hosts();
            if !bypass.is_empty() {
                proxy = proxy.no_proxy(reqwest::NoProxy::from_string(&bypass.join(",")));
            }
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
            dtd_policy: config.dtd_policy,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Performs one fetch-and-parse attempt against `url`.
    ///
    /// The HTTP round trip completes and the connection is released before
    /// this returns; callers never hold a live transport resource while
    /// working through the entries.
    pub async fn fetch(&self, url: &str) -> Result<Feed, FetchError> {
        // The timeout spans the whole transfer, headers and body alike: a
        // server that answers promptly and then stalls mid-body must not
        // hang the sequential pass.
        let mut bytes = tokio::time::timeout(self.timeout, async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(FetchError::Transport)?;

            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            read_limited_bytes(response, MAX_FEED_SIZE).await
        })
        .await
        .map_err(|_| FetchError::Timeout)??;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(FetchError::EmptyFeed);
        }

        match self.dtd_policy {
            DtdPolicy::Allow => {}
            DtdPolicy::Prohibit => {
                if dtd::contains_doctype(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))? {
                    return Err(FetchError::DtdProhibited);
                }
            }
            DtdPolicy::Ignore => {
                bytes = dtd::strip_doctype(bytes).map_err(|e| FetchError::Malformed(e.to_string()))?;
            }
        }

        parse_feed(&bytes)
    }
}

/// Normalizes a raw RSS/Atom document into [`Feed`].
///
/// Missing titles and summaries default to empty strings; `updated` stands in
/// for a missing `published` date. Entries without a link are kept here (the
/// filter excludes them later) so the watermark computation still sees their
/// dates.
fn parse_feed(bytes: &[u8]) -> Result<Feed, FetchError> {
    let parsed = feed_rs::parser::parse(bytes).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let entries = parsed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let title = entry.title.map(|t| t.content).unwrap_or_default();

            FeedEntry {
                title,
                summary,
                link,
                published,
            }
        })
        .collect();

    Ok(Feed { entries })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Transport)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item>
        <title>First</title>
        <link>https://example.com/first</link>
        <description>Summary one</description>
        <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
    </item>
    <item>
        <title>Second</title>
        <link>https://example.com/second</link>
        <pubDate>Wed, 03 Jan 2024 00:00:00 GMT</pubDate>
    </item>
</channel></rss>"#;

    fn client_with(policy: DtdPolicy) -> FeedClient {
        let config = TransportConfig {
            dtd_policy: policy,
            ..TransportConfig::default()
        };
        FeedClient::new(&config).unwrap()
    }

    async fn mock_feed(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn fetch_parses_entries_in_feed_order() {
        let server = mock_feed(VALID_RSS).await;
        let client = client_with(DtdPolicy::Prohibit);

        let feed = client.fetch(&format!("{}/feed", server.uri())).await.unwrap();
        assert_eq!(feed.entries.len(), 2);
        assert_eq!(feed.entries[0].title, "First");
        assert_eq!(feed.entries[0].summary, "Summary one");
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://example.com/first")
        );
        assert!(feed.entries[0].published.is_some());
        // Second entry has no description; summary defaults to empty.
        assert_eq!(feed.entries[1].summary, "");
    }

    #[tokio::test]
    async fn http_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_with(DtdPolicy::Prohibit)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn malformed_xml_is_a_parse_error() {
        let server = mock_feed("<not valid xml").await;
        let err = client_with(DtdPolicy::Prohibit)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn empty_body_is_classified() {
        let server = mock_feed("   \n ").await;
        let err = client_with(DtdPolicy::Prohibit)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyFeed));
    }

    #[tokio::test]
    async fn doctype_rejected_under_prohibit() {
        let body = format!("<!DOCTYPE rss SYSTEM \"http://example.com/r.dtd\">\n{VALID_RSS}");
        let server = mock_feed(&body).await;
        let err = client_with(DtdPolicy::Prohibit)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::DtdProhibited));
    }

    #[tokio::test]
    async fn doctype_stripped_under_ignore() {
        let body = format!("<!DOCTYPE rss SYSTEM \"http://example.com/r.dtd\">\n{VALID_RSS}");
        let server = mock_feed(&body).await;
        let feed = client_with(DtdPolicy::Ignore)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(feed.entries.len(), 2);
    }

    #[tokio::test]
    async fn stalled_body_hits_the_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Raw TCP server: sends headers and a sliver of a large declared
        // body, then holds the connection open without sending the rest.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\nContent-Length: 100000\r\n\r\n<rss>",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = TransportConfig {
            timeout_secs: 1,
            ..TransportConfig::default()
        };
        let client = FeedClient::new(&config).unwrap();

        let err = client
            .fetch(&format!("http://{addr}/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[tokio::test]
    async fn entry_without_link_is_still_parsed() {
        let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>No link here</title><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;
        let server = mock_feed(body).await;
        let feed = client_with(DtdPolicy::Prohibit)
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(feed.entries.len(), 1);
        assert!(feed.entries[0].link.is_none());
    }
}
