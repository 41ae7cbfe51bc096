use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use jooya_core::config::FetchConfig;
use jooya_core::{CrawlError, ErrorCategory, FetchOutcome, SkipReason};

const ACCEPT_HEADER: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const MAX_REDIRECTS: usize = 10;

/// Build the shared HTTP client. One client serves every worker; reqwest
/// multiplexes connections internally.
pub fn build_client(config: &FetchConfig) -> Result<Client, CrawlError> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| CrawlError::Network(e.to_string()))
}

/// Fetch one page under the ingestion contract: bodies over the download cap
/// and non-HTML content are skipped before the full read, redirect chains are
/// capped, and transport failures come back classified instead of raised.
pub async fn fetch_page(client: &Client, url: &Url, config: &FetchConfig) -> FetchOutcome {
    debug!(url = %url, "fetching");

    let response = match client
        .get(url.as_str())
        .header(ACCEPT, ACCEPT_HEADER)
        .header(ACCEPT_LANGUAGE, config.accept_language.as_str())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_redirect() => {
            return FetchOutcome::Skipped {
                reason: SkipReason::RedirectLoop,
                status: None,
            }
        }
        Err(e) => {
            warn!(url = %url, error = %e, "fetch failed");
            return FetchOutcome::Failed {
                category: classify_transport_error(&e),
                message: e.to_string(),
            };
        }
    };

    let status = response.status().as_u16();

    if let Some(length) = response.content_length() {
        if length > config.max_download_bytes as u64 {
            return FetchOutcome::Skipped {
                reason: SkipReason::BodyTooLarge,
                status: Some(status),
            };
        }
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !is_html_content_type(&content_type) {
        return FetchOutcome::Skipped {
            reason: SkipReason::NonHtmlContent,
            status: Some(status),
        };
    }

    // Content-Length can lie or be absent; enforce the cap on the stream too.
    let mut body = Vec::new();
    let mut response = response;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > config.max_download_bytes {
                    return FetchOutcome::Skipped {
                        reason: SkipReason::BodyTooLarge,
                        status: Some(status),
                    };
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(url = %url, error = %e, "body read failed");
                return FetchOutcome::Failed {
                    category: classify_transport_error(&e),
                    message: e.to_string(),
                };
            }
        }
    }

    FetchOutcome::Fetched {
        status,
        body: decode_body(&body, charset_from_content_type(&content_type).as_deref()),
    }
}

/// Map a transport error onto the categories recorded in the frontier.
pub fn classify_transport_error(error: &reqwest::Error) -> ErrorCategory {
    if error.is_timeout() {
        ErrorCategory::NetworkTimeout
    } else if error.is_connect() {
        ErrorCategory::ConnectionError
    } else {
        ErrorCategory::Unexpected
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("text/html") || lower.contains("application/xhtml+xml")
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("charset=")
            .map(|cs| cs.trim_matches('"').to_string())
    })
}

/// Decode with the server-declared encoding, falling back to UTF-8.
/// Undecodable sequences are replaced, never fatal.
fn decode_body(bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = charset
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_content_types_pass_the_gate() {
        assert!(is_html_content_type("text/html"));
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(is_html_content_type("TEXT/HTML"));
    }

    #[test]
    fn non_html_content_types_are_rejected() {
        assert!(!is_html_content_type("application/json"));
        assert!(!is_html_content_type("image/png"));
        assert!(!is_html_content_type(""));
    }

    #[test]
    fn charset_is_read_from_the_content_type() {
        assert_eq!(
            charset_from_content_type("text/html; charset=ISO-8859-1").as_deref(),
            Some("ISO-8859-1")
        );
        assert_eq!(
            charset_from_content_type("text/html; charset=\"utf-8\"").as_deref(),
            Some("utf-8")
        );
        assert_eq!(charset_from_content_type("text/html"), None);
    }

    #[test]
    fn body_decodes_with_declared_encoding() {
        // "café" in latin-1
        let latin1 = [0x63, 0x61, 0x66, 0xe9];
        assert_eq!(decode_body(&latin1, Some("ISO-8859-1")), "café");
        assert_eq!(decode_body("café".as_bytes(), None), "café");
    }

    #[test]
    fn invalid_bytes_are_replaced_not_fatal() {
        let broken = [0x68, 0x69, 0xff, 0xfe];
        let decoded = decode_body(&broken, None);
        assert!(decoded.starts_with("hi"));
    }

    #[test]
    fn unknown_charset_falls_back_to_utf8() {
        assert_eq!(decode_body("ok".as_bytes(), Some("not-a-charset")), "ok");
    }
}
