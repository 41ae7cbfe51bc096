use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use texting_robots::Robot;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Per-host robots.txt cache. `None` entries mean "no usable robots.txt" and
/// answer allow-all; unreachable or erroring robots endpoints fail open.
///
/// One mutex serializes cache reads and updates. Two workers racing on a cold
/// host may both fetch the file; the second write wins and the answers are
/// identical, so the duplicate request is tolerated.
pub struct RobotsCache {
    client: Client,
    user_agent: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    fetched_at: Instant,
    robot: Option<Robot>,
}

impl RobotsCache {
    pub fn new(client: Client, user_agent: String, ttl: Duration) -> Self {
        Self {
            client,
            user_agent,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the configured user-agent may fetch `url`.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return true;
        };
        let host_key = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&host_key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return allows(&entry.robot, url);
                }
            }
        }

        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host_key);
        let robot = self.fetch_robots(&robots_url).await;
        let allowed = allows(&robot, url);

        let mut cache = self.cache.lock().await;
        cache.insert(
            host_key,
            CacheEntry {
                fetched_at: Instant::now(),
                robot,
            },
        );

        allowed
    }

    async fn fetch_robots(&self, robots_url: &str) -> Option<Robot> {
        let response = match self.client.get(robots_url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(robots_url, error = %e, "robots fetch failed, treating as allow");
                return None;
            }
        };

        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        interpret_response(&self.user_agent, status, &body)
    }
}

fn allows(robot: &Option<Robot>, url: &Url) -> bool {
    robot.as_ref().map_or(true, |r| r.allowed(url.as_str()))
}

/// Missing robots.txt and server errors both fail open; anything else is
/// parsed for the given agent. An unparseable body also falls back to
/// allow-all.
fn interpret_response(user_agent: &str, status: u16, body: &[u8]) -> Option<Robot> {
    if status == 404 || status >= 500 {
        return None;
    }
    Robot::new(user_agent, body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_robots_allows_everything() {
        assert!(interpret_response("JooyaBot", 404, b"").is_none());
    }

    #[test]
    fn server_errors_fail_open() {
        assert!(interpret_response("JooyaBot", 500, b"").is_none());
        assert!(interpret_response("JooyaBot", 503, b"oops").is_none());
    }

    #[test]
    fn disallow_rules_apply_to_subpaths() {
        let robot = interpret_response("JooyaBot", 200, b"User-agent: *\nDisallow: /private");
        let url = Url::parse("https://example.com/private/x").unwrap();
        let open = Url::parse("https://example.com/public").unwrap();

        assert!(!allows(&robot, &url));
        assert!(allows(&robot, &open));
    }

    #[test]
    fn agent_specific_rules_win_over_wildcard() {
        let body = b"User-agent: *\nDisallow:\n\nUser-agent: JooyaBot\nDisallow: /blocked";
        let robot = interpret_response("JooyaBot", 200, body);
        let blocked = Url::parse("https://example.com/blocked/page").unwrap();
        let open = Url::parse("https://example.com/other").unwrap();

        assert!(!allows(&robot, &blocked));
        assert!(allows(&robot, &open));
    }

    #[test]
    fn empty_body_allows_everything() {
        let robot = interpret_response("JooyaBot", 200, b"");
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(allows(&robot, &url));
    }
}
