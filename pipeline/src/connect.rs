//! Connect-with-retry for the store and broker endpoints.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Pause after every failed attempt.
    pub interval: Duration,
    /// `None` retries until a connection succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no {0} endpoints configured")]
    NoEndpoints(String),
    #[error("could not connect to {what} after {attempts} attempts: {last_error}")]
    Exhausted {
        what: String,
        attempts: u32,
        last_error: String,
    },
}

/// Cycles through the configured endpoints, primary first.
pub struct EndpointRotation {
    endpoints: Vec<String>,
    counter: usize,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            counter: 0,
        }
    }

    pub fn select(&mut self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.endpoints[self.counter % self.endpoints.len()].clone();
        self.counter += 1;
        Some(endpoint)
    }
}

/// Hides the password part of a connection url for logging.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end + 3 => {
            let userinfo = &url[scheme_end + 3..at];
            match userinfo.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// Calls `connect` on each endpoint in turn until one succeeds.
///
/// A failure on one endpoint moves on to the next alternate; after the last
/// one it starts over with the primary. Every failure is logged.
pub async fn connect_with_retry<T, E, F, Fut>(
    what: &str,
    endpoints: &[String],
    settings: &RetrySettings,
    mut connect: F,
) -> Result<T, ConnectError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut rotation = EndpointRotation::new(endpoints.to_vec());
    let mut attempts = 0u32;

    loop {
        let Some(endpoint) = rotation.select() else {
            return Err(ConnectError::NoEndpoints(what.to_string()));
        };
        attempts += 1;

        tracing::info!(endpoint = %redact(&endpoint), attempt = attempts, "trying {}", what);
        match connect(endpoint.clone()).await {
            Ok(conn) => {
                tracing::info!(endpoint = %redact(&endpoint), "{} connection successful", what);
                return Ok(conn);
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %redact(&endpoint),
                    attempt = attempts,
                    error = %e,
                    "{} connection failed",
                    what
                );

                if settings.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(ConnectError::Exhausted {
                        what: what.to_string(),
                        attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        }

        tokio::time::sleep(settings.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn endpoints(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rotation_wraps_around() {
        let mut rotation = EndpointRotation::new(endpoints(&["a", "b"]));
        let picked: Vec<_> = (0..5).filter_map(|_| rotation.select()).collect();
        assert_eq!(picked, endpoints(&["a", "b", "a", "b", "a"]));
        assert_eq!(EndpointRotation::new(vec![]).select(), None);
    }

    #[test]
    fn redacts_passwords_only() {
        assert_eq!(
            redact("postgres://admin:secret@db:5432/tx"),
            "postgres://admin:***@db:5432/tx"
        );
        assert_eq!(redact("postgres://db:5432/tx"), "postgres://db:5432/tx");
        assert_eq!(redact("postgres://admin@db/tx"), "postgres://admin@db/tx");
    }

    #[tokio::test(start_paused = true)]
    async fn falls_over_to_alternate_endpoint() {
        let tried = Arc::new(Mutex::new(Vec::new()));
        let log = tried.clone();

        let conn = connect_with_retry(
            "store",
            &endpoints(&["primary", "alternate"]),
            &RetrySettings::default(),
            move |endpoint| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(endpoint.clone());
                    if endpoint == "alternate" {
                        Ok(endpoint)
                    } else {
                        Err("refused")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(conn, "alternate");
        assert_eq!(*tried.lock().unwrap(), endpoints(&["primary", "alternate"]));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_same_endpoint_until_it_comes_up() {
        let mut calls = 0;
        let conn = connect_with_retry(
            "broker",
            &endpoints(&["only"]),
            &RetrySettings::default(),
            |_| {
                calls += 1;
                let up = calls >= 3;
                async move { if up { Ok(()) } else { Err("down") } }
            },
        )
        .await;

        assert!(conn.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let settings = RetrySettings {
            interval: Duration::from_secs(1),
            max_attempts: Some(2),
        };
        let result: Result<(), _> =
            connect_with_retry("store", &endpoints(&["x"]), &settings, |_| async {
                Err::<(), _>("down")
            })
            .await;

        assert!(matches!(
            result,
            Err(ConnectError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn no_endpoints_is_an_error() {
        let result: Result<(), _> =
            connect_with_retry("store", &[], &RetrySettings::default(), |_| async {
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(result, Err(ConnectError::NoEndpoints(_))));
    }
}
