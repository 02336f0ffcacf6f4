//! Service configuration and endpoint normalization.
//!
//! A [`ServiceConfig`] captures everything needed to launch and reach one
//! backend instance: the base URL, the runner jar, the startup and idle
//! budgets, and passthrough JVM arguments. Launch arguments are a pure
//! function of the configuration.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use url::form_urlencoded;

use crate::error::ServiceError;

/// Default base URL of the web-runner service.
pub const DEFAULT_URL: &str = "http://localhost:8081";

/// Default idle timeout after which an inactive backend is stopped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for one supervised service endpoint.
///
/// Unrecognized concerns travel through `java_args` opaquely; the supervisor
/// never interprets them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    url: String,
    jar: Option<PathBuf>,
    startup_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    java_args: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            jar: None,
            startup_timeout: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            java_args: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Configuration for a locally launched backend running the given jar.
    pub fn new(jar: impl Into<PathBuf>) -> Self {
        Self {
            jar: Some(jar.into()),
            ..Self::default()
        }
    }

    /// Configuration for an externally managed backend reachable at `url`.
    ///
    /// No process is launched for such a service; `ensure_started` fails
    /// with [`ServiceError::NothingToStart`] while requests dispatch
    /// directly to the configured URL.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Override the base URL (default `http://localhost:8081`).
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Bound the time a launch attempt may take to reach readiness.
    ///
    /// When set, the readiness log marker is confirmed by actively polling
    /// the status endpoint before the service is reported ready.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Override the idle timeout (default 100 ms).
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep the backend alive indefinitely between requests.
    #[must_use]
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Append a passthrough JVM argument.
    #[must_use]
    pub fn with_java_arg(mut self, arg: impl Into<String>) -> Self {
        self.java_args.push(arg.into());
        self
    }

    /// Append several passthrough JVM arguments.
    #[must_use]
    pub fn with_java_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.java_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Path to the runner jar, if this service launches one.
    pub fn jar(&self) -> Option<&PathBuf> {
        self.jar.as_ref()
    }

    /// Configured startup budget.
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }

    /// Configured idle timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Normalize the configured URL into the service's endpoint key.
    ///
    /// Query and fragment are discarded and the path gains a trailing slash
    /// so request paths join below it. Two configurations naming the same
    /// scheme, host, port, and path map to the same endpoint.
    pub fn endpoint(&self) -> Result<Url, ServiceError> {
        let mut url = Url::parse(&self.url).map_err(|e| ServiceError::InvalidEndpoint {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        if url.host_str().is_none() || url.cannot_be_a_base() {
            return Err(ServiceError::InvalidEndpoint {
                url: self.url.clone(),
                reason: "endpoint must be an absolute http(s) URL with a host".to_string(),
            });
        }

        url.set_query(None);
        url.set_fragment(None);
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        Ok(url)
    }

    /// Build the backend launch arguments for the given port.
    ///
    /// Returns `None` for URL-only services. The shape matches what the
    /// runner jar expects: `-Dport=<port> -jar <jar>` followed by any
    /// passthrough arguments.
    pub fn launch_args(&self, port: u16) -> Option<Vec<String>> {
        let jar = self.jar.as_ref()?;
        let mut args = vec![
            format!("-Dport={port}"),
            "-jar".to_string(),
            jar.display().to_string(),
        ];
        args.extend(self.java_args.iter().cloned());
        Some(args)
    }
}

/// Query parameters for the backend's status endpoint.
#[derive(Debug, Clone)]
pub enum StatusQuery {
    /// A preassembled query string; leading `?` or `&` are tolerated.
    Raw(String),
    /// Key/value pairs, URL-encoded on serialization.
    Params(Vec<(String, String)>),
}

impl StatusQuery {
    /// Query from a raw string.
    pub fn raw(query: impl Into<String>) -> Self {
        Self::Raw(query.into())
    }

    /// Query from a single key/value pair.
    pub fn param(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Params(vec![(key.into(), value.into())])
    }

    /// Query from key/value pairs.
    pub fn params<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Params(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Render as a `?`-prefixed suffix, or an empty string when empty.
    pub fn to_suffix(&self) -> String {
        match self {
            Self::Raw(raw) => {
                let trimmed = raw.trim_start_matches(['?', '&']);
                if trimmed.is_empty() {
                    String::new()
                } else {
                    format!("?{trimmed}")
                }
            }
            Self::Params(pairs) if pairs.is_empty() => String::new(),
            Self::Params(pairs) => {
                let mut serializer = form_urlencoded::Serializer::new(String::new());
                for (key, value) in pairs {
                    serializer.append_pair(key, value);
                }
                format!("?{}", serializer.finish())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_normalizes() {
        let config = ServiceConfig::default();
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:8081/");
    }

    #[test]
    fn endpoint_strips_query_and_adds_trailing_slash() {
        let config = ServiceConfig::remote("http://build-host:9090/runner?level=1#frag");
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.as_str(), "http://build-host:9090/runner/");
    }

    #[test]
    fn endpoint_rejects_relative_url() {
        let config = ServiceConfig::remote("not a url");
        assert!(matches!(
            config.endpoint(),
            Err(ServiceError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn launch_args_follow_runner_shape() {
        let config = ServiceConfig::new("/opt/cc/cc-web-runner.jar").with_java_arg("-Xmx512m");
        let args = config.launch_args(8081).unwrap();
        assert_eq!(
            args,
            vec![
                "-Dport=8081".to_string(),
                "-jar".to_string(),
                "/opt/cc/cc-web-runner.jar".to_string(),
                "-Xmx512m".to_string(),
            ]
        );
    }

    #[test]
    fn launch_args_absent_for_remote_service() {
        let config = ServiceConfig::remote("http://localhost:8081");
        assert!(config.launch_args(8081).is_none());
    }

    #[test]
    fn status_query_encodes_pairs() {
        let query = StatusQuery::param("level", "SIMPLE_OPTIMIZATIONS");
        assert_eq!(query.to_suffix(), "?level=SIMPLE_OPTIMIZATIONS");

        let spaced = StatusQuery::params([("a", "1 2"), ("b", "x&y")]);
        assert_eq!(spaced.to_suffix(), "?a=1+2&b=x%26y");
    }

    #[test]
    fn status_query_raw_trims_leading_separators() {
        assert_eq!(StatusQuery::raw("?&level=1").to_suffix(), "?level=1");
        assert_eq!(StatusQuery::raw("").to_suffix(), "");
    }
}
