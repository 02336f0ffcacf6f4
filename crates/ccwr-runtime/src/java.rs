//! Java runtime discovery and version validation.
//!
//! Resolution precedence: the `CCWR_JAVA` environment variable (explicit
//! override, never falls through), then `JAVA_HOME/bin/java`, then `java`
//! on `PATH`. Each candidate must be executable and report a version
//! satisfying the backend's minimum (1.8 by default).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use ccwr_core::error::ServiceError;
use ccwr_core::ports::RuntimeLocator;

/// Environment variable overriding Java discovery with an explicit path.
pub const JAVA_PATH_ENV: &str = "CCWR_JAVA";

/// Minimum Java version the backend jar supports.
const MIN_JAVA_VERSION: (u32, u32) = (1, 8);

/// [`RuntimeLocator`] implementation discovering a local Java installation.
#[derive(Debug, Clone)]
pub struct JavaLocator {
    min_version: (u32, u32),
}

impl JavaLocator {
    /// Locator requiring the default minimum version (1.8).
    pub fn new() -> Self {
        Self {
            min_version: MIN_JAVA_VERSION,
        }
    }

    /// Locator with a custom minimum `(major, minor)` version.
    pub fn with_min_version(major: u32, minor: u32) -> Self {
        Self {
            min_version: (major, minor),
        }
    }

    /// Validate one candidate executable, returning it on success.
    async fn check_candidate(&self, path: &Path) -> Result<PathBuf, String> {
        if !path.exists() {
            return Err(format!("{} does not exist", path.display()));
        }
        if !is_executable(path) {
            return Err(format!("{} is not executable", path.display()));
        }

        match java_version(path).await {
            Some(version) if version >= self.min_version => {
                debug!(java = %path.display(), ?version, "java candidate accepted");
                Ok(path.to_path_buf())
            }
            Some(version) => Err(format!(
                "{} is Java {}.{}, need {}.{} or newer",
                path.display(),
                version.0,
                version.1,
                self.min_version.0,
                self.min_version.1
            )),
            None => {
                // Version unknown; accept and let the launch surface problems.
                warn!(java = %path.display(), "could not determine java version, skipping validation");
                Ok(path.to_path_buf())
            }
        }
    }
}

impl Default for JavaLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeLocator for JavaLocator {
    async fn locate(&self) -> Result<PathBuf, ServiceError> {
        // Explicit override wins and does not fall through.
        if let Ok(override_path) = std::env::var(JAVA_PATH_ENV) {
            let path = PathBuf::from(override_path);
            return self.check_candidate(&path).await.map_err(|reason| {
                ServiceError::PrerequisiteMissing(format!("{JAVA_PATH_ENV} override rejected: {reason}"))
            });
        }

        let mut rejections = Vec::new();

        if let Ok(java_home) = std::env::var("JAVA_HOME") {
            let candidate = Path::new(&java_home).join("bin").join(java_binary_name());
            match self.check_candidate(&candidate).await {
                Ok(path) => return Ok(path),
                Err(reason) => rejections.push(reason),
            }
        }

        if let Ok(candidate) = which::which(java_binary_name()) {
            match self.check_candidate(&candidate).await {
                Ok(path) => return Ok(path),
                Err(reason) => rejections.push(reason),
            }
        }

        let detail = if rejections.is_empty() {
            "no candidates on JAVA_HOME or PATH".to_string()
        } else {
            rejections.join("; ")
        };
        Err(ServiceError::PrerequisiteMissing(format!(
            "{detail} (set {JAVA_PATH_ENV} or install a JRE {}.{}+)",
            self.min_version.0, self.min_version.1
        )))
    }
}

fn java_binary_name() -> &'static str {
    if cfg!(windows) { "java.exe" } else { "java" }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}

/// Query `java -version` for the candidate's `(major, minor)` version.
///
/// The JVM prints version information on stderr.
async fn java_version(path: &Path) -> Option<(u32, u32)> {
    let output = Command::new(path).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stderr);
    parse_java_version(&text)
}

/// Parse the quoted version out of `java -version` output.
///
/// Handles both the legacy scheme (`java version "1.8.0_292"`) and the
/// modern one (`openjdk version "17.0.1" 2021-10-19`). Only the leading
/// numeric portion of each component is read, so `"21-ea"` parses as
/// `(21, 0)`.
fn parse_java_version(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().find(|l| l.contains("version"))?;
    let start = line.find('"')? + 1;
    let end = start + line[start..].find('"')?;
    parse_version_tuple(&line[start..end])
}

fn parse_version_tuple(version_str: &str) -> Option<(u32, u32)> {
    let mut parts = version_str.split('.');
    let parse_numeric = |part: &str| -> Option<u32> {
        let numeric: String = part.chars().take_while(char::is_ascii_digit).collect();
        numeric.parse::<u32>().ok()
    };
    let major = parse_numeric(parts.next()?)?;
    let minor = parts.next().and_then(parse_numeric).unwrap_or(0);
    Some((major, minor))
}
