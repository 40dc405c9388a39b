//! # Session Configuration
//!
//! [`SessionConfig`] is assembled with a consuming builder and can be
//! overlaid from the environment. Explicit builder calls made after
//! [`SessionConfigBuilder::from_env`] win over environment values.
//!
//! ## Environment Variables
//!
//! - `DEVPROF_BASE_URL` - Dev server base URL (default: `http://localhost:3000`)
//! - `DEVPROF_PAGE` - Page path to profile (default: `/`)
//! - `DEVPROF_COMMAND` - Command that starts the dev server (default: `node ./node_modules/.bin/next`)
//! - `DEVPROF_PAUSE_MS` - Pause after each page load in milliseconds (default: 50)
//! - `DEVPROF_PAGE_LOAD_ITERATIONS` - Extra page loads after the first two (default: 0)
//! - `DEVPROF_STARTUP_TIMEOUT_SECS` - Bound on waiting for the server to answer (default: unbounded)
//! - `DEVPROF_EVENT_TIMEOUT_SECS` - Bound on each rebuild cycle, change to `built` (default: unbounded)
//! - `DEVPROF_CAPTURE_TRACE` - Collect trace spans emitted by the dev server (default: false)

use std::path::PathBuf;
use std::time::Duration;

use devprof_core::LaunchSpec;
use devprof_core::config::{
    ConfigError, get_env_bool, get_env_millis, get_env_secs, get_env_string, get_env_u32,
};
use devprof_http::DEFAULT_COLLECTOR_ADDR;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_PAGE: &str = "/";
pub const DEFAULT_COMMAND: &str = "node ./node_modules/.bin/next";
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(50);

/// Trace target the dev server understands
pub const ZIPKIN_TRACE_TARGET: &str = "ZIPKIN";

/// How rebuilds are triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Mutate each target file in turn; one dimension per file
    Auto {
        targets: Vec<PathBuf>,
        iterations: u32,
    },
    /// The operator edits files by hand
    Manual { iterations: u32 },
}

impl SessionMode {
    /// Total number of rebuild cycles the session will measure.
    pub fn total_cycles(&self) -> u64 {
        match self {
            SessionMode::Auto {
                targets,
                iterations,
            } => targets.len() as u64 * u64::from(*iterations),
            SessionMode::Manual { iterations } => u64::from(*iterations),
        }
    }
}

/// Everything one measurement session needs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: Url,
    /// Page path, always starting with `/`
    pub page: String,
    pub command: String,
    pub current_dir: Option<PathBuf>,
    event_url: Option<String>,
    pub mode: SessionMode,
    pub page_load_iterations: u32,
    pub pause: Duration,
    /// `None` waits for the server forever
    pub startup_timeout: Option<Duration>,
    /// `None` waits for each rebuild forever
    pub event_timeout: Option<Duration>,
    pub capture_trace: bool,
    pub collector_addr: String,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// URL requested for page-load samples.
    pub fn page_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.page
        )
    }

    /// Change-notification stream URL.
    pub fn event_url(&self) -> String {
        match &self.event_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/_next/webpack-hmr?page={}",
                self.base_url.as_str().trim_end_matches('/'),
                self.page
            ),
        }
    }

    /// How to start the dev server, including the trace toggle.
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.command);
        if self.capture_trace {
            spec = spec.with_trace_target(ZIPKIN_TRACE_TARGET);
        }
        if let Some(dir) = &self.current_dir {
            spec = spec.with_current_dir(dir);
        }
        spec
    }
}

/// Builder for [`SessionConfig`] with environment variable support
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    base_url: String,
    page: String,
    command: String,
    current_dir: Option<PathBuf>,
    event_url: Option<String>,
    mode: SessionMode,
    page_load_iterations: u32,
    pause: Duration,
    startup_timeout: Option<Duration>,
    event_timeout: Option<Duration>,
    capture_trace: bool,
    collector_addr: String,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page: DEFAULT_PAGE.to_string(),
            command: DEFAULT_COMMAND.to_string(),
            current_dir: None,
            event_url: None,
            mode: SessionMode::Manual { iterations: 0 },
            page_load_iterations: 0,
            pause: DEFAULT_PAUSE,
            startup_timeout: None,
            event_timeout: None,
            capture_trace: false,
            collector_addr: DEFAULT_COLLECTOR_ADDR.to_string(),
        }
    }
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from defaults overlaid with `DEVPROF_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(url) = get_env_string("DEVPROF_BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Some(page) = get_env_string("DEVPROF_PAGE") {
            builder = builder.page(page);
        }
        if let Some(command) = get_env_string("DEVPROF_COMMAND") {
            builder = builder.command(command);
        }
        if let Some(pause) = get_env_millis("DEVPROF_PAUSE_MS")? {
            builder = builder.pause(pause);
        }
        if let Some(n) = get_env_u32("DEVPROF_PAGE_LOAD_ITERATIONS")? {
            builder = builder.page_load_iterations(n);
        }
        if let Some(timeout) = get_env_secs("DEVPROF_STARTUP_TIMEOUT_SECS")? {
            builder = builder.startup_timeout(Some(timeout));
        }
        if let Some(timeout) = get_env_secs("DEVPROF_EVENT_TIMEOUT_SECS")? {
            builder = builder.event_timeout(Some(timeout));
        }
        if let Some(capture) = get_env_bool("DEVPROF_CAPTURE_TRACE")? {
            builder = builder.capture_trace(capture);
        }

        Ok(builder)
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn page(mut self, page: impl Into<String>) -> Self {
        self.page = page.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Override the change-notification stream URL.
    pub fn event_url(mut self, url: impl Into<String>) -> Self {
        self.event_url = Some(url.into());
        self
    }

    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn page_load_iterations(mut self, iterations: u32) -> Self {
        self.page_load_iterations = iterations;
        self
    }

    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn event_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.event_timeout = timeout;
        self
    }

    pub fn capture_trace(mut self, capture: bool) -> Self {
        self.capture_trace = capture;
        self
    }

    pub fn collector_addr(mut self, addr: impl Into<String>) -> Self {
        self.collector_addr = addr.into();
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let base_url = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::ValidationError(format!("invalid base URL '{}': {e}", self.base_url))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "base URL must be http or https, got '{}'",
                base_url.scheme()
            )));
        }

        if self.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "command must not be empty".to_string(),
            ));
        }

        if let SessionMode::Auto { targets, .. } = &self.mode
            && targets.is_empty()
        {
            return Err(ConfigError::ValidationError(
                "automatic mode needs at least one file to change".to_string(),
            ));
        }

        let page = if self.page.starts_with('/') {
            self.page
        } else {
            format!("/{}", self.page)
        };

        Ok(SessionConfig {
            base_url,
            page,
            command: self.command,
            current_dir: self.current_dir,
            event_url: self.event_url,
            mode: self.mode,
            page_load_iterations: self.page_load_iterations,
            pause: self.pause,
            startup_timeout: self.startup_timeout,
            event_timeout: self.event_timeout,
            capture_trace: self.capture_trace,
            collector_addr: self.collector_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devprof_core::TRACE_TARGET_ENV;
    use std::env;

    #[test]
    fn defaults_match_the_next_dev_server() {
        let config = SessionConfig::builder().build().unwrap();

        assert_eq!(config.page_url(), "http://localhost:3000/");
        assert_eq!(
            config.event_url(),
            "http://localhost:3000/_next/webpack-hmr?page=/"
        );
        assert_eq!(config.pause, DEFAULT_PAUSE);
        assert_eq!(config.startup_timeout, None);
        assert_eq!(config.event_timeout, None);
        assert!(config.launch_spec().env.is_empty());
    }

    #[test]
    fn page_is_joined_onto_base_url() {
        let config = SessionConfig::builder()
            .base_url("http://127.0.0.1:4000/")
            .page("blog/post")
            .build()
            .unwrap();

        assert_eq!(config.page, "/blog/post");
        assert_eq!(config.page_url(), "http://127.0.0.1:4000/blog/post");
        assert_eq!(
            config.event_url(),
            "http://127.0.0.1:4000/_next/webpack-hmr?page=/blog/post"
        );
    }

    #[test]
    fn event_url_can_be_overridden() {
        let config = SessionConfig::builder()
            .event_url("http://127.0.0.1:9/events")
            .build()
            .unwrap();
        assert_eq!(config.event_url(), "http://127.0.0.1:9/events");
    }

    #[test]
    fn capture_trace_sets_child_environment_only() {
        let config = SessionConfig::builder()
            .capture_trace(true)
            .build()
            .unwrap();

        let spec = config.launch_spec();
        assert_eq!(
            spec.env.get(TRACE_TARGET_ENV).map(String::as_str),
            Some(ZIPKIN_TRACE_TARGET)
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(SessionConfig::builder().base_url("not a url").build().is_err());
        assert!(
            SessionConfig::builder()
                .base_url("ftp://localhost")
                .build()
                .is_err()
        );
        assert!(SessionConfig::builder().command("  ").build().is_err());
        assert!(
            SessionConfig::builder()
                .mode(SessionMode::Auto {
                    targets: vec![],
                    iterations: 3,
                })
                .build()
                .is_err()
        );
    }

    #[test]
    fn total_cycles_counts_every_dimension() {
        let mode = SessionMode::Auto {
            targets: vec!["a.tsx".into(), "b.tsx".into()],
            iterations: 3,
        };
        assert_eq!(mode.total_cycles(), 6);
        assert_eq!(SessionMode::Manual { iterations: 4 }.total_cycles(), 4);
    }

    #[test]
    fn environment_overlay_then_explicit_override() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            env::set_var("DEVPROF_PAGE_LOAD_ITERATIONS", "5");
            env::set_var("DEVPROF_EVENT_TIMEOUT_SECS", "30");
            env::set_var("DEVPROF_PAUSE_MS", "10");
        }

        let config = SessionConfigBuilder::from_env()
            .unwrap()
            .pause(Duration::from_millis(75))
            .build()
            .unwrap();

        assert_eq!(config.page_load_iterations, 5);
        assert_eq!(config.event_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.pause, Duration::from_millis(75));

        unsafe {
            env::remove_var("DEVPROF_PAGE_LOAD_ITERATIONS");
            env::remove_var("DEVPROF_EVENT_TIMEOUT_SECS");
            env::remove_var("DEVPROF_PAUSE_MS");
        }
    }
}
