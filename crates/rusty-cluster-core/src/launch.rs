//! Browser launch options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options used to launch one browser process.
///
/// The cluster holds one default set (from the `browser` config section) and,
/// in browser concurrency mode, an optional list of per-worker overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Path to Chrome/Chromium binary (auto-detected if omitted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,

    /// Run in headless mode (default: true).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Extra command line arguments passed to the browser.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_height: Option<u32>,

    /// Profile directory. A temporary one is used when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_dir: Option<String>,

    /// How long to wait for the browser process to come up (default: 20000).
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_launch_timeout() -> u64 {
    20_000
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            args: Vec::new(),
            window_width: None,
            window_height: None,
            user_data_dir: None,
            launch_timeout_ms: default_launch_timeout(),
        }
    }
}

impl LaunchOptions {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn with_chrome_path(mut self, path: impl Into<String>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_width = Some(width);
        self.window_height = Some(height);
        self
    }
}
