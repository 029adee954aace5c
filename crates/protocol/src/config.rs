use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Browser origins allowed by CORS (empty = CORS disabled)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Parameters of the synthetic video source attached to every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Target framerate
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

impl AppConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.video.fps == 0 || self.video.fps > 240 {
            issues.push(format!(
                "ERROR: video.fps must be between 1 and 240, got {}.",
                self.video.fps
            ));
        }

        if self.video.width < 16 || self.video.height < 16 {
            issues.push(format!(
                "ERROR: video resolution must be at least 16x16, got {}x{}.",
                self.video.width, self.video.height
            ));
        }

        // The H.264 pipeline downstream works on 4:2:0 subsampled planes.
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            issues.push(format!(
                "ERROR: video dimensions must be even for 4:2:0 encoding, got {}x{}.",
                self.video.width, self.video.height
            ));
        }

        for origin in &self.server.cors_origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                issues.push(format!(
                    "WARNING: CORS origin '{origin}' is not an http(s) URL and will never match."
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
