use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8838;
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_METADATA_DIR: &str = "/tmp/gzcaas/metadata";
pub const DEFAULT_WORKDIR: &str = "/tmp/gzcaas/workdir";

/// Server-side configuration, populated by the CLI layer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Mount path of the command WebSocket endpoint.
    pub path: String,
    pub shell: String,
    /// Server-enforced environment; wins over request environment on conflict.
    pub environment: HashMap<String, String>,
    /// Command timeout in seconds; 0 disables the deadline.
    pub timeout: u64,
    pub client_id: String,
    pub client_secret: String,
    /// Delegated auth endpoint; used when no static credentials are set.
    pub auth_service: String,
    pub metadata_dir: String,
    pub work_dir: String,
    pub auto_clean_workdir: bool,
    pub terminal: TerminalConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            path: "/".to_string(),
            shell: DEFAULT_SHELL.to_string(),
            environment: HashMap::new(),
            timeout: 0,
            client_id: String::new(),
            client_secret: String::new(),
            auth_service: String::new(),
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            work_dir: DEFAULT_WORKDIR.to_string(),
            auto_clean_workdir: false,
            terminal: TerminalConfig::default(),
        }
    }
}

/// Interactive terminal sub-server settings.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub enabled: bool,
    pub path: String,
    pub shell: String,
    pub driver: String,
    pub driver_image: String,
    pub init_command: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/terminal".to_string(),
            shell: String::new(),
            driver: String::new(),
            driver_image: String::new(),
            init_command: String::new(),
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:8838/`.
    pub server: String,
    pub client_id: String,
    pub client_secret: String,
    /// Local guard on a single exec; surfaces exit 1 on expiry.
    pub exec_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            exec_timeout: Duration::from_secs(7 * 24 * 3600),
        }
    }
}
