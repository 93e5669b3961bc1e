use std::collections::HashMap;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, ServerConfig, TerminalConfig, DEFAULT_METADATA_DIR, DEFAULT_WORKDIR};
use crate::protocol::CommandRequest;

#[derive(Parser, Debug)]
#[command(name = "caas")]
#[command(about = "commands as a service", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the caas server
    Server(ServerArgs),
    /// Run a script on a caas server
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Server port
    #[arg(short, long, env = "PORT", default_value_t = 8838)]
    pub port: u16,

    /// Mount path of the command endpoint
    #[arg(long, env = "CAAS_PATH", default_value = "/")]
    pub path: String,

    /// Shell used to run scripts
    #[arg(short, long, env = "CAAS_SHELL", default_value = "sh")]
    pub shell: String,

    /// Base directory for per-run working directories
    #[arg(short = 'c', long, alias = "context", env = "CAAS_CONTEXT", default_value = DEFAULT_WORKDIR)]
    pub workdir: String,

    /// Server-enforced environment entries (KEY=VAL, repeatable)
    #[arg(short, long = "environment", env = "CAAS_ENVIRONMENT", value_parser = parse_key_val, value_delimiter = ',')]
    pub environment: Vec<(String, String)>,

    /// Client id for static auth
    #[arg(long, env = "CAAS_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// Client secret for static auth
    #[arg(long, env = "CAAS_CLIENT_SECRET", default_value = "")]
    pub client_secret: String,

    /// URL of a delegated auth service
    #[arg(long, env = "CAAS_AUTH_SERVICE", default_value = "")]
    pub auth_service: String,

    /// Command timeout in seconds (0 disables)
    #[arg(short = 't', long, env = "CAAS_TIMEOUT", default_value_t = 1800)]
    pub timeout: u64,

    /// Base directory for per-run metadata
    #[arg(long, env = "CAAS_METADATA_DIR", default_value = DEFAULT_METADATA_DIR)]
    pub metadatadir: String,

    /// Remove a run's working directory after success
    #[arg(long, env = "CAAS_IS_AUTO_CLEAN_WORKDIR")]
    pub is_auto_clean_workdir: bool,

    /// Enable the interactive terminal endpoint
    #[arg(long, env = "CAAS_TERMINAL")]
    pub terminal: bool,

    #[arg(long, env = "CAAS_TERMINAL_PATH", default_value = "/terminal")]
    pub terminal_path: String,

    #[arg(long, env = "CAAS_TERMINAL_SHELL", default_value = "")]
    pub terminal_shell: String,

    /// Terminal driver (host, or a container engine)
    #[arg(long, env = "CAAS_TERMINAL_DRIVER", default_value = "")]
    pub terminal_driver: String,

    #[arg(long, env = "CAAS_TERMINAL_DRIVER_IMAGE", default_value = "")]
    pub terminal_driver_image: String,

    #[arg(long, env = "CAAS_TERMINAL_INIT_COMMAND", default_value = "")]
    pub terminal_init_command: String,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            path: self.path,
            shell: self.shell,
            environment: self.environment.into_iter().collect(),
            timeout: self.timeout,
            client_id: self.client_id,
            client_secret: self.client_secret,
            auth_service: self.auth_service,
            metadata_dir: self.metadatadir,
            work_dir: self.workdir,
            auto_clean_workdir: self.is_auto_clean_workdir,
            terminal: TerminalConfig {
                enabled: self.terminal,
                path: self.terminal_path,
                shell: self.terminal_shell,
                driver: self.terminal_driver,
                driver_image: self.terminal_driver_image,
                init_command: self.terminal_init_command,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server URL, e.g. ws://127.0.0.1:8838/
    #[arg(short, long, env = "CAAS_SERVER")]
    pub server: String,

    /// Script source to run
    #[arg(long, env = "CAAS_SCRIPT")]
    pub script: Option<String>,

    /// Path of a script file to run (wins over --script)
    #[arg(long, env = "CAAS_SCRIPT_PATH")]
    pub script_path: Option<String>,

    #[arg(long, env = "CAAS_CLIENT_ID", default_value = "")]
    pub client_id: String,

    #[arg(long, env = "CAAS_CLIENT_SECRET", default_value = "")]
    pub client_secret: String,

    /// Extra environment for the remote command (KEY=VAL, repeatable)
    #[arg(short, long = "environment", value_parser = parse_key_val)]
    pub environment: Vec<(String, String)>,

    /// Absolute path overriding the server's workdir base
    #[arg(long, default_value = "")]
    pub workdirbase: String,

    /// OS user the server should run the script as
    #[arg(long, default_value = "")]
    pub user: String,
}

impl ClientArgs {
    pub fn into_parts(self) -> anyhow::Result<(ClientConfig, CommandRequest)> {
        let script = match self.script_path {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read script file: {path}"))?,
            None => self.script.unwrap_or_default(),
        };
        if script.is_empty() {
            bail!("script is required");
        }

        let cfg = ClientConfig {
            server: self.server,
            client_id: self.client_id,
            client_secret: self.client_secret,
            ..ClientConfig::default()
        };
        let request = CommandRequest {
            script,
            environment: self.environment.into_iter().collect::<HashMap<_, _>>(),
            workdirbase: self.workdirbase,
            user: self.user,
            ..CommandRequest::default()
        };
        Ok((cfg, request))
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VAL, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_service_defaults() {
        let cli = Cli::try_parse_from(["caas", "server"]).unwrap();
        let Commands::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let cfg = args.into_config();
        assert_eq!(cfg.port, 8838);
        assert_eq!(cfg.shell, "sh");
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.timeout, 1800);
        assert!(!cfg.terminal.enabled);
    }

    #[test]
    fn environment_flag_parses_key_val_pairs() {
        let cli = Cli::try_parse_from(["caas", "server", "-e", "A=1", "-e", "B=x=y"]).unwrap();
        let Commands::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let cfg = args.into_config();
        assert_eq!(cfg.environment.get("A").unwrap(), "1");
        assert_eq!(cfg.environment.get("B").unwrap(), "x=y");
    }

    #[test]
    fn malformed_environment_entry_is_rejected() {
        assert!(Cli::try_parse_from(["caas", "server", "-e", "NOEQ"]).is_err());
    }

    #[test]
    fn client_requires_a_script() {
        let cli = Cli::try_parse_from(["caas", "client", "-s", "ws://localhost:8838"]).unwrap();
        let Commands::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert!(args.into_parts().is_err());
    }

    #[test]
    fn client_script_path_wins_over_script() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "echo from-file").unwrap();
        let cli = Cli::try_parse_from([
            "caas",
            "client",
            "-s",
            "ws://localhost:8838",
            "--script",
            "echo inline",
            "--script-path",
            tmp.path().to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        let (_, request) = args.into_parts().unwrap();
        assert_eq!(request.script, "echo from-file");
    }
}
