//! OpenSSH-like option grammar of the SSH executor.
//!
//! `[flags] [user@]host[:port] [command]`

use std::{fmt, path::PathBuf, time::Duration};

use clap::Parser;

use super::SshError;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_SERVER_ALIVE_INTERVAL: u64 = 15;
const DEFAULT_SERVER_ALIVE_COUNT_MAX: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT: u64 = 20;

/// Identity files tried when none is given, in OpenSSH order.
pub const DEFAULT_IDENTITY_FILES: &[&str] = &[
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "id_xmss",
];

#[derive(Debug, Parser)]
#[command(
    name = "ssh",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct SshArgs {
    /// Port to connect to on the remote host.
    #[arg(short = 'p', value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,
    /// Identity (private key) file.
    #[arg(short = 'i')]
    identity_files: Vec<String>,
    /// Disable pseudo-terminal allocation.
    #[arg(short = 'T')]
    no_pty: bool,
    #[arg(short = 'L')]
    local_forwards: Vec<String>,
    #[arg(short = 'R')]
    remote_forwards: Vec<String>,
    #[arg(short = 'D')]
    dynamic_forwards: Vec<String>,
    #[arg(short = 'o')]
    options: Vec<String>,
    /// Accept hosts missing from known_hosts.
    #[arg(long = "ts-insecure")]
    insecure: bool,
    destination: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    fn new(host: &str, port: &str) -> Result<Self, SshError> {
        Ok(Self {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `-L`: listen locally, connect through the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    pub listen: Endpoint,
    pub target: Endpoint,
}

/// `-R`: the server listens, connections come back through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteForward {
    /// Reverse dynamic forward: a SOCKS proxy served from this side.
    Socks { bind: Endpoint },
    /// Connect to a fixed target from this side.
    Tcp { bind: Endpoint, target: Endpoint },
}

impl RemoteForward {
    #[must_use]
    pub const fn bind(&self) -> &Endpoint {
        match self {
            Self::Socks { bind } | Self::Tcp { bind, .. } => bind,
        }
    }
}

/// `-D`: a local SOCKS proxy connecting through the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicForward {
    pub listen: Endpoint,
}

/// Parsed SSH executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Runs instead of an interactive shell.
    pub command: Option<String>,
    pub identity_files: Vec<PathBuf>,
    pub no_pty: bool,
    pub local_forwards: Vec<LocalForward>,
    pub remote_forwards: Vec<RemoteForward>,
    pub dynamic_forwards: Vec<DynamicForward>,
    /// Seconds between keepalives; 0 disables them.
    pub server_alive_interval: u64,
    pub server_alive_count_max: u32,
    pub connect_timeout: Duration,
    pub insecure: bool,
}

impl SshOptions {
    /// Parse an executor config string plus `extra` options.
    ///
    /// # Errors
    /// Returns error on malformed flags, destination, forwards or `-o`
    /// options.
    pub fn parse(config: &str, extra: &str) -> Result<Self, SshError> {
        let joined = [config.trim(), extra.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let tokens = shlex::split(&joined)
            .ok_or_else(|| SshError::Config(format!("failed to parse config as tokens: {joined}")))?;
        let args =
            SshArgs::try_parse_from(tokens).map_err(|e| SshError::Config(e.render().to_string()))?;

        let (user, host_port) = match args.destination.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (default_user(), args.destination.as_str()),
        };
        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (host.to_string(), parse_port(port)?),
            None => (host_port.to_string(), args.port.unwrap_or(DEFAULT_PORT)),
        };
        if user.is_empty() || host.is_empty() {
            return Err(SshError::Config(format!(
                "username ('{user}') or host ('{host}') is empty"
            )));
        }

        let mut options = Self {
            user,
            host,
            port,
            command: (!args.command.is_empty()).then(|| args.command.join(" ")),
            identity_files: identity_files(&args.identity_files),
            no_pty: args.no_pty,
            local_forwards: args
                .local_forwards
                .iter()
                .map(|s| parse_local_forward(s))
                .collect::<Result<_, _>>()?,
            remote_forwards: args
                .remote_forwards
                .iter()
                .map(|s| parse_remote_forward(s))
                .collect::<Result<_, _>>()?,
            dynamic_forwards: args
                .dynamic_forwards
                .iter()
                .map(|s| parse_dynamic_forward(s))
                .collect::<Result<_, _>>()?,
            server_alive_interval: DEFAULT_SERVER_ALIVE_INTERVAL,
            server_alive_count_max: DEFAULT_SERVER_ALIVE_COUNT_MAX,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT),
            insecure: args.insecure,
        };
        for option in &args.options {
            options.apply_option(option)?;
        }
        Ok(options)
    }

    fn apply_option(&mut self, option: &str) -> Result<(), SshError> {
        let invalid = || SshError::Config(format!("invalid -o option '{option}'"));
        let (key, value) = option.split_once('=').ok_or_else(invalid)?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(invalid());
        }
        match key {
            "ServerAliveInterval" => self.server_alive_interval = value.parse().map_err(|_| invalid())?,
            "ServerAliveCountMax" => self.server_alive_count_max = value.parse().map_err(|_| invalid())?,
            "ConnectTimeout" => {
                self.connect_timeout = Duration::from_secs(value.parse().map_err(|_| invalid())?);
            }
            _ => return Err(SshError::Config(format!("unsupported ssh option '{key}'"))),
        }
        Ok(())
    }
}

/// The account name of the process owner. Falls back to the environment,
/// then to `root`.
#[must_use]
pub fn default_user() -> String {
    #[cfg(unix)]
    match nix::unistd::User::from_uid(nix::unistd::Uid::current()) {
        Ok(Some(user)) => return user.name,
        Ok(None) => tracing::debug!("No passwd entry for the current uid"),
        Err(e) => tracing::debug!(?e, "Failed to look up the current user"),
    }
    ["USER", "USERNAME"]
        .into_iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "root".to_string())
}

fn identity_files(configured: &[String]) -> Vec<PathBuf> {
    let home = dirs::home_dir();
    if configured.is_empty() {
        return home
            .map(|home| {
                DEFAULT_IDENTITY_FILES
                    .iter()
                    .map(|name| home.join(".ssh").join(name))
                    .collect()
            })
            .unwrap_or_default();
    }
    configured
        .iter()
        .map(|path| match (path.strip_prefix("~/"), &home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path),
        })
        .collect()
}

fn parse_port(port: &str) -> Result<u16, SshError> {
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(SshError::Config(format!("invalid port '{port}'"))),
    }
}

fn parse_local_forward(spec: &str) -> Result<LocalForward, SshError> {
    let fields: Vec<&str> = spec.split(':').collect();
    let (listen, target) = match fields.as_slice() {
        [listen, target] => (
            Endpoint::new("127.0.0.1", listen)?,
            Endpoint::new("localhost", target)?,
        ),
        [port, host, hostport] => (
            Endpoint::new("127.0.0.1", port)?,
            Endpoint::new(host, hostport)?,
        ),
        [bind, port, host, hostport] => (Endpoint::new(bind, port)?, Endpoint::new(host, hostport)?),
        _ => return Err(SshError::Config(format!("invalid local forward '{spec}'"))),
    };
    Ok(LocalForward { listen, target })
}

fn parse_remote_forward(spec: &str) -> Result<RemoteForward, SshError> {
    let fields: Vec<&str> = spec.split(':').collect();
    match fields.as_slice() {
        [port] => Ok(RemoteForward::Socks {
            bind: Endpoint::new("0.0.0.0", port)?,
        }),
        [bind, port] => Ok(RemoteForward::Socks {
            bind: Endpoint::new(bind, port)?,
        }),
        [port, host, hostport] => Ok(RemoteForward::Tcp {
            bind: Endpoint::new("localhost", port)?,
            target: Endpoint::new(host, hostport)?,
        }),
        [bind, port, host, hostport] => Ok(RemoteForward::Tcp {
            bind: Endpoint::new(bind, port)?,
            target: Endpoint::new(host, hostport)?,
        }),
        _ => Err(SshError::Config(format!("invalid remote forward '{spec}'"))),
    }
}

fn parse_dynamic_forward(spec: &str) -> Result<DynamicForward, SshError> {
    let fields: Vec<&str> = spec.split(':').collect();
    let listen = match fields.as_slice() {
        [port] => Endpoint::new("0.0.0.0", port)?,
        [bind, port] => Endpoint::new(bind, port)?,
        _ => return Err(SshError::Config(format!("invalid dynamic forward '{spec}'"))),
    };
    Ok(DynamicForward { listen })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn endpoint(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn test_destination_with_user_and_port() {
        let options = SshOptions::parse("bob@host:2222", "").unwrap();
        assert_eq!(options.user, "bob");
        assert_eq!(options.host, "host");
        assert_eq!(options.port, 2222);
        assert_eq!(options.command, None);
    }

    #[test]
    fn test_destination_defaults() {
        let options = SshOptions::parse("host", "").unwrap();
        assert_eq!(options.host, "host");
        assert_eq!(options.port, 22);
        assert_eq!(options.user, default_user());
        assert!(!options.user.is_empty());
        assert_eq!(options.server_alive_interval, 15);
        assert_eq!(options.server_alive_count_max, 5);
        assert_eq!(options.connect_timeout, Duration::from_secs(20));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_user_is_process_owner() {
        let output = std::process::Command::new("id").arg("-un").output().unwrap();
        if !output.status.success() {
            return;
        }
        let owner = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert_eq!(default_user(), owner);
    }

    #[test]
    fn test_destination_port_overrides_flag() {
        assert_eq!(SshOptions::parse("-p 2200 host", "").unwrap().port, 2200);
        assert_eq!(SshOptions::parse("-p 2200 host:2300", "").unwrap().port, 2300);
    }

    #[test]
    fn test_invalid_ports() {
        assert!(SshOptions::parse("host:0", "").is_err());
        assert!(SshOptions::parse("host:65536", "").is_err());
        assert!(SshOptions::parse("-p 0 host", "").is_err());
    }

    #[test]
    fn test_flags_and_command() {
        let options = SshOptions::parse(
            "-T -i ~/keys/a -i /etc/b --ts-insecure example.com uptime -p",
            "",
        )
        .unwrap();
        assert!(options.no_pty);
        assert!(options.insecure);
        assert_eq!(options.command.as_deref(), Some("uptime -p"));
        assert_eq!(options.identity_files.len(), 2);
        assert_eq!(options.identity_files[1], PathBuf::from("/etc/b"));
    }

    #[test]
    fn test_extra_option_appended() {
        let options = SshOptions::parse("-T", "alice@box").unwrap();
        assert_eq!(options.user, "alice");
        assert_eq!(options.host, "box");
    }

    #[test]
    fn test_missing_destination() {
        assert!(SshOptions::parse("-T", "").is_err());
    }

    #[test]
    fn test_ssh_o_options() {
        let options = SshOptions::parse(
            "-o ServerAliveInterval=0 -o ServerAliveCountMax=2 -o ConnectTimeout=3 host",
            "",
        )
        .unwrap();
        assert_eq!(options.server_alive_interval, 0);
        assert_eq!(options.server_alive_count_max, 2);
        assert_eq!(options.connect_timeout, Duration::from_secs(3));

        assert!(SshOptions::parse("-o Compression=yes host", "").is_err());
        assert!(SshOptions::parse("-o ConnectTimeout=soon host", "").is_err());
        assert!(SshOptions::parse("-o ConnectTimeout host", "").is_err());
    }

    #[test]
    fn test_local_forwards() {
        let options = SshOptions::parse(
            "-L 8080:80 -L 9000:db:5432 -L 0.0.0.0:9001:db:5433 host",
            "",
        )
        .unwrap();
        assert_eq!(
            options.local_forwards,
            [
                LocalForward {
                    listen: endpoint("127.0.0.1", 8080),
                    target: endpoint("localhost", 80),
                },
                LocalForward {
                    listen: endpoint("127.0.0.1", 9000),
                    target: endpoint("db", 5432),
                },
                LocalForward {
                    listen: endpoint("0.0.0.0", 9001),
                    target: endpoint("db", 5433),
                },
            ]
        );
        assert!(SshOptions::parse("-L 8080 host", "").is_err());
    }

    #[test]
    fn test_remote_forwards() {
        let options = SshOptions::parse(
            "-R 1080 -R 127.0.0.1:1081 -R 8888:web:80 -R 0.0.0.0:8889:web:81 host",
            "",
        )
        .unwrap();
        assert_eq!(
            options.remote_forwards,
            [
                RemoteForward::Socks {
                    bind: endpoint("0.0.0.0", 1080)
                },
                RemoteForward::Socks {
                    bind: endpoint("127.0.0.1", 1081)
                },
                RemoteForward::Tcp {
                    bind: endpoint("localhost", 8888),
                    target: endpoint("web", 80),
                },
                RemoteForward::Tcp {
                    bind: endpoint("0.0.0.0", 8889),
                    target: endpoint("web", 81),
                },
            ]
        );
    }

    #[test]
    fn test_dynamic_forwards() {
        let options = SshOptions::parse("-D 1080 -D localhost:1081 host", "").unwrap();
        assert_eq!(
            options.dynamic_forwards,
            [
                DynamicForward {
                    listen: endpoint("0.0.0.0", 1080)
                },
                DynamicForward {
                    listen: endpoint("localhost", 1081)
                },
            ]
        );
        assert!(SshOptions::parse("-D a:1:b host", "").is_err());
    }
}
