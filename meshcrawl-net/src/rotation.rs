//! Network identity rotation
//!
//! Switches the apparent egress location when a site starts refusing us.
//! Provider backends drive a VPN command-line client; the manual backend asks
//! the operator to switch by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use meshcrawl_core::{RotationConfig, RotatorKind};

/// Errors from running a provider command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Capability interface for identity rotation backends
#[async_trait]
pub trait IdentityRotator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Connect to a location; false on failure or timeout
    async fn connect(&self, location: &str) -> bool;

    async fn disconnect(&self) -> bool;

    /// Human-readable status, "Unknown" when it cannot be determined
    async fn status(&self) -> String;

    /// Next location in round-robin order, if the backend enumerates locations
    fn next_location(&self) -> Option<String> {
        None
    }
}

/// Thread-safe reference to a rotation backend
pub type SharedRotator = Arc<dyn IdentityRotator>;

/// Round-robin cursor over configured locations
#[derive(Debug)]
pub struct LocationCycle {
    locations: Vec<String>,
    cursor: AtomicUsize,
}

impl LocationCycle {
    pub fn new(locations: Vec<String>) -> Self {
        Self {
            locations,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Option<String> {
        if self.locations.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.locations.len();
        Some(self.locations[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// One external command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Written to the child's stdin, then closed
    pub stdin: Option<String>,
}

/// Run a command, returning its trimmed stdout on a zero exit status
pub async fn run_command(cmd: &CommandSpec) -> Result<String, CommandError> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;

    let input = cmd.stdin.clone();
    let stdin = child.stdin.take();
    let run = async move {
        if let (Some(input), Some(mut stdin)) = (input, stdin) {
            // A child that exits without reading stdin is not an error here
            let _ = stdin.write_all(input.as_bytes()).await;
        }
        child.wait_with_output().await
    };

    let output = tokio::time::timeout(cmd.timeout, run)
        .await
        .map_err(|_| CommandError::Timeout {
            program: cmd.program.clone(),
            timeout: cmd.timeout,
        })?
        .map_err(|source| CommandError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Exit {
            program: cmd.program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Login step run once before the first connect
#[derive(Debug, Clone)]
pub struct LoginCommand {
    /// Arguments; `{email}` is replaced with the account email
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Command-line shape of one VPN provider client
#[derive(Debug, Clone)]
pub struct ProviderCommands {
    pub name: String,
    pub program: String,
    /// Arguments; `{location}` is replaced with the target location
    pub connect_args: Vec<String>,
    pub disconnect_args: Vec<String>,
    pub status_args: Vec<String>,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub status_timeout: Duration,
    /// Pause after a successful connect while the tunnel settles
    pub settle_after_connect: Duration,
    pub login: Option<LoginCommand>,
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl ProviderCommands {
    pub fn nordvpn() -> Self {
        Self {
            name: "NordVPN".to_string(),
            program: "nordvpn".to_string(),
            connect_args: strings(&["connect", "{location}"]),
            disconnect_args: strings(&["disconnect"]),
            status_args: strings(&["status"]),
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            settle_after_connect: Duration::from_secs(3),
            login: None,
        }
    }

    pub fn expressvpn() -> Self {
        Self {
            name: "ExpressVPN".to_string(),
            program: "expressvpn".to_string(),
            ..Self::nordvpn()
        }
    }

    pub fn protonvpn() -> Self {
        Self {
            name: "ProtonVPN".to_string(),
            program: "protonvpn-cli".to_string(),
            connect_args: strings(&["connect", "--cc", "{location}"]),
            connect_timeout: Duration::from_secs(60),
            settle_after_connect: Duration::from_secs(5),
            login: Some(LoginCommand {
                args: strings(&["login", "--username", "{email}"]),
                timeout: Duration::from_secs(30),
            }),
            ..Self::nordvpn()
        }
    }

    fn cmd(&self, args: &[String], timeout: Duration) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: args.to_vec(),
            timeout,
            stdin: None,
        }
    }

    pub fn connect_command(&self, location: &str) -> CommandSpec {
        let args: Vec<String> = self
            .connect_args
            .iter()
            .map(|a| a.replace("{location}", location))
            .collect();
        self.cmd(&args, self.connect_timeout)
    }
}

/// Account used by providers that require a login
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Provider backend driving a VPN command-line client
pub struct CommandRotator {
    commands: ProviderCommands,
    locations: LocationCycle,
    current: Mutex<Option<String>>,
    credentials: Option<Credentials>,
    logged_in: AtomicBool,
}

impl CommandRotator {
    pub fn new(
        commands: ProviderCommands,
        locations: Vec<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            commands,
            locations: LocationCycle::new(locations),
            current: Mutex::new(None),
            credentials,
            logged_in: AtomicBool::new(false),
        }
    }

    pub fn current_location(&self) -> Option<String> {
        self.current.lock().clone()
    }

    async fn ensure_logged_in(&self) -> bool {
        let Some(login) = &self.commands.login else {
            return true;
        };
        if self.logged_in.load(Ordering::Acquire) {
            return true;
        }
        let Some(credentials) = &self.credentials else {
            error!("{} credentials not provided", self.commands.name);
            return false;
        };

        info!("Logging into {}...", self.commands.name);
        let cmd = CommandSpec {
            program: self.commands.program.clone(),
            args: login
                .args
                .iter()
                .map(|a| a.replace("{email}", &credentials.email))
                .collect(),
            timeout: login.timeout,
            stdin: Some(format!("{}\n", credentials.password)),
        };

        match run_command(&cmd).await {
            Ok(_) => {
                self.logged_in.store(true, Ordering::Release);
                info!("Logged into {}", self.commands.name);
                true
            }
            Err(e) => {
                error!("Failed to log into {}: {}", self.commands.name, e);
                false
            }
        }
    }
}

#[async_trait]
impl IdentityRotator for CommandRotator {
    fn name(&self) -> &str {
        &self.commands.name
    }

    async fn connect(&self, location: &str) -> bool {
        if !self.ensure_logged_in().await {
            return false;
        }

        info!("Connecting to {} location: {}", self.commands.name, location);
        match run_command(&self.commands.connect_command(location)).await {
            Ok(_) => {
                *self.current.lock() = Some(location.to_string());
                info!("Connected to {}", location);
                tokio::time::sleep(self.commands.settle_after_connect).await;
                true
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", location, e);
                false
            }
        }
    }

    async fn disconnect(&self) -> bool {
        info!("Disconnecting from {}", self.commands.name);
        let cmd = self
            .commands
            .cmd(&self.commands.disconnect_args, self.commands.disconnect_timeout);
        match run_command(&cmd).await {
            Ok(_) => {
                *self.current.lock() = None;
                true
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                false
            }
        }
    }

    async fn status(&self) -> String {
        let cmd = self
            .commands
            .cmd(&self.commands.status_args, self.commands.status_timeout);
        match run_command(&cmd).await {
            Ok(stdout) => stdout,
            Err(e) => {
                warn!("Could not read {} status: {}", self.commands.name, e);
                "Unknown".to_string()
            }
        }
    }

    fn next_location(&self) -> Option<String> {
        self.locations.next()
    }
}

/// Operator-driven backend for VPNs without a command-line client
pub struct ManualRotator {
    locations: LocationCycle,
    current: Mutex<Option<String>>,
    wait: Duration,
}

impl ManualRotator {
    pub fn new(locations: Vec<String>, wait: Duration) -> Self {
        Self {
            locations: LocationCycle::new(locations),
            current: Mutex::new(None),
            wait,
        }
    }
}

#[async_trait]
impl IdentityRotator for ManualRotator {
    fn name(&self) -> &str {
        "Manual VPN"
    }

    async fn connect(&self, location: &str) -> bool {
        warn!("MANUAL VPN SWITCH REQUIRED: please connect to {}", location);
        info!("Waiting {:?} for manual connection...", self.wait);
        tokio::time::sleep(self.wait).await;
        *self.current.lock() = Some(location.to_string());
        true
    }

    async fn disconnect(&self) -> bool {
        warn!("MANUAL VPN DISCONNECT REQUIRED");
        *self.current.lock() = None;
        true
    }

    async fn status(&self) -> String {
        match self.current.lock().as_deref() {
            Some(location) => format!("Manual VPN - Current: {}", location),
            None => "Manual VPN - Current: None".to_string(),
        }
    }

    fn next_location(&self) -> Option<String> {
        self.locations.next()
    }
}

/// Build the configured rotation backend
pub fn create_rotator(config: &RotationConfig) -> SharedRotator {
    let locations = config.effective_locations();

    match config.kind {
        RotatorKind::Manual => Arc::new(ManualRotator::new(locations, config.manual_wait())),
        RotatorKind::NordVpn => Arc::new(CommandRotator::new(
            ProviderCommands::nordvpn(),
            locations,
            None,
        )),
        RotatorKind::ExpressVpn => Arc::new(CommandRotator::new(
            ProviderCommands::expressvpn(),
            locations,
            None,
        )),
        RotatorKind::ProtonVpn => match (&config.email, &config.password) {
            (Some(email), Some(password)) => Arc::new(CommandRotator::new(
                ProviderCommands::protonvpn(),
                locations,
                Some(Credentials {
                    email: email.clone(),
                    password: password.clone(),
                }),
            )),
            _ => {
                warn!("ProtonVPN credentials not provided, falling back to manual VPN");
                Arc::new(ManualRotator::new(locations, config.manual_wait()))
            }
        },
    }
}
