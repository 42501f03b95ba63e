//! Machine connection coordinates

use secrecy::{ExposeSecret, SecretString};

pub type MachineId = i64;

/// How the orchestrator authenticates against a machine
pub enum MachineAuth {
    /// Rely on the local SSH agent / default identity
    Agent,
    Password(SecretString),
    PrivateKey(SecretString),
}

impl Clone for MachineAuth {
    fn clone(&self) -> Self {
        match self {
            MachineAuth::Agent => MachineAuth::Agent,
            MachineAuth::Password(p) => {
                MachineAuth::Password(SecretString::from(p.expose_secret().to_string()))
            }
            MachineAuth::PrivateKey(k) => {
                MachineAuth::PrivateKey(SecretString::from(k.expose_secret().to_string()))
            }
        }
    }
}

impl std::fmt::Debug for MachineAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineAuth::Agent => write!(f, "Agent"),
            MachineAuth::Password(_) => write!(f, "Password([REDACTED])"),
            MachineAuth::PrivateKey(_) => write!(f, "PrivateKey([REDACTED])"),
        }
    }
}

/// A target host. Owned outside the orchestrator; looked up by id for the
/// duration of one operation.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: MachineAuth,
}

impl Machine {
    pub fn new(id: MachineId, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port: 22,
            username: "root".to_string(),
            auth: MachineAuth::Agent,
        }
    }

    pub fn with_user(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: MachineAuth) -> Self {
        self.auth = auth;
        self
    }

    /// `user@host` destination for ssh/scp
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// `host:port`, used in connection errors
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Home directory of the login user on the target
    pub fn home_dir(&self) -> String {
        if self.username == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.username)
        }
    }
}
