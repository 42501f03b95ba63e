//! Utility functions

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::remote::tools::{LocalTool, ToolValidator};

/// Version information for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Short random suffix for generated remote names
pub fn short_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}

/// Check the local tools the SSH channel shells out to and print a report
pub async fn run_diagnostic() {
    let version = version_info();
    println!("{}", "logfleet diagnostic".bold());
    println!("  version:    {}", version.version);
    println!("  git hash:   {}", version.git_hash);
    println!("  build time: {}", version.build_time);
    println!();

    let validator = ToolValidator::new();
    let mut missing = 0;
    for tool in LocalTool::ALL {
        match validator.require(tool) {
            Ok(path) => {
                println!("  {} {:<8} {}", "ok".green(), tool.binary(), path.display());
            }
            Err(e) => {
                missing += 1;
                println!("  {} {:<8} {}", "missing".red(), tool.binary(), e);
            }
        }
    }

    println!();
    if missing == 0 {
        println!("{}", "All required local tools are installed".green());
    } else {
        println!(
            "{}",
            format!("{} required tool(s) missing; remote operations will fail", missing).yellow()
        );
    }
}
