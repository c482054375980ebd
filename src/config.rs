use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

pub const DEFAULT_USER_AGENT: &str = "curl/8.12.1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Addresses that DoH answers are known to carry but never serve the target
pub const DEFAULT_DENYLIST: &[&str] = &["183.192.65.101"];

/// How a received status code is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessRule {
	/// Any status below 500 counts as reachable
	Below500,
	/// Only 200..=299
	Only2xx,
}

impl SuccessRule {
	pub fn is_success(&self, status: u16) -> bool {
		match self {
			SuccessRule::Below500 => status < 500,
			SuccessRule::Only2xx => (200..300).contains(&status),
		}
	}
}

impl FromStr for SuccessRule {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"below-500" | "lt500" | "<500" => Ok(SuccessRule::Below500),
			"2xx" | "only-2xx" => Ok(SuccessRule::Only2xx),
			other => Err(anyhow!("unknown success rule '{}' (expected below-500 or 2xx)", other)),
		}
	}
}

impl fmt::Display for SuccessRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SuccessRule::Below500 => f.write_str("below-500"),
			SuccessRule::Only2xx => f.write_str("2xx"),
		}
	}
}

/// Probe configuration, fixed for the lifetime of a run
#[derive(Debug, Clone)]
pub struct ProbeConfig {
	/// Deadline applied to each protocol attempt and each DoH query
	pub timeout: Duration,
	pub max_inflight: usize,
	pub user_agent: String,
	pub h3_success: SuccessRule,
	pub h2_success: SuccessRule,
	pub denylist: Vec<IpAddr>,
	/// Skip certificate verification on both probe legs
	pub insecure: bool,
}

impl Default for ProbeConfig {
	fn default() -> Self {
		Self {
			timeout: DEFAULT_TIMEOUT,
			max_inflight: DEFAULT_CONCURRENCY,
			user_agent: DEFAULT_USER_AGENT.to_string(),
			h3_success: SuccessRule::Below500,
			h2_success: SuccessRule::Below500,
			denylist: default_denylist(),
			insecure: false,
		}
	}
}

pub fn default_denylist() -> Vec<IpAddr> {
	DEFAULT_DENYLIST.iter()
		.filter_map(|s| s.parse().ok())
		.collect()
}

/// Parse denylist entries given on the command line.
pub fn parse_denylist(entries: &[String]) -> Result<Vec<IpAddr>> {
	entries.iter()
		.map(|e| {
			e.trim().parse::<IpAddr>()
				.map_err(|err| anyhow!("invalid denylist address '{}': {}", e, err))
		})
		.collect()
}
