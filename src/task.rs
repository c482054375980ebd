use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

pub const DEFAULT_DOH_URL: &str = "https://xget.a1u06h9fe9y5bozbmgz3.qzz.io/cloudflare-dns.com/dns-query";
pub const DEFAULT_TEST_URL: &str = "https://hello-world-deno-deploy.a1u06h9fe9y5bozbmgz3.qzz.io";
pub const DEFAULT_PORT: u16 = 443;

/// How a task turns its domain into addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
	Doh,
	Traditional,
	Direct,
}

impl FromStr for ResolveMode {
	type Err = ResolveError;

	fn from_str(s: &str) -> Result<Self, ResolveError> {
		match s.trim().to_ascii_lowercase().as_str() {
			"https" | "doh" => Ok(ResolveMode::Doh),
			"a_aaaa" | "traditional" | "system" => Ok(ResolveMode::Traditional),
			"direct" => Ok(ResolveMode::Direct),
			_ => Err(ResolveError::UnsupportedMode(s.to_string())),
		}
	}
}

/// Which address family a task probes
///
/// Serialized as the nullable `prefer_ipv6` flag: null probes both,
/// true only IPv6, false only IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum IpPreference {
	#[default]
	Any,
	V4Only,
	V6Only,
}

impl IpPreference {
	pub fn allows(&self, ip: &IpAddr) -> bool {
		match self {
			IpPreference::Any => true,
			IpPreference::V4Only => ip.is_ipv4(),
			IpPreference::V6Only => ip.is_ipv6(),
		}
	}
}

impl From<Option<bool>> for IpPreference {
	fn from(prefer_ipv6: Option<bool>) -> Self {
		match prefer_ipv6 {
			None => IpPreference::Any,
			Some(true) => IpPreference::V6Only,
			Some(false) => IpPreference::V4Only,
		}
	}
}

impl From<IpPreference> for Option<bool> {
	fn from(pref: IpPreference) -> Self {
		match pref {
			IpPreference::Any => None,
			IpPreference::V6Only => Some(true),
			IpPreference::V4Only => Some(false),
		}
	}
}

fn default_doh_url() -> String {
	DEFAULT_DOH_URL.to_string()
}

fn default_port() -> u16 {
	DEFAULT_PORT
}

fn default_resolve_mode() -> String {
	"https".to_string()
}

/// One probing job as read from a task file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
	pub doh_resolve_domain: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub test_sni_host: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub test_host_header: Option<String>,
	#[serde(default = "default_doh_url")]
	pub doh_url: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default, rename = "prefer_ipv6")]
	pub ip_preference: IpPreference,
	/// Kept as written so a bad mode fails only this task
	#[serde(default = "default_resolve_mode")]
	pub resolve_mode: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub direct_ips: Vec<String>,
}

impl Task {
	/// A DoH task for `domain` with SNI and Host header equal to the domain.
	pub fn doh(domain: &str, doh_url: &str) -> Self {
		Self {
			doh_resolve_domain: domain.to_string(),
			test_sni_host: None,
			test_host_header: None,
			doh_url: doh_url.to_string(),
			port: DEFAULT_PORT,
			ip_preference: IpPreference::Any,
			resolve_mode: "https".to_string(),
			direct_ips: Vec::new(),
		}
	}

	/// A task that probes the given literal addresses without resolving.
	pub fn direct(domain: &str, ips: &[&str]) -> Self {
		Self {
			resolve_mode: "direct".to_string(),
			direct_ips: ips.iter().map(|s| s.to_string()).collect(),
			..Self::doh(domain, DEFAULT_DOH_URL)
		}
	}

	pub fn mode(&self) -> Result<ResolveMode, ResolveError> {
		self.resolve_mode.parse()
	}

	/// TLS server name; falls back to the resolved domain.
	pub fn sni_host(&self) -> &str {
		self.test_sni_host.as_deref()
			.filter(|s| !s.is_empty())
			.unwrap_or(&self.doh_resolve_domain)
	}

	/// HTTP Host header; falls back to the resolved domain.
	pub fn host_header(&self) -> &str {
		self.test_host_header.as_deref()
			.filter(|s| !s.is_empty())
			.unwrap_or(&self.doh_resolve_domain)
	}
}

/// Read a JSON array of tasks.
pub fn read_task_file(path: &str) -> Result<Vec<Task>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read task file '{}': {}", path, e))?;
	parse_tasks(&content)
		.with_context(|| format!("failed to parse task file '{}'", path))
}

pub fn parse_tasks(json: &str) -> Result<Vec<Task>> {
	let tasks: Vec<Task> = serde_json::from_str(json)?;
	Ok(tasks)
}

/// Entry of a host list produced by `--extract-hosts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
	pub host: String,
}

/// Read a `[{"host": ...}]` list and turn every host into a task.
///
/// IP literals become direct tasks; names are resolved over DoH. `sni`
/// overrides the SNI and Host header of every task when set.
pub fn read_hosts_file(path: &str, sni: Option<&str>, doh_url: &str, port: u16) -> Result<Vec<Task>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read hosts file '{}': {}", path, e))?;
	let entries: Vec<HostEntry> = serde_json::from_str(&content)
		.with_context(|| format!("failed to parse hosts file '{}'", path))?;
	Ok(tasks_from_hosts(&entries, sni, doh_url, port))
}

pub fn tasks_from_hosts(entries: &[HostEntry], sni: Option<&str>, doh_url: &str, port: u16) -> Vec<Task> {
	entries.iter()
		.map(|entry| {
			let host = entry.host.trim();
			let mut task = if host.parse::<IpAddr>().is_ok() {
				Task::direct(host, &[host])
			} else {
				Task::doh(host, doh_url)
			};
			task.doh_url = doh_url.to_string();
			task.port = port;
			if let Some(sni) = sni.filter(|s| !s.is_empty()) {
				task.test_sni_host = Some(sni.to_string());
				task.test_host_header = Some(sni.to_string());
			}
			task
		})
		.collect()
}

/// Host part of a URL, or the input itself when it does not parse.
pub fn host_from_url(raw: &str) -> String {
	reqwest::Url::parse(raw)
		.ok()
		.and_then(|url| url.host_str().map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string()))
		.filter(|h| !h.is_empty())
		.unwrap_or_else(|| raw.to_string())
}

/// Return the built-in task set used when nothing else is given.
pub fn default_tasks() -> Vec<Task> {
	let deno = "hello-world-deno-deploy.a1u06h9fe9y5bozbmgz3.qzz.io";
	let aria2 = "local-aria2-webui.masx200.ddns-ip.net";

	let mut first = Task::doh(deno, DEFAULT_DOH_URL);
	first.ip_preference = IpPreference::V6Only;

	let mut second = Task::doh(aria2, DEFAULT_DOH_URL);
	second.ip_preference = IpPreference::V6Only;

	let mut third = Task::direct(aria2, &[
		"162.159.140.220",
		"172.67.214.232",
		"2606:4700:7::da",
		"2a06:98c1:58::da",
	]);
	third.ip_preference = IpPreference::V6Only;

	vec![first, second, third]
}
