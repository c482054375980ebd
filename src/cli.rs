use clap::Parser;

use crate::config::SuccessRule;
use crate::task::{DEFAULT_DOH_URL, DEFAULT_PORT, DEFAULT_TEST_URL};

/// HTTP/3 connectivity prober
#[derive(Parser, Debug)]
#[command(name = "h3-probe")]
#[command(about = "Resolve hosts over DoH and probe each address over HTTP/3, falling back to HTTP/2")]
pub struct Cli {
	/// JSON task file (array of task objects)
	#[arg(short = 'c', long = "config")]
	pub config: Option<String>,

	/// Single domain to resolve and probe
	#[arg(short = 'd', long = "domain")]
	pub domain: Option<String>,

	/// Host list file (`[{"host": ...}]`, as written by --extract-hosts)
	#[arg(long = "hosts")]
	pub hosts: Option<String>,

	/// DoH endpoint URL
	#[arg(long = "doh-url", default_value = DEFAULT_DOH_URL)]
	pub doh_url: String,

	/// Address of the DoH endpoint itself, skipping its name lookup (repeatable)
	#[arg(long = "doh-ip")]
	pub doh_ips: Vec<String>,

	/// Resolution mode for --domain: https, a_aaaa or direct
	#[arg(short = 'm', long = "resolve-mode", default_value = "https")]
	pub resolve_mode: String,

	/// Address to probe with --resolve-mode direct (repeatable)
	#[arg(long = "direct-ip")]
	pub direct_ips: Vec<String>,

	/// URL whose host is used as SNI and Host header for --domain
	#[arg(long = "test-url", default_value = DEFAULT_TEST_URL)]
	pub test_url: String,

	/// SNI and Host header for --hosts entries (defaults to each host)
	#[arg(long = "sni")]
	pub sni: Option<String>,

	/// Target port
	#[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
	pub port: u16,

	/// Only probe IPv6 addresses of --domain
	#[arg(long = "prefer-ipv6", conflicts_with = "prefer_ipv4")]
	pub prefer_ipv6: bool,

	/// Only probe IPv4 addresses of --domain
	#[arg(long = "prefer-ipv4")]
	pub prefer_ipv4: bool,

	/// Maximum concurrent probes
	#[arg(short = 'j', long = "concurrency", default_value = "10")]
	pub concurrency: usize,

	/// Per-attempt timeout in seconds
	#[arg(short = 't', long = "timeout", default_value = "10")]
	pub timeout: u64,

	/// Success rule for HTTP/3 responses: below-500 or 2xx
	#[arg(long = "h3-success", default_value = "below-500")]
	pub h3_success: SuccessRule,

	/// Success rule for HTTP/2 responses: below-500 or 2xx
	#[arg(long = "h2-success", default_value = "below-500")]
	pub h2_success: SuccessRule,

	/// Address to drop from every resolution (repeatable, replaces the default)
	#[arg(long = "deny")]
	pub deny: Vec<String>,

	/// User-Agent sent with every probe
	#[arg(long = "user-agent", default_value = crate::config::DEFAULT_USER_AGENT)]
	pub user_agent: String,

	/// Accept invalid certificates
	#[arg(long = "insecure")]
	pub insecure: bool,

	/// Extract `@host:` tokens from a text file into a host list and exit
	#[arg(long = "extract-hosts")]
	pub extract_hosts: Option<String>,

	/// Write JSON output to this file instead of stdout
	#[arg(short = 'o', long = "output")]
	pub output: Option<String>,

	/// Verbose logging
	#[arg(short = 'v', long = "verbose")]
	pub verbose: bool,
}
