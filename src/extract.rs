use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;

use crate::task::HostEntry;

fn host_pattern() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(r"@([^:]+):").expect("static host pattern"))
}

/// Host of the first `@host:` token in a line, if there is one.
pub fn extract_host(line: &str) -> Option<&str> {
	host_pattern()
		.captures(line)
		.and_then(|caps| caps.get(1))
		.map(|m| m.as_str())
}

/// Extract one host per line from a share-link style list.
///
/// Blank lines and lines without an `@host:` token are skipped.
pub fn extract_hosts(content: &str) -> Vec<HostEntry> {
	content.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty())
		.filter_map(extract_host)
		.map(|host| HostEntry { host: host.to_string() })
		.collect()
}

pub fn read_and_extract(path: &str) -> Result<Vec<HostEntry>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read host list '{}': {}", path, e))?;
	Ok(extract_hosts(&content))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_share_link_line() {
		let entries = extract_hosts("vmess://abc@203.0.113.5:443?security=tls#node\n");
		assert_eq!(entries, vec![HostEntry { host: "203.0.113.5".to_string() }]);
		assert_eq!(
			serde_json::to_string(&entries[0]).unwrap(),
			r#"{"host":"203.0.113.5"}"#
		);
	}

	#[test]
	fn test_skips_lines_without_token() {
		let input = "\n# comment\nvless://uuid@edge.example.test:8443?type=ws\nplain text\n\n";
		let entries = extract_hosts(input);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].host, "edge.example.test");
	}

	#[test]
	fn test_first_token_wins() {
		assert_eq!(extract_host("trojan://a@one.test:443#b@two.test:80"), Some("one.test"));
		assert_eq!(extract_host("no token here"), None);
	}
}
