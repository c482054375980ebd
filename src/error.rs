use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Protocol recorded for a probe leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	H3,
	H2,
	Http11,
	None,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::H3 => "h3",
			Protocol::H2 => "h2",
			Protocol::Http11 => "http/1.1",
			Protocol::None => "none",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Why a task produced no candidate addresses
#[derive(Debug, Error)]
pub enum ResolveError {
	/// Both the A and the AAAA query failed
	#[error("DoH lookup of {domain} via {endpoint} failed")]
	Doh {
		domain: String,
		endpoint: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("system DNS lookup of {domain} failed: {message}")]
	System { domain: String, message: String },

	#[error("unsupported resolve mode '{0}' (expected https, a_aaaa or direct)")]
	UnsupportedMode(String),

	/// Resolution worked but nothing survived the address filter
	#[error("no usable addresses for {0}")]
	Empty(String),
}

/// Failure of one protocol leg of a probe
#[derive(Debug, Error)]
pub enum AttemptError {
	/// `protocol` is what gets recorded on the result if this leg is terminal
	#[error("{message}")]
	Connect { protocol: Protocol, message: String },

	#[error("{leg} attempt timed out after {}s", .after.as_secs_f64())]
	Timeout {
		leg: &'static str,
		protocol: Protocol,
		after: Duration,
	},
}

impl AttemptError {
	pub fn connect(protocol: Protocol, err: impl fmt::Display) -> Self {
		AttemptError::Connect { protocol, message: err.to_string() }
	}

	pub fn protocol(&self) -> Protocol {
		match self {
			AttemptError::Connect { protocol, .. } => *protocol,
			AttemptError::Timeout { protocol, .. } => *protocol,
		}
	}
}

/// Render an error with its whole source chain
pub fn error_chain(err: &dyn StdError) -> String {
	let mut message = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		let text = cause.to_string();
		if !message.contains(&text) {
			message.push_str(": ");
			message.push_str(&text);
		}
		source = cause.source();
	}
	message
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_timeout_message_is_distinguishable() {
		let err = AttemptError::Timeout {
			leg: "HTTP/3",
			protocol: Protocol::H3,
			after: Duration::from_secs(10),
		};
		assert!(matches!(err, AttemptError::Timeout { .. }));
		assert_eq!(err.to_string(), "HTTP/3 attempt timed out after 10s");
	}

	#[test]
	fn test_connect_keeps_protocol() {
		let err = AttemptError::connect(Protocol::None, "connection refused");
		assert_eq!(err.protocol(), Protocol::None);
		assert_eq!(err.to_string(), "connection refused");
		assert!(matches!(err, AttemptError::Connect { .. }));
	}

	#[test]
	fn test_protocol_labels() {
		assert_eq!(Protocol::H3.to_string(), "h3");
		assert_eq!(Protocol::Http11.to_string(), "http/1.1");
		assert_eq!(Protocol::None.to_string(), "none");
	}

	#[test]
	fn test_doh_error_chain_names_cause_once() {
		let err = ResolveError::Doh {
			domain: "example.com".to_string(),
			endpoint: "https://doh.test/dns-query".to_string(),
			source: anyhow::anyhow!("AAAA query timed out after 1s"),
		};
		assert_eq!(err.to_string(), "DoH lookup of example.com via https://doh.test/dns-query failed");
		let chain = error_chain(&err);
		assert_eq!(chain.matches("timed out").count(), 1);
		assert!(chain.ends_with(": AAAA query timed out after 1s"));
	}
}
