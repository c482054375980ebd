//! HTTP/3 first, HTTP/2 second connectivity probe.
//!
//! A [`Prober`] walks an ordered list of [`AttemptStrategy`] values and
//! stops at the first one that gets any HTTP response back. Each strategy
//! runs at most once per probe, under its own deadline.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::{ProbeConfig, SuccessRule};
use crate::error::{error_chain, AttemptError, Protocol};
use crate::filter::IpVersion;
use crate::h3_transport::PinnedH3Transport;
use crate::task::Task;

/// One address to probe and the names to present to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
	pub domain: String,
	pub sni_host: String,
	pub host_header: String,
	pub ip: IpAddr,
	pub port: u16,
	pub dns_source: String,
}

impl ProbeTarget {
	pub fn from_task(task: &Task, ip: IpAddr, dns_source: &str) -> Self {
		Self {
			domain: task.doh_resolve_domain.clone(),
			sni_host: task.sni_host().to_string(),
			host_header: task.host_header().to_string(),
			ip,
			port: task.port,
			dns_source: dns_source.to_string(),
		}
	}

	/// `https://{sni}:{port}/`, bracketing IPv6 literals
	pub fn url(&self) -> String {
		if self.sni_host.parse::<std::net::Ipv6Addr>().is_ok() {
			format!("https://[{}]:{}/", self.sni_host, self.port)
		} else {
			format!("https://{}:{}/", self.sni_host, self.port)
		}
	}

	pub fn socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.ip, self.port)
	}

	/// URL to dial for a pinned TCP connection.
	///
	/// A literal-IP SNI bypasses any host override, so the target address goes
	/// into the URL itself. IP literals are never sent as SNI.
	pub fn dial_url(&self) -> String {
		if self.sni_host.parse::<IpAddr>().is_ok() {
			format!("https://{}/", self.socket_addr())
		} else {
			self.url()
		}
	}
}

/// What a protocol leg saw when the server answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResponse {
	pub status: u16,
	pub server: Option<String>,
	pub protocol: Protocol,
}

#[async_trait]
pub trait AttemptStrategy: Send + Sync {
	/// Label used in logs and timeout messages
	fn name(&self) -> &'static str;

	/// Protocol recorded when this leg times out
	fn protocol(&self) -> Protocol;

	fn success_rule(&self) -> SuccessRule;

	/// Make one request. Must release every socket it opened before returning.
	async fn attempt(&self, target: &ProbeTarget) -> Result<AttemptResponse, AttemptError>;
}

/// GET over QUIC to the pinned address
pub struct Http3Attempt {
	user_agent: String,
	idle_timeout: Duration,
	insecure: bool,
	success: SuccessRule,
}

impl Http3Attempt {
	pub fn new(config: &ProbeConfig) -> Self {
		Self {
			user_agent: config.user_agent.clone(),
			idle_timeout: config.timeout,
			insecure: config.insecure,
			success: config.h3_success,
		}
	}
}

#[async_trait]
impl AttemptStrategy for Http3Attempt {
	fn name(&self) -> &'static str {
		"HTTP/3"
	}

	fn protocol(&self) -> Protocol {
		Protocol::H3
	}

	fn success_rule(&self) -> SuccessRule {
		self.success
	}

	async fn attempt(&self, target: &ProbeTarget) -> Result<AttemptResponse, AttemptError> {
		let h3_err = |e: anyhow::Error| AttemptError::connect(Protocol::H3, format!("{:#}", e));

		let req = http::Request::get(target.url())
			.header(http::header::HOST, target.host_header.as_str())
			.header(http::header::USER_AGENT, self.user_agent.as_str())
			.body(())
			.map_err(|e| AttemptError::connect(Protocol::None, e))?;

		let mut transport = PinnedH3Transport::new(
			target.ip, target.port, self.idle_timeout, self.insecure,
		).map_err(h3_err)?;

		let result = transport.send(req, None).await.map(|response| AttemptResponse {
			status: response.status(),
			server: response.header("server"),
			protocol: Protocol::H3,
		});
		transport.close();
		result.map_err(h3_err)
	}
}

/// GET over TCP+TLS dialed to the pinned address, offering h2 then http/1.1
pub struct Http2Attempt {
	user_agent: String,
	timeout: Duration,
	insecure: bool,
	success: SuccessRule,
}

impl Http2Attempt {
	pub fn new(config: &ProbeConfig) -> Self {
		Self {
			user_agent: config.user_agent.clone(),
			timeout: config.timeout,
			insecure: config.insecure,
			success: config.h2_success,
		}
	}
}

#[async_trait]
impl AttemptStrategy for Http2Attempt {
	fn name(&self) -> &'static str {
		"HTTP/2"
	}

	fn protocol(&self) -> Protocol {
		Protocol::H2
	}

	fn success_rule(&self) -> SuccessRule {
		self.success
	}

	async fn attempt(&self, target: &ProbeTarget) -> Result<AttemptResponse, AttemptError> {
		// Both deadlines expire before the prober's, so reqwest can report
		// whether the dial or the request stalled.
		let connect_deadline = self.timeout * 8 / 10;
		let request_deadline = self.timeout * 9 / 10;

		// No pooling: the connection dies with the client at the end of this call
		let client = reqwest::Client::builder()
			.resolve(&target.sni_host, target.socket_addr())
			.timeout(request_deadline)
			.connect_timeout(connect_deadline)
			.danger_accept_invalid_certs(self.insecure)
			.pool_max_idle_per_host(0)
			.no_proxy()
			.build()
			.map_err(|e| AttemptError::connect(Protocol::None, error_chain(&e)))?;

		let result = client.get(target.dial_url())
			.header(reqwest::header::HOST, target.host_header.as_str())
			.header(reqwest::header::USER_AGENT, self.user_agent.as_str())
			.send()
			.await;

		match result {
			Ok(response) => {
				let protocol = if response.version() == reqwest::Version::HTTP_2 {
					Protocol::H2
				} else {
					Protocol::Http11
				};
				let server = response.headers()
					.get(reqwest::header::SERVER)
					.and_then(|v| v.to_str().ok())
					.map(|s| s.to_string());
				Ok(AttemptResponse {
					status: response.status().as_u16(),
					server,
					protocol,
				})
			}
			Err(e) => {
				// A failed dial never got far enough to speak any protocol
				let protocol = if e.is_connect() { Protocol::None } else { Protocol::H2 };
				if e.is_timeout() {
					Err(AttemptError::Timeout { leg: self.name(), protocol, after: self.timeout })
				} else {
					Err(AttemptError::connect(protocol, error_chain(&e)))
				}
			}
		}
	}
}

/// Terminal artifact of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
	domain_used: String,
	target_ip: String,
	ip_version: &'static str,
	sni_host: String,
	host_header: String,
	success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	status_code: Option<u16>,
	protocol: &'static str,
	latency_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	server_header: Option<String>,
	#[serde(rename = "error_msg", skip_serializing_if = "Option::is_none")]
	error: Option<String>,
	dns_source: String,
}

impl ProbeResult {
	fn base(target: &ProbeTarget, latency: Duration) -> Self {
		Self {
			domain_used: target.domain.clone(),
			target_ip: target.ip.to_string(),
			ip_version: IpVersion::of(&target.ip).as_str(),
			sni_host: target.sni_host.clone(),
			host_header: target.host_header.clone(),
			success: false,
			status_code: None,
			protocol: Protocol::None.as_str(),
			latency_ms: latency.as_millis() as u64,
			server_header: None,
			error: None,
			dns_source: target.dns_source.clone(),
		}
	}

	pub fn from_response(target: &ProbeTarget, response: AttemptResponse, rule: SuccessRule, latency: Duration) -> Self {
		Self {
			success: rule.is_success(response.status),
			status_code: Some(response.status),
			protocol: response.protocol.as_str(),
			server_header: response.server,
			..Self::base(target, latency)
		}
	}

	pub fn from_failure(target: &ProbeTarget, err: &AttemptError, latency: Duration) -> Self {
		Self {
			protocol: err.protocol().as_str(),
			error: Some(err.to_string()),
			..Self::base(target, latency)
		}
	}

	pub fn domain_used(&self) -> &str {
		&self.domain_used
	}

	pub fn target_ip(&self) -> &str {
		&self.target_ip
	}

	pub fn ip_version(&self) -> &str {
		self.ip_version
	}

	pub fn success(&self) -> bool {
		self.success
	}

	pub fn status_code(&self) -> Option<u16> {
		self.status_code
	}

	pub fn protocol(&self) -> &str {
		self.protocol
	}

	pub fn latency_ms(&self) -> u64 {
		self.latency_ms
	}

	pub fn server_header(&self) -> Option<&str> {
		self.server_header.as_deref()
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	pub fn dns_source(&self) -> &str {
		&self.dns_source
	}
}

/// Runs the attempt chain for one target
pub struct Prober {
	strategies: Vec<Arc<dyn AttemptStrategy>>,
	timeout: Duration,
}

impl Prober {
	/// HTTP/3 then HTTP/2, as configured.
	pub fn new(config: &ProbeConfig) -> Self {
		let strategies: Vec<Arc<dyn AttemptStrategy>> = vec![
			Arc::new(Http3Attempt::new(config)),
			Arc::new(Http2Attempt::new(config)),
		];
		Self::with_strategies(strategies, config.timeout)
	}

	pub fn with_strategies(strategies: Vec<Arc<dyn AttemptStrategy>>, timeout: Duration) -> Self {
		Self { strategies, timeout }
	}

	/// Probe one address. Never fails: errors end up in the result.
	///
	/// Latency covers everything from the first attempt to the terminal one.
	pub async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
		let start = Instant::now();
		let mut last_error = None;

		for strategy in &self.strategies {
			let outcome = tokio::time::timeout(self.timeout, strategy.attempt(target)).await;
			match outcome {
				Ok(Ok(response)) => {
					let latency = start.elapsed();
					debug!(
						ip = %target.ip, leg = strategy.name(), status = response.status,
						latency_ms = latency.as_millis() as u64, "probe answered"
					);
					return ProbeResult::from_response(target, response, strategy.success_rule(), latency);
				}
				Ok(Err(e)) => {
					debug!(ip = %target.ip, leg = strategy.name(), error = %e, "attempt failed");
					last_error = Some(e);
				}
				Err(_) => {
					debug!(ip = %target.ip, leg = strategy.name(), "attempt timed out");
					last_error = Some(AttemptError::Timeout {
						leg: strategy.name(),
						protocol: strategy.protocol(),
						after: self.timeout,
					});
				}
			}
		}

		let err = last_error.unwrap_or_else(|| {
			AttemptError::connect(Protocol::None, "no attempt strategies configured")
		});
		ProbeResult::from_failure(target, &err, start.elapsed())
	}
}
