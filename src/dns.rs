use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::debug;

use crate::h3_transport::PinnedH3Transport;

const DNS_MESSAGE: &str = "application/dns-message";
/// Upper bound on a DoH response body; DNS messages top out at 64 KiB
const MAX_DOH_BODY: usize = 65_535;

/// Address record type asked for in one DoH sub-query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
	A,
	AAAA,
}

impl QueryType {
	fn record_type(self) -> RecordType {
		match self {
			QueryType::A => RecordType::A,
			QueryType::AAAA => RecordType::AAAA,
		}
	}
}

/// Build a recursive DNS question for the given domain and query type.
pub fn build_query(domain: &str, query_type: QueryType, txid: u16) -> Result<Message> {
	let mut name = Name::from_ascii(domain)
		.map_err(|e| anyhow!("invalid domain name '{}': {}", domain, e))?;
	name.set_fqdn(true);

	let mut message = Message::new();
	message.set_id(txid);
	message.set_message_type(MessageType::Query);
	message.set_recursion_desired(true);
	message.add_query(Query::query(name, query_type.record_type()));
	Ok(message)
}

/// Validate a DoH answer against the question it responds to.
pub fn check_response(response: &Message, query: &Message) -> Result<()> {
	if response.id() != query.id() {
		return Err(anyhow!(
			"txid mismatch: expected {}, got {}",
			query.id(), response.id()
		));
	}
	if response.message_type() != MessageType::Response {
		return Err(anyhow!("received a query instead of a response"));
	}
	let rcode = response.response_code();
	if rcode != ResponseCode::NoError && rcode != ResponseCode::NXDomain {
		return Err(anyhow!("DNS server answered {}", rcode));
	}
	Ok(())
}

/// Pull A and AAAA answers out of a response, in answer order.
///
/// CNAME and every other record type are ignored.
pub fn extract_addresses(response: &Message) -> Vec<String> {
	response.answers().iter()
		.filter_map(|record| match record.data() {
			RData::A(a) => Some(a.0.to_string()),
			RData::AAAA(aaaa) => Some(aaaa.0.to_string()),
			_ => None,
		})
		.collect()
}

/// Sends one DNS question to a DoH endpoint.
///
/// `pinned` optionally fixes the addresses used to reach the endpoint itself.
/// Implementations enforce their own deadlines; callers do not wrap `send`
/// in a timeout of their own.
#[async_trait]
pub trait DohClient: Send + Sync {
	async fn send(&self, query: &Message, endpoint: &str, pinned: &[IpAddr]) -> Result<Message>;
}

/// RFC 8484 POST client: HTTP/3 first, reqwest (HTTP/2) if that fails
pub struct HttpDohClient {
	timeout: Duration,
	insecure: bool,
	user_agent: String,
}

impl HttpDohClient {
	pub fn new(timeout: Duration, insecure: bool, user_agent: &str) -> Self {
		Self { timeout, insecure, user_agent: user_agent.to_string() }
	}

	async fn endpoint_addrs(&self, url: &reqwest::Url, pinned: &[IpAddr]) -> Result<Vec<SocketAddr>> {
		let host = url.host_str()
			.ok_or_else(|| anyhow!("DoH URL {} has no host", url))?;
		let port = url.port_or_known_default().unwrap_or(443);
		if !pinned.is_empty() {
			return Ok(pinned.iter().map(|ip| SocketAddr::new(*ip, port)).collect());
		}
		if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
			return Ok(vec![SocketAddr::new(ip, port)]);
		}
		let addrs: Vec<SocketAddr> = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, port)))
			.await
			.map_err(|_| anyhow!("resolving DoH host {} timed out", host))?
			.with_context(|| format!("failed to resolve DoH host {}", host))?
			.collect();
		if addrs.is_empty() {
			return Err(anyhow!("DoH host {} has no addresses", host));
		}
		Ok(addrs)
	}

	async fn post_h3(&self, url: &reqwest::Url, addrs: &[SocketAddr], packet: Bytes) -> Result<Bytes> {
		let port = addrs.first().map(|a| a.port()).unwrap_or(443);
		let candidates: Vec<IpAddr> = addrs.iter().map(|a| a.ip()).collect();
		// Spread queries over every known endpoint address
		let mut transport = PinnedH3Transport::with_ip_getter(
			move || candidates.choose(&mut rand::thread_rng())
				.copied()
				.ok_or_else(|| anyhow!("no DoH endpoint address")),
			port, self.timeout, self.insecure,
		)?;
		let req = http::Request::post(url.as_str())
			.header(http::header::CONTENT_TYPE, DNS_MESSAGE)
			.header(http::header::ACCEPT, DNS_MESSAGE)
			.header(http::header::USER_AGENT, self.user_agent.as_str())
			.body(())?;

		let result = async {
			let response = transport.send(req, Some(packet)).await?;
			if !(200..300).contains(&response.status()) {
				return Err(anyhow!("DoH server returned status {}", response.status()));
			}
			response.bytes(MAX_DOH_BODY).await
		}.await;
		debug!(endpoint = %url, addr = ?transport.target(), ok = result.is_ok(), "DoH over HTTP/3 finished");
		transport.close();
		result
	}

	async fn post_h2(&self, url: &reqwest::Url, addrs: &[SocketAddr], packet: Bytes) -> Result<Bytes> {
		let mut builder = reqwest::Client::builder()
			.timeout(self.timeout)
			.user_agent(self.user_agent.as_str())
			.danger_accept_invalid_certs(self.insecure)
			.pool_max_idle_per_host(0)
			.no_proxy();
		if let Some(host) = url.host_str() {
			builder = builder.resolve_to_addrs(host, addrs);
		}
		let client = builder.build()
			.context("failed to create HTTP client for DoH")?;

		let response = client.post(url.clone())
			.header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
			.header(reqwest::header::ACCEPT, DNS_MESSAGE)
			.body(packet)
			.send()
			.await
			.context("DoH POST request failed")?;
		if !response.status().is_success() {
			return Err(anyhow!("DoH server returned status {}", response.status().as_u16()));
		}
		let body = response.bytes().await
			.context("failed to read DoH response body")?;
		Ok(body)
	}
}

#[async_trait]
impl DohClient for HttpDohClient {
	async fn send(&self, query: &Message, endpoint: &str, pinned: &[IpAddr]) -> Result<Message> {
		let url = reqwest::Url::parse(endpoint)
			.with_context(|| format!("invalid DoH URL '{}'", endpoint))?;
		let packet = Bytes::from(query.to_vec()
			.map_err(|e| anyhow!("failed to serialize DNS query: {}", e))?);
		let addrs = self.endpoint_addrs(&url, pinned).await?;

		let h3 = tokio::time::timeout(self.timeout, self.post_h3(&url, &addrs, packet.clone())).await;
		let body = match h3 {
			Ok(Ok(body)) => body,
			Ok(Err(e)) => {
				debug!(endpoint, error = %e, "DoH over HTTP/3 failed, falling back to HTTP/2");
				self.post_h2(&url, &addrs, packet).await?
			}
			Err(_) => {
				debug!(endpoint, "DoH over HTTP/3 timed out, falling back to HTTP/2");
				self.post_h2(&url, &addrs, packet).await?
			}
		};

		let response = Message::from_vec(&body)
			.map_err(|e| anyhow!("failed to parse DNS response: {}", e))?;
		check_response(&response, query)?;
		Ok(response)
	}
}
