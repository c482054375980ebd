//! HTTP/3 transport pinned to one literal address.
//!
//! The transport never resolves names itself: it dials the given IP over
//! QUIC while presenting the caller's server name for SNI and certificate
//! checks. Every transport owns its own endpoint and must be closed (or
//! dropped) once the exchange is over so no UDP sockets outlive a probe.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use h3::client::{RequestStream, SendRequest};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::tls::{client_config, ALPN_H3};

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Response head plus the stream its body arrives on
pub struct H3Response {
	pub head: http::Response<()>,
	stream: H3Stream,
}

impl H3Response {
	pub fn status(&self) -> u16 {
		self.head.status().as_u16()
	}

	pub fn header(&self, name: &str) -> Option<String> {
		self.head.headers()
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string())
	}

	/// Read the body, failing once more than `limit` bytes arrive.
	pub async fn bytes(mut self, limit: usize) -> Result<Bytes> {
		let mut body = BytesMut::new();
		while let Some(chunk) = self.stream.recv_data().await
			.map_err(|e| anyhow!("HTTP/3 body read failed: {}", e))?
		{
			body.put(chunk);
			if body.len() > limit {
				return Err(anyhow!("HTTP/3 body exceeds {} bytes", limit));
			}
		}
		Ok(body.freeze())
	}
}

/// Where the dial address comes from
enum DialIp {
	Fixed(IpAddr),
	Deferred(Box<dyn FnOnce() -> Result<IpAddr> + Send>),
	Taken,
}

pub struct PinnedH3Transport {
	dial_ip: DialIp,
	port: u16,
	client_config: quinn::ClientConfig,
	endpoint: Option<quinn::Endpoint>,
	target: Option<SocketAddr>,
	conn: Option<quinn::Connection>,
	sender: Option<SendRequest<h3_quinn::OpenStreams, Bytes>>,
	driver: Option<JoinHandle<()>>,
	closed: bool,
}

impl PinnedH3Transport {
	/// Create a transport that will dial `ip:port`.
	///
	/// `idle_timeout` bounds how long QUIC keeps a silent connection open.
	pub fn new(ip: IpAddr, port: u16, idle_timeout: Duration, insecure: bool) -> Result<Self> {
		Self::build(DialIp::Fixed(ip), port, idle_timeout, insecure)
	}

	/// Create a transport whose address is asked for only when it first dials.
	pub fn with_ip_getter<F>(get_ip: F, port: u16, idle_timeout: Duration, insecure: bool) -> Result<Self>
	where
		F: FnOnce() -> Result<IpAddr> + Send + 'static,
	{
		Self::build(DialIp::Deferred(Box::new(get_ip)), port, idle_timeout, insecure)
	}

	fn build(dial_ip: DialIp, port: u16, idle_timeout: Duration, insecure: bool) -> Result<Self> {
		let crypto = client_config(&[ALPN_H3], insecure)?;
		let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
			.map_err(|e| anyhow!("TLS config unusable for QUIC: {}", e))?;
		let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

		let mut transport = quinn::TransportConfig::default();
		let idle = quinn::IdleTimeout::try_from(idle_timeout)
			.map_err(|e| anyhow!("invalid QUIC idle timeout: {}", e))?;
		transport.max_idle_timeout(Some(idle));
		client_config.transport_config(Arc::new(transport));

		Ok(Self {
			dial_ip,
			port,
			client_config,
			endpoint: None,
			target: None,
			conn: None,
			sender: None,
			driver: None,
			closed: false,
		})
	}

	/// Address dialed, once known. Deferred transports report `None` until they dial.
	pub fn target(&self) -> Option<SocketAddr> {
		match self.dial_ip {
			DialIp::Fixed(ip) => Some(SocketAddr::new(ip, self.port)),
			_ => self.target,
		}
	}

	fn resolve_target(&mut self) -> Result<SocketAddr> {
		if let Some(target) = self.target() {
			return Ok(target);
		}
		let ip = match std::mem::replace(&mut self.dial_ip, DialIp::Taken) {
			DialIp::Fixed(ip) => ip,
			DialIp::Deferred(get_ip) => get_ip().context("IP getter failed")?,
			DialIp::Taken => return Err(anyhow!("IP getter already failed")),
		};
		let target = SocketAddr::new(ip, self.port);
		self.target = Some(target);
		Ok(target)
	}

	async fn connect(&mut self, server_name: &str) -> Result<&mut SendRequest<h3_quinn::OpenStreams, Bytes>> {
		if self.closed {
			return Err(anyhow!("HTTP/3 transport already closed"));
		}
		if self.sender.is_none() {
			let target = self.resolve_target()?;
			let bind_addr: SocketAddr = if target.is_ipv4() {
				"0.0.0.0:0".parse()?
			} else {
				"[::]:0".parse()?
			};
			let endpoint = quinn::Endpoint::client(bind_addr)
				.with_context(|| format!("failed to bind QUIC endpoint on {}", bind_addr))?;
			let connecting = endpoint
				.connect_with(self.client_config.clone(), target, server_name)
				.map_err(|e| anyhow!("QUIC connect to {} failed: {}", target, e));
			self.endpoint = Some(endpoint);
			let conn = connecting?.await
				.map_err(|e| anyhow!("QUIC handshake with {} failed: {}", target, e))?;
			debug!(target_addr = %target, server_name, "QUIC connection established");

			let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(conn.clone()))
				.await
				.map_err(|e| anyhow!("HTTP/3 handshake with {} failed: {}", target, e))?;

			self.driver = Some(tokio::spawn(async move {
				let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
			}));
			self.conn = Some(conn);
			self.sender = Some(sender);
		}
		self.sender.as_mut().ok_or_else(|| anyhow!("HTTP/3 connection unavailable"))
	}

	/// Send one request, with an optional body, and wait for the response head.
	///
	/// The request URI must be absolute; its host is used as the TLS server name.
	pub async fn send(&mut self, req: http::Request<()>, body: Option<Bytes>) -> Result<H3Response> {
		let server_name = req.uri().host()
			.ok_or_else(|| anyhow!("request URI {} has no host", req.uri()))?
			.trim_matches(|c| c == '[' || c == ']')
			.to_string();
		let sender = self.connect(&server_name).await?;

		let mut stream = sender.send_request(req).await
			.map_err(|e| anyhow!("HTTP/3 send_request failed: {}", e))?;
		if let Some(body) = body {
			stream.send_data(body).await
				.map_err(|e| anyhow!("HTTP/3 send_data failed: {}", e))?;
		}
		stream.finish().await
			.map_err(|e| anyhow!("HTTP/3 finish failed: {}", e))?;

		let head = stream.recv_response().await
			.map_err(|e| anyhow!("HTTP/3 recv_response failed: {}", e))?;
		Ok(H3Response { head, stream })
	}

	/// Release the QUIC connection, its driver task and the UDP socket.
	pub fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		self.sender = None;
		if let Some(conn) = self.conn.take() {
			conn.close(0u32.into(), b"done");
		}
		if let Some(driver) = self.driver.take() {
			driver.abort();
		}
		if let Some(endpoint) = self.endpoint.take() {
			endpoint.close(0u32.into(), b"done");
		}
		debug!(target_addr = ?self.target(), "HTTP/3 transport closed");
	}
}

impl Drop for PinnedH3Transport {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn test_new_pins_target() {
		let transport = PinnedH3Transport::new(
			"192.0.2.10".parse().unwrap(), 8443, Duration::from_secs(5), false,
		).unwrap();
		assert_eq!(transport.target(), Some("192.0.2.10:8443".parse().unwrap()));
	}

	#[tokio::test]
	async fn test_ip_getter_is_deferred() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let mut transport = PinnedH3Transport::with_ip_getter(
			move || {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(anyhow!("no address"))
			},
			443, Duration::from_secs(5), false,
		).unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert_eq!(transport.target(), None);

		let req = http::Request::get("https://example.test/").body(()).unwrap();
		let err = transport.send(req, None).await.err().unwrap();
		assert!(format!("{:#}", err).contains("no address"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		// A failed getter is not asked twice
		let req = http::Request::get("https://example.test/").body(()).unwrap();
		assert!(transport.send(req, None).await.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_close_is_idempotent() {
		let mut transport = PinnedH3Transport::new(
			"192.0.2.10".parse().unwrap(), 443, Duration::from_secs(5), false,
		).unwrap();
		transport.close();
		transport.close();

		let req = http::Request::get("https://example.test/").body(()).unwrap();
		let err = transport.send(req, None).await.err().unwrap();
		assert!(err.to_string().contains("closed"));
	}
}
