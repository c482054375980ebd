//! Loopback servers for exercising the real protocol legs in tests.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// What the server sends back for one request
pub struct Reply {
	pub status: u16,
	pub headers: Vec<(&'static str, String)>,
	pub body: Vec<u8>,
}

impl Reply {
	pub fn empty(status: u16) -> Self {
		Self { status, headers: Vec::new(), body: Vec::new() }
	}

	pub fn header(mut self, name: &'static str, value: &str) -> Self {
		self.headers.push((name, value.to_string()));
		self
	}
}

/// Self-signed TLS 1.3 acceptor for `names`, offering only the given ALPN ids.
pub fn tls_acceptor(names: &[&str], alpn: &[&[u8]]) -> TlsAcceptor {
	let key_pair = rcgen::KeyPair::generate().unwrap();
	let params = rcgen::CertificateParams::new(
		names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
	).unwrap();
	let cert = params.self_signed(&key_pair).unwrap();
	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

	let mut config = rustls::ServerConfig::builder_with_provider(
		Arc::new(rustls::crypto::ring::default_provider()),
	)
		.with_protocol_versions(&[&rustls::version::TLS13])
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(vec![cert.der().clone()], key)
		.unwrap();
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	TlsAcceptor::from(Arc::new(config))
}

/// Read one HTTP/1.1 request and return its body.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	let header_end = loop {
		if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
			break pos + 4;
		}
		let n = stream.read(&mut chunk).await.ok()?;
		if n == 0 {
			return None;
		}
		buf.extend_from_slice(&chunk[..n]);
	};

	let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
	let length = head.lines()
		.find_map(|line| line.strip_prefix("content-length:"))
		.and_then(|v| v.trim().parse::<usize>().ok())
		.unwrap_or(0);
	while buf.len() < header_end + length {
		let n = stream.read(&mut chunk).await.ok()?;
		if n == 0 {
			return None;
		}
		buf.extend_from_slice(&chunk[..n]);
	}
	Some(buf[header_end..header_end + length].to_vec())
}

/// HTTP/1.1-over-TLS server answering every request with `reply(body)`.
///
/// `reply` returning `None` closes the connection after reading the request.
pub async fn serve_http1<F>(acceptor: TlsAcceptor, reply: F) -> SocketAddr
where
	F: Fn(&[u8]) -> Option<Reply> + Send + Sync + 'static,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let reply = Arc::new(reply);
	tokio::spawn(async move {
		while let Ok((tcp, _)) = listener.accept().await {
			let acceptor = acceptor.clone();
			let reply = reply.clone();
			tokio::spawn(async move {
				let Ok(mut tls) = acceptor.accept(tcp).await else { return };
				let Some(body) = read_request(&mut tls).await else { return };
				let Some(out) = reply(&body) else { return };

				let reason = http::StatusCode::from_u16(out.status)
					.ok()
					.and_then(|s| s.canonical_reason())
					.unwrap_or("Unknown");
				let mut head = format!("HTTP/1.1 {} {}\r\n", out.status, reason);
				for (name, value) in &out.headers {
					head.push_str(&format!("{}: {}\r\n", name, value));
				}
				head.push_str(&format!("content-length: {}\r\nconnection: close\r\n\r\n", out.body.len()));

				let _ = tls.write_all(head.as_bytes()).await;
				let _ = tls.write_all(&out.body).await;
				let _ = tls.shutdown().await;
			});
		}
	});
	addr
}

/// TCP listener that accepts connections and never says a word.
pub async fn silent_listener() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((tcp, _)) = listener.accept().await {
			held.push(tcp);
		}
	});
	addr
}

/// A loopback port with nothing bound to it.
pub fn closed_port() -> u16 {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	port
}
