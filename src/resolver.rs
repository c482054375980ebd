use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hickory_resolver::TokioResolver;
use tracing::{debug, info};

use crate::dns::{build_query, extract_addresses, DohClient, QueryType};
use crate::error::ResolveError;
use crate::filter::IpFilter;
use crate::task::{ResolveMode, Task};

pub const DIRECT_SOURCE: &str = "Direct Input";
pub const SYSTEM_SOURCE: &str = "System DNS";

/// Filtered candidates for one task plus where they came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
	pub addresses: Vec<IpAddr>,
	pub source: String,
}

pub fn doh_source(endpoint: &str) -> String {
	format!("DoH ({})", endpoint)
}

/// Turns tasks into candidate address lists.
pub struct Resolver {
	doh: Arc<dyn DohClient>,
	filter: IpFilter,
	timeout: Duration,
	/// Addresses used to reach the DoH endpoint itself, when pinned
	doh_pinned: Vec<IpAddr>,
}

impl Resolver {
	pub fn new(doh: Arc<dyn DohClient>, filter: IpFilter, timeout: Duration) -> Self {
		Self { doh, filter, timeout, doh_pinned: Vec::new() }
	}

	pub fn with_doh_pinned(mut self, pinned: Vec<IpAddr>) -> Self {
		self.doh_pinned = pinned;
		self
	}

	/// Resolve a task according to its mode.
	///
	/// An empty post-filter result is reported as [`ResolveError::Empty`].
	pub async fn resolve(&self, task: &Task) -> Result<Resolution, ResolveError> {
		let domain = task.doh_resolve_domain.as_str();
		let (addresses, source) = match task.mode()? {
			ResolveMode::Direct => {
				debug!(domain, ips = ?task.direct_ips, "using directly supplied addresses");
				(self.resolve_direct(&task.direct_ips), DIRECT_SOURCE.to_string())
			}
			ResolveMode::Doh => {
				info!(domain, endpoint = %task.doh_url, "resolving A/AAAA over DoH");
				(self.resolve_doh(domain, &task.doh_url).await?, doh_source(&task.doh_url))
			}
			ResolveMode::Traditional => {
				info!(domain, "resolving with the system resolver");
				(self.resolve_traditional(domain).await?, SYSTEM_SOURCE.to_string())
			}
		};

		if addresses.is_empty() {
			return Err(ResolveError::Empty(domain.to_string()));
		}
		Ok(Resolution { addresses, source })
	}

	pub fn resolve_direct(&self, ips: &[String]) -> Vec<IpAddr> {
		self.filter.filter(ips).addresses
	}

	async fn query(&self, domain: &str, endpoint: &str, query_type: QueryType) -> anyhow::Result<Vec<String>> {
		let query = build_query(domain, query_type, rand::random())?;
		// The client bounds each of its protocol legs itself
		let response = self.doh.send(&query, endpoint, &self.doh_pinned)
			.await
			.with_context(|| format!("{:?} query failed", query_type))?;
		Ok(extract_addresses(&response))
	}

	/// Query A and AAAA concurrently and merge whatever comes back.
	///
	/// One failed query is tolerated; both failing with nothing usable is an error.
	pub async fn resolve_doh(&self, domain: &str, endpoint: &str) -> Result<Vec<IpAddr>, ResolveError> {
		let (a, aaaa) = tokio::join!(
			self.query(domain, endpoint, QueryType::A),
			self.query(domain, endpoint, QueryType::AAAA),
		);

		let mut raw = Vec::new();
		let mut failures = 0;
		let mut last_error = None;
		for (query_type, result) in [(QueryType::A, a), (QueryType::AAAA, aaaa)] {
			match result {
				Ok(ips) => {
					debug!(domain, ?query_type, ?ips, "DoH answer");
					raw.extend(ips);
				}
				Err(e) => {
					debug!(domain, ?query_type, error = %e, "DoH query failed");
					failures += 1;
					last_error = Some(e);
				}
			}
		}

		let outcome = self.filter.filter(&raw);
		match last_error {
			Some(source) if failures == 2 => Err(ResolveError::Doh {
				domain: domain.to_string(),
				endpoint: endpoint.to_string(),
				source,
			}),
			_ => Ok(outcome.addresses),
		}
	}

	/// Look up both families through the system resolver configuration.
	pub async fn resolve_traditional(&self, domain: &str) -> Result<Vec<IpAddr>, ResolveError> {
		let system_err = |message: String| ResolveError::System {
			domain: domain.to_string(),
			message,
		};
		let resolver = TokioResolver::builder_tokio()
			.map_err(|e| system_err(e.to_string()))?
			.build();
		let lookup = tokio::time::timeout(self.timeout, resolver.lookup_ip(domain))
			.await
			.map_err(|_| system_err(format!("timed out after {}s", self.timeout.as_secs_f64())))?
			.map_err(|e| system_err(e.to_string()))?;

		let raw: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
		Ok(self.filter.filter(&raw).addresses)
	}
}
