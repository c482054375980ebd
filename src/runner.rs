use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::error_chain;
use crate::probe::{ProbeResult, ProbeTarget, Prober};
use crate::resolver::Resolver;
use crate::task::Task;

/// Fans tasks out into admission-gated probes.
pub struct Runner {
	resolver: Arc<Resolver>,
	prober: Arc<Prober>,
	gate: Arc<Semaphore>,
}

impl Runner {
	/// `max_inflight` caps how many probes talk to the network at once.
	pub fn new(resolver: Resolver, prober: Prober, max_inflight: usize) -> Self {
		Self {
			resolver: Arc::new(resolver),
			prober: Arc::new(prober),
			gate: Arc::new(Semaphore::new(max_inflight.max(1))),
		}
	}

	/// Resolve every task, probe every surviving address, collect the results.
	///
	/// Resolutions run concurrently under the same gate as probes; a task
	/// that fails to resolve is logged and contributes nothing. Result order
	/// depends on completion order.
	pub async fn run(&self, tasks: &[Task]) -> Vec<ProbeResult> {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut resolutions = JoinSet::new();
		let mut probes = JoinSet::new();

		for task in tasks {
			let task = task.clone();
			let gate = self.gate.clone();
			let resolver = self.resolver.clone();
			resolutions.spawn(async move {
				// Released as soon as resolution ends, before any probe is admitted
				let permit = gate.acquire_owned().await;
				info!(
					domain = %task.doh_resolve_domain, mode = %task.resolve_mode,
					endpoint = %task.doh_url, "resolving task"
				);
				let resolution = match permit {
					Ok(_permit) => Some(resolver.resolve(&task).await),
					Err(_) => None,
				};
				(task, resolution)
			});
		}

		while let Some(joined) = resolutions.join_next().await {
			let (task, resolution) = match joined {
				Ok((task, Some(resolution))) => (task, resolution),
				Ok((_, None)) => continue,
				Err(e) => {
					warn!("resolution task failed: {}", e);
					continue;
				}
			};
			let resolution = match resolution {
				Ok(r) => r,
				Err(e) => {
					warn!(
						domain = %task.doh_resolve_domain, error = %error_chain(&e),
						"resolution failed, skipping task"
					);
					continue;
				}
			};
			info!(
				domain = %task.doh_resolve_domain, count = resolution.addresses.len(),
				addresses = ?resolution.addresses, "resolved"
			);

			for ip in resolution.addresses {
				if !task.ip_preference.allows(&ip) {
					debug!(%ip, preference = ?task.ip_preference, "skipping address family");
					continue;
				}
				let target = ProbeTarget::from_task(&task, ip, &resolution.source);
				let gate = self.gate.clone();
				let prober = self.prober.clone();
				let tx = tx.clone();

				probes.spawn(async move {
					// Held until the probe finishes, including on unwind
					let _permit = match gate.acquire_owned().await {
						Ok(permit) => permit,
						Err(_) => return,
					};
					let result = prober.probe(&target).await;
					if result.success() {
						info!(
							ip = result.target_ip(), version = result.ip_version(),
							protocol = result.protocol(), status = ?result.status_code(),
							server = ?result.server_header(), latency_ms = result.latency_ms(),
							source = result.dns_source(), "reachable"
						);
					} else {
						info!(
							ip = result.target_ip(), version = result.ip_version(),
							protocol = result.protocol(), status = ?result.status_code(),
							error = result.error().unwrap_or("-"), latency_ms = result.latency_ms(),
							"unreachable"
						);
					}
					let _ = tx.send(result);
				});
			}
		}
		drop(tx);

		while let Some(joined) = probes.join_next().await {
			if let Err(e) = joined {
				warn!("probe task failed: {}", e);
			}
		}

		let mut results = Vec::new();
		while let Some(result) = rx.recv().await {
			results.push(result);
		}
		results
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::IpAddr;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use async_trait::async_trait;
	use hickory_proto::op::{Message, MessageType};

	use crate::config::SuccessRule;
	use crate::dns::DohClient;
	use crate::error::{AttemptError, Protocol};
	use crate::filter::IpFilter;
	use crate::probe::{AttemptResponse, AttemptStrategy};
	use crate::task::IpPreference;

	struct NoDoh;

	#[async_trait]
	impl DohClient for NoDoh {
		async fn send(&self, _query: &Message, _endpoint: &str, _pinned: &[IpAddr]) -> anyhow::Result<Message> {
			Err(anyhow::anyhow!("DoH unavailable in tests"))
		}
	}

	/// Answers every question with no records after a short delay
	struct SlowDoh {
		gauge: Arc<Gauge>,
	}

	#[async_trait]
	impl DohClient for SlowDoh {
		async fn send(&self, query: &Message, _endpoint: &str, _pinned: &[IpAddr]) -> anyhow::Result<Message> {
			let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
			self.gauge.peak.fetch_max(now, Ordering::SeqCst);
			self.gauge.total.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(50)).await;
			self.gauge.current.fetch_sub(1, Ordering::SeqCst);
			let mut response = query.clone();
			response.set_message_type(MessageType::Response);
			Ok(response)
		}
	}

	/// Tracks how many attempts overlap
	#[derive(Default)]
	struct Gauge {
		current: AtomicUsize,
		peak: AtomicUsize,
		total: AtomicUsize,
	}

	struct Slow {
		gauge: Arc<Gauge>,
	}

	#[async_trait]
	impl AttemptStrategy for Slow {
		fn name(&self) -> &'static str {
			"slow"
		}

		fn protocol(&self) -> Protocol {
			Protocol::H3
		}

		fn success_rule(&self) -> SuccessRule {
			SuccessRule::Below500
		}

		async fn attempt(&self, target: &ProbeTarget) -> Result<AttemptResponse, AttemptError> {
			let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
			self.gauge.peak.fetch_max(now, Ordering::SeqCst);
			self.gauge.total.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(20)).await;
			self.gauge.current.fetch_sub(1, Ordering::SeqCst);
			if target.ip.is_ipv6() {
				Err(AttemptError::connect(Protocol::None, "v6 unreachable"))
			} else {
				Ok(AttemptResponse { status: 200, server: None, protocol: Protocol::H3 })
			}
		}
	}

	fn runner(gauge: Arc<Gauge>, max_inflight: usize) -> Runner {
		let resolver = Resolver::new(Arc::new(NoDoh), IpFilter::default(), Duration::from_secs(1));
		let prober = Prober::with_strategies(vec![Arc::new(Slow { gauge })], Duration::from_secs(5));
		Runner::new(resolver, prober, max_inflight)
	}

	#[tokio::test]
	async fn test_direct_task_yields_one_result() {
		let gauge = Arc::new(Gauge::default());
		let task = Task::direct("example.test", &["93.184.216.34"]);
		let results = runner(gauge, 10).run(&[task]).await;

		assert_eq!(results.len(), 1);
		assert_eq!(results[0].target_ip(), "93.184.216.34");
		assert_eq!(results[0].ip_version(), "IPv4");
		assert_eq!(results[0].domain_used(), "example.test");
		assert_eq!(results[0].dns_source(), "Direct Input");
		assert!(results[0].success());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrency_cap() {
		let gauge = Arc::new(Gauge::default());
		let tasks: Vec<Task> = (0..6)
			.map(|t| {
				let ips: Vec<String> = (1..=5).map(|i| format!("198.51.{}.{}", t, i)).collect();
				let refs: Vec<&str> = ips.iter().map(|s| s.as_str()).collect();
				Task::direct(&format!("host{}.test", t), &refs)
			})
			.collect();

		let results = runner(gauge.clone(), 3).run(&tasks).await;
		assert_eq!(results.len(), 30);
		assert_eq!(gauge.total.load(Ordering::SeqCst), 30);
		assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
		assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
	}

	#[tokio::test]
	async fn test_failed_resolution_does_not_stop_others() {
		let gauge = Arc::new(Gauge::default());
		let tasks = vec![
			Task::doh("unresolvable.test", "https://doh.test/dns-query"),
			Task::direct("empty.test", &["0.0.0.0"]),
			Task::direct("ok.test", &["203.0.113.9", "2001:db8::9"]),
		];
		let mut results = runner(gauge, 4).run(&tasks).await;
		results.sort_by(|a, b| a.target_ip().cmp(b.target_ip()));

		assert_eq!(results.len(), 2);
		assert!(results.iter().all(|r| r.domain_used() == "ok.test"));
		let v6 = results.iter().find(|r| r.ip_version() == "IPv6").unwrap();
		assert!(!v6.success());
		assert_eq!(v6.error(), Some("v6 unreachable"));
	}

	#[tokio::test]
	async fn test_ip_preference_applied() {
		let gauge = Arc::new(Gauge::default());
		let mut v6_only = Task::direct("dual.test", &["162.159.140.220", "2606:4700:7::da", "2a06:98c1:58::da"]);
		v6_only.ip_preference = IpPreference::V6Only;
		let mut v4_only = v6_only.clone();
		v4_only.ip_preference = IpPreference::V4Only;

		let r = runner(gauge.clone(), 4);
		let v6_results = r.run(&[v6_only]).await;
		assert_eq!(v6_results.len(), 2);
		assert!(v6_results.iter().all(|res| res.ip_version() == "IPv6"));

		let v4_results = r.run(&[v4_only]).await;
		assert_eq!(v4_results.len(), 1);
		assert_eq!(v4_results[0].target_ip(), "162.159.140.220");
	}

	#[tokio::test]
	async fn test_no_tasks_no_results() {
		let gauge = Arc::new(Gauge::default());
		assert!(runner(gauge, 1).run(&[]).await.is_empty());
	}

	#[tokio::test]
	async fn test_tasks_resolve_concurrently() {
		let doh_gauge = Arc::new(Gauge::default());
		let resolver = Resolver::new(
			Arc::new(SlowDoh { gauge: doh_gauge.clone() }), IpFilter::default(), Duration::from_secs(1),
		);
		let prober = Prober::with_strategies(
			vec![Arc::new(Slow { gauge: Arc::new(Gauge::default()) })], Duration::from_secs(5),
		);
		let tasks: Vec<Task> = (0..4)
			.map(|t| Task::doh(&format!("host{}.test", t), "https://doh.test/dns-query"))
			.collect();

		let results = Runner::new(resolver, prober, 4).run(&tasks).await;
		// Every answer is empty, so nothing gets probed
		assert!(results.is_empty());
		assert_eq!(doh_gauge.total.load(Ordering::SeqCst), 8);
		// One task alone keeps at most its A and AAAA queries in flight
		assert!(doh_gauge.peak.load(Ordering::SeqCst) > 2);
	}
}
