use std::collections::BTreeMap;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::config::ProbeConfig;
use crate::probe::ProbeResult;
use crate::task::Task;

/// Print a summary of the run configuration before probing.
pub fn print_config_summary(tasks: &[Task], config: &ProbeConfig) {
	eprintln!("Connectivity Probe Configuration");
	eprintln!("================================");
	eprintln!("Tasks:          {}", tasks.len());
	for t in tasks {
		eprintln!("  - {} ({}, port {})", t.doh_resolve_domain, t.resolve_mode, t.port);
	}
	eprintln!("Timeout:        {} s", config.timeout.as_secs_f64());
	eprintln!("Concurrency:    {}", config.max_inflight);
	eprintln!("HTTP/3 success: {}", config.h3_success);
	eprintln!("HTTP/2 success: {}", config.h2_success);
	if config.insecure {
		eprintln!("TLS verify:     off");
	}
	eprintln!();
}

/// Success/failure counts per probed domain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
	pub total: usize,
	pub succeeded: usize,
	pub per_domain: BTreeMap<String, (usize, usize)>,
}

impl Summary {
	pub fn from_results(results: &[ProbeResult]) -> Self {
		let mut summary = Summary { total: results.len(), ..Default::default() };
		for r in results {
			let entry = summary.per_domain.entry(r.domain_used().to_string()).or_default();
			entry.1 += 1;
			if r.success() {
				entry.0 += 1;
				summary.succeeded += 1;
			}
		}
		summary
	}

	pub fn failed(&self) -> usize {
		self.total - self.succeeded
	}

	/// Domains with at least one reachable address
	pub fn reachable_domains(&self) -> usize {
		self.per_domain.values().filter(|(ok, _)| *ok > 0).count()
	}
}

/// Print the per-domain counts as a table on stderr.
pub fn print_summary(results: &[ProbeResult]) {
	let summary = Summary::from_results(results);

	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Domain", "Reachable", "Probed"]);
	for (domain, (ok, total)) in &summary.per_domain {
		table.add_row(vec![domain.clone(), ok.to_string(), total.to_string()]);
	}

	eprintln!("\nProbe Summary");
	eprintln!("=============\n");
	eprintln!("{table}");
	eprintln!(
		"Probes: {} (succeeded: {}, failed: {})",
		summary.total, summary.succeeded, summary.failed(),
	);
	eprintln!(
		"Domains: {} (at least one address reachable: {})",
		summary.per_domain.len(), summary.reachable_domains(),
	);
}

/// Serialize as pretty JSON to `path`, or to stdout when no path is given.
pub fn write_json<T: Serialize + ?Sized>(value: &T, path: Option<&str>) -> Result<()> {
	let json = serde_json::to_string_pretty(value)
		.context("failed to serialize output")?;
	match path {
		Some(path) => {
			std::fs::write(path, json + "\n")
				.with_context(|| format!("failed to write '{}'", path))?;
			eprintln!("\nResults written to: {}", path);
		}
		None => println!("{}", json),
	}
	Ok(())
}
