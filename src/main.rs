mod cli;
mod config;
mod dns;
mod error;
mod extract;
mod filter;
mod h3_transport;
mod output;
mod probe;
mod resolver;
mod runner;
mod task;
#[cfg(test)]
mod testutil;
mod tls;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::ProbeConfig;
use crate::dns::HttpDohClient;
use crate::filter::IpFilter;
use crate::probe::Prober;
use crate::resolver::Resolver;
use crate::runner::Runner;
use crate::task::{IpPreference, Task};

fn init_tracing(verbose: bool) {
	let default_level = if verbose { "debug" } else { "info" };
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
		)
		.with_writer(std::io::stderr)
		.try_init();
}

/// Build the task list from, in order of precedence: task file, host list, --domain, defaults.
fn collect_tasks(cli: &Cli) -> Result<Vec<Task>> {
	if let Some(path) = &cli.config {
		return task::read_task_file(path);
	}
	if let Some(path) = &cli.hosts {
		return task::read_hosts_file(path, cli.sni.as_deref(), &cli.doh_url, cli.port);
	}
	if let Some(domain) = &cli.domain {
		let test_host = task::host_from_url(&cli.test_url);
		let ip_preference = if cli.prefer_ipv6 {
			IpPreference::V6Only
		} else if cli.prefer_ipv4 {
			IpPreference::V4Only
		} else {
			IpPreference::Any
		};
		return Ok(vec![Task {
			doh_resolve_domain: domain.clone(),
			test_sni_host: Some(test_host.clone()),
			test_host_header: Some(test_host),
			doh_url: cli.doh_url.clone(),
			port: cli.port,
			ip_preference,
			resolve_mode: cli.resolve_mode.clone(),
			direct_ips: cli.direct_ips.clone(),
		}]);
	}
	Ok(task::default_tasks())
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	// Host list extraction is a standalone conversion
	if let Some(input) = &cli.extract_hosts {
		let hosts = extract::read_and_extract(input)?;
		tracing::info!(count = hosts.len(), input = %input, "extracted hosts");
		return output::write_json(&hosts, cli.output.as_deref());
	}

	let tasks = collect_tasks(&cli)?;
	if tasks.is_empty() {
		bail!("no probe tasks specified");
	}

	let denylist = if cli.deny.is_empty() {
		config::default_denylist()
	} else {
		config::parse_denylist(&cli.deny)?
	};
	let config = ProbeConfig {
		timeout: Duration::from_secs(cli.timeout.max(1)),
		max_inflight: cli.concurrency.max(1),
		user_agent: cli.user_agent.clone(),
		h3_success: cli.h3_success,
		h2_success: cli.h2_success,
		denylist,
		insecure: cli.insecure,
	};

	output::print_config_summary(&tasks, &config);

	let doh_pinned = cli.doh_ips.iter()
		.map(|ip| ip.trim().parse::<IpAddr>().with_context(|| format!("invalid --doh-ip '{}'", ip)))
		.collect::<Result<Vec<_>>>()?;

	let doh = Arc::new(HttpDohClient::new(config.timeout, config.insecure, &config.user_agent));
	let resolver = Resolver::new(doh, IpFilter::new(config.denylist.clone()), config.timeout)
		.with_doh_pinned(doh_pinned);
	let prober = Prober::new(&config);
	let runner = Runner::new(resolver, prober, config.max_inflight);

	let results = runner.run(&tasks).await;

	output::print_summary(&results);
	output::write_json(&results, cli.output.as_deref())?;

	Ok(())
}
