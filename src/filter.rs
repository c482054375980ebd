use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

/// Literals that never identify a reachable target
const SENTINELS: [IpAddr; 3] = [
	IpAddr::V4(Ipv4Addr::UNSPECIFIED),
	IpAddr::V4(Ipv4Addr::LOCALHOST),
	IpAddr::V4(Ipv4Addr::BROADCAST),
];

/// IP version tag carried on every probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
	V4,
	V6,
}

impl IpVersion {
	pub fn of(ip: &IpAddr) -> Self {
		if ip.is_ipv6() { IpVersion::V6 } else { IpVersion::V4 }
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			IpVersion::V4 => "IPv4",
			IpVersion::V6 => "IPv6",
		}
	}
}

impl fmt::Display for IpVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Addresses that survived filtering plus how many were dropped
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
	pub addresses: Vec<IpAddr>,
	pub rejected: usize,
}

/// Validates, denylists and orders candidate address strings.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
	denylist: Vec<IpAddr>,
}

impl IpFilter {
	pub fn new(denylist: Vec<IpAddr>) -> Self {
		Self { denylist }
	}

	fn accepts(&self, ip: &IpAddr) -> bool {
		!SENTINELS.contains(ip) && !self.denylist.contains(ip)
	}

	/// Keep parseable, non-sentinel, non-denylisted literals.
	///
	/// IPv4 entries come first, IPv6 after; input order is kept inside
	/// each group. Rejected entries are dropped silently.
	pub fn filter<I, S>(&self, raw: I) -> FilterOutcome
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut v4 = Vec::new();
		let mut v6 = Vec::new();
		let mut rejected = 0;

		for entry in raw {
			let entry = entry.as_ref().trim();
			match entry.parse::<IpAddr>() {
				Ok(ip) if self.accepts(&ip) => {
					if ip.is_ipv6() { v6.push(ip) } else { v4.push(ip) }
				}
				_ => rejected += 1,
			}
		}

		if rejected > 0 {
			debug!(rejected, "dropped candidate addresses");
		}

		v4.extend(v6);
		FilterOutcome { addresses: v4, rejected }
	}
}
