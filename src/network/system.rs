// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host network layer driven through `wg` and `iptables`.
//!
//! Layout installed by [`SystemNetwork::setup`]:
//!
//! ```text
//! FORWARD -i <dev> -j WAG_AUTHORIZED
//! WAG_AUTHORIZED:
//!     -s 10.0.0.2/32 -j ACCEPT     (one per authorized device, inserted at the head)
//!     ...
//!     -j DROP                      (terminal)
//! ```
//!
//! Every mutation checks the current rule with `-C` first, so re-applying a
//! desired state runs no mutating command at all. IPv6 device addresses go
//! through `ip6tables` with the same layout.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tokio::process::Command;

use super::NetworkLayer;
use crate::error::NetworkError;
use crate::types::DeviceAddress;

/// Chain holding one ACCEPT rule per authorized device.
pub const AUTHORIZED_CHAIN: &str = "WAG_AUTHORIZED";

/// Upper bound on duplicate rules removed for one address.
const MAX_DUPLICATE_RULES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(address: DeviceAddress) -> Self {
        match address.ip() {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn binary(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// Outcome of a command whose non-zero exit is an answer, not a failure.
enum Check {
    Present,
    Absent,
}

#[derive(Debug, Clone)]
pub struct SystemNetwork {
    dev_name: String,
    chain: String,
    ipv6: bool,
}

impl SystemNetwork {
    pub fn new(dev_name: impl Into<String>) -> Self {
        Self {
            dev_name: dev_name.into(),
            chain: AUTHORIZED_CHAIN.to_string(),
            ipv6: false,
        }
    }

    /// Also manage `ip6tables` for IPv6 device addresses.
    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6 = enabled;
        self
    }

    fn families(&self) -> Vec<Family> {
        if self.ipv6 {
            vec![Family::V4, Family::V6]
        } else {
            vec![Family::V4]
        }
    }

    fn family_for(&self, address: DeviceAddress) -> Result<Family, NetworkError> {
        let family = Family::of(address);
        if family == Family::V6 && !self.ipv6 {
            return Err(NetworkError::new(
                "set_reachable",
                format!("{} is IPv6 but IPv6 rules are not enabled", address),
            ));
        }
        Ok(family)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, NetworkError> {
        let operation = format!("{} {}", program, args.join(" "));
        tracing::debug!(target: "network::system", command = %operation, "Running network command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| NetworkError::new(&operation, format!("failed to spawn: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(NetworkError::new(operation, detail));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run an `iptables -C` style check. Exit status 1 means "no such rule";
    /// anything else non-zero is a real failure.
    async fn check(&self, program: &str, args: &[&str]) -> Result<Check, NetworkError> {
        let operation = format!("{} {}", program, args.join(" "));
        let status = Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| NetworkError::new(&operation, format!("failed to spawn: {}", e)))?;

        match status.code() {
            Some(0) => Ok(Check::Present),
            Some(1) => Ok(Check::Absent),
            _ => Err(NetworkError::new(operation, format!("exited with {}", status))),
        }
    }

    async fn iptables(&self, family: Family, args: &[&str]) -> Result<String, NetworkError> {
        let mut full = vec!["-w"];
        full.extend_from_slice(args);
        self.run(family.binary(), &full).await
    }

    async fn iptables_check(&self, family: Family, args: &[&str]) -> Result<Check, NetworkError> {
        let mut full = vec!["-w"];
        full.extend_from_slice(args);
        self.check(family.binary(), &full).await
    }

    async fn setup_family(&self, family: Family) -> Result<(), NetworkError> {
        let chain = self.chain.as_str();
        let dev = self.dev_name.as_str();

        if let Check::Absent = self.iptables_check(family, &["-S", chain]).await? {
            self.iptables(family, &["-N", chain]).await?;
        }
        // Start from an empty chain; reconcile re-grants whoever is entitled.
        self.iptables(family, &["-F", chain]).await?;
        self.iptables(family, &["-A", chain, "-j", "DROP"]).await?;

        let hook = ["FORWARD", "-i", dev, "-j", chain];
        if let Check::Absent = self.iptables_check(family, &prefixed("-C", &hook)).await? {
            self.iptables(family, &prefixed_at("-I", "1", &hook)).await?;
        }
        Ok(())
    }

    async fn teardown_family(&self, family: Family) -> Result<(), NetworkError> {
        let chain = self.chain.as_str();
        let dev = self.dev_name.as_str();
        let hook = ["FORWARD", "-i", dev, "-j", chain];

        for _ in 0..MAX_DUPLICATE_RULES {
            match self.iptables_check(family, &prefixed("-C", &hook)).await? {
                Check::Present => {
                    self.iptables(family, &prefixed("-D", &hook)).await?;
                }
                Check::Absent => break,
            }
        }

        if let Check::Present = self.iptables_check(family, &["-S", chain]).await? {
            self.iptables(family, &["-F", chain]).await?;
            self.iptables(family, &["-X", chain]).await?;
        }
        Ok(())
    }

    async fn allowed_ips(&self) -> Result<Vec<PeerEntry>, NetworkError> {
        let output = self.run("wg", &["show", &self.dev_name, "allowed-ips"]).await?;
        Ok(parse_allowed_ips(&output))
    }
}

#[async_trait]
impl NetworkLayer for SystemNetwork {
    async fn setup(&self) -> Result<(), NetworkError> {
        for family in self.families() {
            self.setup_family(family).await?;
        }
        tracing::info!(
            target: "network::system",
            dev = %self.dev_name,
            chain = %self.chain,
            "Installed forwarding chain"
        );
        Ok(())
    }

    async fn set_reachable(&self, address: DeviceAddress, reachable: bool) -> Result<(), NetworkError> {
        let family = self.family_for(address)?;
        let cidr = address.host_cidr();
        let rule = [self.chain.as_str(), "-s", cidr.as_str(), "-j", "ACCEPT"];

        if reachable {
            if let Check::Absent = self.iptables_check(family, &prefixed("-C", &rule)).await? {
                self.iptables(family, &prefixed_at("-I", "1", &rule)).await?;
                tracing::debug!(target: "network::system", %address, "Inserted ACCEPT rule");
            }
            return Ok(());
        }

        for _ in 0..MAX_DUPLICATE_RULES {
            match self.iptables_check(family, &prefixed("-C", &rule)).await? {
                Check::Present => {
                    self.iptables(family, &prefixed("-D", &rule)).await?;
                    tracing::debug!(target: "network::system", %address, "Deleted ACCEPT rule");
                }
                Check::Absent => return Ok(()),
            }
        }
        Err(NetworkError::new(
            "set_reachable",
            format!("more than {} ACCEPT rules for {}", MAX_DUPLICATE_RULES, address),
        ))
    }

    async fn query_reachable(&self, address: DeviceAddress) -> Result<bool, NetworkError> {
        let family = self.family_for(address)?;
        let cidr = address.host_cidr();
        let rule = [self.chain.as_str(), "-s", cidr.as_str(), "-j", "ACCEPT"];
        Ok(matches!(
            self.iptables_check(family, &prefixed("-C", &rule)).await?,
            Check::Present
        ))
    }

    async fn remove_peer(&self, address: DeviceAddress) -> Result<(), NetworkError> {
        let peers = self.allowed_ips().await?;
        let Some(peer) = peers.iter().find(|p| p.addresses.contains(&address)) else {
            return Ok(());
        };
        self.run("wg", &["set", &self.dev_name, "peer", &peer.public_key, "remove"])
            .await?;
        tracing::info!(target: "network::system", %address, "Removed tunnel peer");
        Ok(())
    }

    async fn list_peers(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
        Ok(self
            .allowed_ips()
            .await?
            .into_iter()
            .flat_map(|p| p.addresses)
            .collect())
    }

    async fn list_reachable(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
        let mut reachable = BTreeSet::new();
        for family in self.families() {
            let rules = self.iptables(family, &["-S", &self.chain]).await?;
            reachable.extend(parse_chain_rules(&rules, &self.chain));
        }
        Ok(reachable)
    }

    async fn teardown(&self) -> Result<(), NetworkError> {
        let mut first_error = None;
        for family in self.families() {
            if let Err(e) = self.teardown_family(family).await {
                tracing::error!(target: "network::system", error = %e, "Teardown step failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn prefixed<'a>(flag: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(rest.len() + 1);
    args.push(flag);
    args.extend_from_slice(rest);
    args
}

/// `-I CHAIN 1 rest...`
fn prefixed_at<'a>(flag: &'a str, position: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(rest.len() + 2);
    args.push(flag);
    if let Some((chain, tail)) = rest.split_first() {
        args.push(chain);
        args.push(position);
        args.extend_from_slice(tail);
    }
    args
}

/// One line of `wg show <dev> allowed-ips`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub public_key: String,
    pub addresses: Vec<DeviceAddress>,
}

/// Parse `wg show <dev> allowed-ips` output.
///
/// Each line is `<public key>\t<cidr> <cidr>...`, or `<public key>\t(none)`.
/// Only host routes identify a device; wider ranges are skipped.
pub fn parse_allowed_ips(output: &str) -> Vec<PeerEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let public_key = fields.next()?.to_string();
            let addresses = fields
                .filter(|cidr| is_host_route(cidr))
                .filter_map(|cidr| cidr.parse::<DeviceAddress>().ok())
                .collect();
            Some(PeerEntry {
                public_key,
                addresses,
            })
        })
        .collect()
}

fn is_host_route(cidr: &str) -> bool {
    match cidr.split_once('/') {
        Some((_, "32")) | Some((_, "128")) => true,
        Some(_) => false,
        None => cidr != "(none)",
    }
}

/// Addresses with an ACCEPT rule in `iptables -S <chain>` output.
pub fn parse_chain_rules(output: &str, chain: &str) -> BTreeSet<DeviceAddress> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"-A") || tokens.get(1) != Some(&chain) {
                return None;
            }
            let jump = tokens.iter().position(|t| *t == "-j")?;
            if tokens.get(jump + 1) != Some(&"ACCEPT") {
                return None;
            }
            let source = tokens.iter().position(|t| *t == "-s")?;
            tokens.get(source + 1)?.parse::<DeviceAddress>().ok()
        })
        .collect()
}
