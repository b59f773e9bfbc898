//! PortAllocator: computes a coherent map of named UDP ports honoring
//! {fixed, dynamic, paired} policies.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use anyhow::{anyhow, Result};
use log::warn;
use rand::Rng;

use crate::constants::{DYNAMIC_PORT_HIGH, DYNAMIC_PORT_LOW, DYNAMIC_SEED_HIGH, OSC_CUES_PORT};

// ============================================================================
// Port Names
// ============================================================================

/// The fixed set of named ports the daemon allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortName {
    SpiderListenToGui,
    GuiSendToSpider,
    GuiListenToSpider,
    SpiderSendToGui,
    Scsynth,
    ScsynthSend,
    OscCues,
    Tau,
    Spider,
    Phx,
    Daemon,
    SpiderListenToTau,
}

impl PortName {
    /// The human-readable name used in logs and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortName::SpiderListenToGui => "spider-listen-to-gui",
            PortName::GuiSendToSpider => "gui-send-to-spider",
            PortName::GuiListenToSpider => "gui-listen-to-spider",
            PortName::SpiderSendToGui => "spider-send-to-gui",
            PortName::Scsynth => "scsynth",
            PortName::ScsynthSend => "scsynth-send",
            PortName::OscCues => "osc-cues",
            PortName::Tau => "tau",
            PortName::Spider => "spider",
            PortName::Phx => "phx",
            PortName::Daemon => "daemon",
            PortName::SpiderListenToTau => "spider-listen-to-tau",
        }
    }
}

// ============================================================================
// Port Policy
// ============================================================================

/// Allocation policy for a single named port.
#[derive(Debug, Clone, Copy)]
pub enum PortPolicy {
    /// Probe this fixed port first; fall back to Dynamic if occupied.
    Fixed(u16),
    /// Pick the first free port in the ephemeral range.
    Dynamic,
    /// Copy the value already resolved for another, earlier, name.
    Paired(PortName),
}

/// The ordered policy table. Order matters: a `Paired` entry may only
/// reference a name that appears earlier in this table.
pub fn policy_table() -> Vec<(PortName, PortPolicy)> {
    vec![
        (PortName::SpiderListenToGui, PortPolicy::Dynamic),
        (
            PortName::GuiSendToSpider,
            PortPolicy::Paired(PortName::SpiderListenToGui),
        ),
        (PortName::GuiListenToSpider, PortPolicy::Dynamic),
        (
            PortName::SpiderSendToGui,
            PortPolicy::Paired(PortName::GuiListenToSpider),
        ),
        (PortName::Scsynth, PortPolicy::Dynamic),
        (PortName::ScsynthSend, PortPolicy::Paired(PortName::Scsynth)),
        (PortName::OscCues, PortPolicy::Fixed(OSC_CUES_PORT)),
        (PortName::Tau, PortPolicy::Dynamic),
        (PortName::Spider, PortPolicy::Dynamic),
        (PortName::Phx, PortPolicy::Dynamic),
        (PortName::Daemon, PortPolicy::Dynamic),
        (PortName::SpiderListenToTau, PortPolicy::Dynamic),
    ]
}

// ============================================================================
// Port Map
// ============================================================================

/// A fully resolved, immutable mapping from port name to bound value.
#[derive(Debug, Clone)]
pub struct PortMap {
    values: HashMap<PortName, u16>,
}

impl PortMap {
    pub fn get(&self, name: PortName) -> u16 {
        *self
            .values
            .get(&name)
            .expect("PortMap is fully populated by construction")
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Test whether a UDP port is free by attempting to bind to loopback.
/// Any failure, of any kind, means "not free".
fn is_free(port: u16) -> bool {
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Scan forward from `seed` for the first free port, wrapping fatally if the
/// scan rolls past `DYNAMIC_PORT_HIGH` without finding one.
fn scan_dynamic(seed: u16) -> Result<u16> {
    let mut port = seed;
    loop {
        if is_free(port) {
            return Ok(port);
        }
        if port >= DYNAMIC_PORT_HIGH {
            return Err(anyhow!(
                "port allocation exhausted: no free port between {seed} and {DYNAMIC_PORT_HIGH}"
            ));
        }
        port += 1;
    }
}

/// Validate that no `Paired` entry references a name whose own policy is
/// itself `Paired` — such a configuration is rejected at startup.
fn validate_policy_table(table: &[(PortName, PortPolicy)]) -> Result<()> {
    for (name, policy) in table {
        if let PortPolicy::Paired(partner) = policy {
            let partner_policy = table
                .iter()
                .find(|(n, _)| n == partner)
                .map(|(_, p)| p)
                .ok_or_else(|| {
                    anyhow!(
                        "paired port {:?} references unknown partner {:?}",
                        name,
                        partner
                    )
                })?;
            if matches!(partner_policy, PortPolicy::Paired(_)) {
                return Err(anyhow!(
                    "paired port {:?} references {:?}, which is itself paired",
                    name,
                    partner
                ));
            }
        }
    }
    Ok(())
}

/// Compute a fully populated PortMap honoring the policy table's
/// {fixed, dynamic, paired} constraints, or fail fatally.
pub fn allocate() -> Result<PortMap> {
    let table = policy_table();
    validate_policy_table(&table)?;

    let mut values: HashMap<PortName, u16> = HashMap::with_capacity(table.len());
    let mut rng = rand::thread_rng();

    for (name, policy) in &table {
        let value = match policy {
            PortPolicy::Dynamic => {
                let seed = rng.gen_range(DYNAMIC_PORT_LOW..=DYNAMIC_SEED_HIGH);
                scan_dynamic(seed)?
            }
            PortPolicy::Fixed(preferred) => {
                if is_free(*preferred) {
                    *preferred
                } else {
                    warn!(
                        "fixed port {} ({}) occupied, falling back to dynamic allocation",
                        preferred,
                        name.as_str()
                    );
                    let seed = rng.gen_range(DYNAMIC_PORT_LOW..=DYNAMIC_SEED_HIGH);
                    scan_dynamic(seed)?
                }
            }
            PortPolicy::Paired(partner) => *values
                .get(partner)
                .expect("validate_policy_table guarantees partner resolves before this entry"),
        };
        values.insert(*name, value);
    }

    Ok(PortMap { values })
}

// ============================================================================
// Tests
// ============================================================================
