// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Identity the agent announces about itself on `/Register`.

use std::env;

use log::debug;
use nix::ifaddrs::{InterfaceAddress, getifaddrs};
use nix::net::if_::InterfaceFlags;
use serde::Serialize;

pub const NODE_NAME_ENV: &str = "CSA_NODE_NAME";
pub const POD_NAME_ENV: &str = "CSA_POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "CSA_POD_NAMESPACE";
pub const POD_UID_ENV: &str = "CSA_POD_UID";
pub const NODE_IP_ENV: &str = "CSA_NODE_IP";
pub const POD_IP_ENV: &str = "CSA_POD_IP";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    #[serde(rename = "NodeName")]
    pub node_name: String,
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "PodNameSpace")]
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    #[serde(rename = "NodeIP")]
    pub node_ip: String,
    #[serde(rename = "PodIP")]
    pub pod_ip: String,
    #[serde(rename = "MacAdress")]
    pub mac_address: String,
}

fn env_or_empty(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

impl AgentInfo {
    /// Reads the downward-API variables injected into the agent's pod. Unset
    /// variables are reported as empty strings.
    pub fn from_env() -> Self {
        Self {
            node_name: env_or_empty(NODE_NAME_ENV),
            pod_name: env_or_empty(POD_NAME_ENV),
            pod_namespace: env_or_empty(POD_NAMESPACE_ENV),
            pod_uid: env_or_empty(POD_UID_ENV),
            node_ip: env_or_empty(NODE_IP_ENV),
            pod_ip: env_or_empty(POD_IP_ENV),
            mac_address: primary_mac_address().unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|octet| format!("{octet:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Picks the first interface carrying a non-loopback IPv4 address and
/// returns the hardware address of that interface.
fn mac_of_first_ipv4_interface<I>(addresses: I) -> Option<String>
where
    I: IntoIterator<Item = InterfaceAddress>,
{
    let addresses: Vec<InterfaceAddress> = addresses.into_iter().collect();

    let interface = addresses.iter().find_map(|ifaddr| {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            return None;
        }
        let ipv4 = ifaddr.address.as_ref()?.as_sockaddr_in()?;
        (!ipv4.ip().is_loopback()).then_some(ifaddr.interface_name.as_str())
    })?;

    addresses
        .iter()
        .filter(|ifaddr| ifaddr.interface_name == interface)
        .find_map(|ifaddr| ifaddr.address.as_ref()?.as_link_addr()?.addr())
        .map(|octets| format_mac(&octets))
}

/// Hardware address of the node's primary interface, `None` if it cannot
/// be determined.
pub fn primary_mac_address() -> Option<String> {
    match getifaddrs() {
        Ok(addresses) => mac_of_first_ipv4_interface(addresses),
        Err(e) => {
            debug!("could not list network interfaces: {e}");
            None
        }
    }
}
