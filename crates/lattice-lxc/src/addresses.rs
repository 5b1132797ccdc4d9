//! Host address discovery

use crate::api::InstanceState;

/// Interface skipped during discovery
const LOOPBACK_INTERFACE: &str = "lo";

/// Addresses of an instance usable by other hosts
///
/// Interfaces are visited in name order; the loopback interface and
/// link-local or host-local scoped addresses are skipped.
pub fn host_addresses(state: &InstanceState) -> Vec<String> {
    let Some(network) = &state.network else {
        return Vec::new();
    };
    network
        .iter()
        .filter(|(name, _)| name.as_str() != LOOPBACK_INTERFACE)
        .flat_map(|(_, iface)| iface.addresses.iter())
        .filter(|addr| !addr.address.is_empty() && addr.scope != "link" && addr.scope != "local")
        .map(|addr| addr.address.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InstanceNetwork, InstanceNetworkAddress};
    use std::collections::BTreeMap;

    fn addr(address: &str, scope: &str) -> InstanceNetworkAddress {
        InstanceNetworkAddress {
            family: if address.contains(':') { "inet6" } else { "inet" }.to_string(),
            address: address.to_string(),
            netmask: "24".to_string(),
            scope: scope.to_string(),
        }
    }

    #[test]
    fn test_skips_loopback_and_link_local() {
        let state = InstanceState {
            network: Some(BTreeMap::from([
                (
                    "lo".to_string(),
                    InstanceNetwork {
                        addresses: vec![addr("127.0.0.1", "local")],
                        ..Default::default()
                    },
                ),
                (
                    "eth1".to_string(),
                    InstanceNetwork {
                        addresses: vec![addr("10.1.0.5", "global")],
                        ..Default::default()
                    },
                ),
                (
                    "eth0".to_string(),
                    InstanceNetwork {
                        addresses: vec![
                            addr("10.0.0.5", "global"),
                            addr("fe80::1", "link"),
                            addr("fd42::5", "global"),
                        ],
                        ..Default::default()
                    },
                ),
            ])),
            ..Default::default()
        };

        assert_eq!(host_addresses(&state), vec!["10.0.0.5", "fd42::5", "10.1.0.5"]);
    }

    #[test]
    fn test_no_network_state() {
        assert!(host_addresses(&InstanceState::default()).is_empty());
    }
}
