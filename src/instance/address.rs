//! Representative address selection for the computed address attributes.

use std::collections::BTreeMap;

use crate::daemon::{NetworkState, StringMap};

/// Config key naming the interface whose addresses are reflected.
pub const ACCESS_INTERFACE_KEY: &str = "user.access_interface";

const LOOPBACK: &str = "lo";
const INET: &str = "inet";
const INET6: &str = "inet6";
const GLOBAL_SCOPE: &str = "global";

/// Addresses reflected into the computed attributes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SelectedAddresses {
    /// First IPv4 address; also reported as `ip_address`.
    pub ipv4: String,
    /// Last global IPv6 address, or the last IPv6 address of any scope.
    pub ipv6: String,
    /// Hardware address of the interface carrying `ipv4`.
    pub mac: String,
}

/// Picks representative addresses from the observed interfaces.
///
/// When `config` names an access interface only that interface is
/// considered; otherwise every interface except loopback is, in name order.
#[must_use]
pub fn select_addresses(
    config: &StringMap,
    interfaces: &BTreeMap<String, NetworkState>,
) -> SelectedAddresses {
    let access = config
        .get(ACCESS_INTERFACE_KEY)
        .map(String::as_str)
        .filter(|name| !name.is_empty());
    let candidates = interfaces.iter().filter(|(name, _)| match access {
        Some(wanted) => name.as_str() == wanted,
        None => name.as_str() != LOOPBACK,
    });

    let mut selected = SelectedAddresses::default();
    let mut global_v6 = None;
    let mut any_v6 = None;
    for (_, interface) in candidates {
        for address in &interface.addresses {
            match address.family.as_str() {
                INET if selected.ipv4.is_empty() => {
                    selected.ipv4.clone_from(&address.address);
                    selected.mac.clone_from(&interface.hwaddr);
                }
                INET6 => {
                    if address.scope == GLOBAL_SCOPE {
                        global_v6 = Some(address.address.as_str());
                    }
                    any_v6 = Some(address.address.as_str());
                }
                _ => {}
            }
        }
    }
    selected.ipv6 = global_v6.or(any_v6).unwrap_or_default().to_owned();
    selected
}

/// Returns `true` once a non-loopback interface carries an IPv4 address.
#[must_use]
pub fn has_ipv4(interfaces: &BTreeMap<String, NetworkState>) -> bool {
    interfaces
        .iter()
        .filter(|(name, _)| name.as_str() != LOOPBACK)
        .any(|(_, interface)| interface.addresses.iter().any(|address| address.family == INET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::NetworkAddress;

    fn address(family: &str, text: &str, scope: &str) -> NetworkAddress {
        NetworkAddress {
            family: family.to_owned(),
            address: text.to_owned(),
            netmask: String::from("24"),
            scope: scope.to_owned(),
        }
    }

    fn interfaces() -> BTreeMap<String, NetworkState> {
        let mut table = BTreeMap::new();
        table.insert(
            String::from("lo"),
            NetworkState {
                addresses: vec![address("inet", "127.0.0.1", "local"), address("inet6", "::1", "local")],
                hwaddr: String::new(),
            },
        );
        table.insert(
            String::from("eth0"),
            NetworkState {
                addresses: vec![
                    address("inet", "10.0.3.15", "global"),
                    address("inet6", "fd42::15", "global"),
                    address("inet6", "fe80::15", "link"),
                ],
                hwaddr: String::from("00:16:3e:aa:bb:cc"),
            },
        );
        table.insert(
            String::from("eth1"),
            NetworkState {
                addresses: vec![address("inet", "192.168.1.9", "global")],
                hwaddr: String::from("00:16:3e:dd:ee:ff"),
            },
        );
        table
    }

    #[test]
    fn first_inet_outside_loopback_wins() {
        let selected = select_addresses(&StringMap::new(), &interfaces());
        assert_eq!(selected.ipv4, "10.0.3.15");
        assert_eq!(selected.mac, "00:16:3e:aa:bb:cc");
        assert_eq!(selected.ipv6, "fd42::15");
    }

    #[test]
    fn access_interface_restricts_the_search() {
        let mut config = StringMap::new();
        config.insert(ACCESS_INTERFACE_KEY.to_owned(), String::from("eth1"));
        let selected = select_addresses(&config, &interfaces());
        assert_eq!(selected.ipv4, "192.168.1.9");
        assert_eq!(selected.mac, "00:16:3e:dd:ee:ff");
        assert_eq!(selected.ipv6, "");
    }

    #[test]
    fn link_local_ipv6_is_used_when_nothing_is_global() {
        let mut table = BTreeMap::new();
        table.insert(
            String::from("eth0"),
            NetworkState {
                addresses: vec![address("inet6", "fe80::1", "link"), address("inet6", "fe80::2", "link")],
                hwaddr: String::from("00:16:3e:00:00:01"),
            },
        );
        let selected = select_addresses(&StringMap::new(), &table);
        assert_eq!(selected.ipv6, "fe80::2");
        assert_eq!(selected.ipv4, "");
        assert!(!has_ipv4(&table));
    }

    #[test]
    fn loopback_only_is_not_ready() {
        let mut table = interfaces();
        table.remove("eth0");
        table.remove("eth1");
        assert!(!has_ipv4(&table));
        assert!(has_ipv4(&interfaces()));
    }
}
