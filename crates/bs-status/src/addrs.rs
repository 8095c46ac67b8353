// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::warn;

/// Non-loopback IP addresses of the interfaces that are up, sorted.
#[must_use]
pub fn host_addresses() -> Vec<String> {
    let interfaces = match getifaddrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("unable to list network interfaces: {e}");
            return Vec::new();
        }
    };
    let mut addrs = BTreeSet::new();
    for interface in interfaces {
        if !interface.flags.contains(InterfaceFlags::IFF_UP)
            || interface.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(address) = interface.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if !ip.is_loopback() && !ip.is_unspecified() {
            addrs.insert(ip.to_string());
        }
    }
    addrs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_loopback_addresses() {
        for addr in host_addresses() {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(!ip.is_loopback(), "{addr} is a loopback address");
        }
    }
}
