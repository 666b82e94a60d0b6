// Copyright 2024 Blobmap Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host name validation applied when a node is admitted to the topology

use crate::error::{ClusterMapError, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::net::IpAddr;
use tracing::debug;

/// Resolves a declared host name to the name the host is known by
pub trait HostnameResolver: Send + Sync + fmt::Debug {
    fn canonical_hostname(&self, hostname: &str) -> io::Result<String>;
}

/// Resolver backed by the operating system.
///
/// The declared name is resolved forward, then each address is resolved back
/// to its PTR name. The reverse name equal to the declared one wins; otherwise
/// the first reverse name is reported so the mismatch is visible. Address
/// literals are never accepted as host names.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostnameResolver for SystemResolver {
    fn canonical_hostname(&self, hostname: &str) -> io::Result<String> {
        if hostname.parse::<IpAddr>().is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{hostname} is an address literal, not a host name"),
            ));
        }

        let addrs = dns_lookup::lookup_host(hostname)?;
        let mut canonical = None;
        for addr in &addrs {
            let name = match dns_lookup::lookup_addr(addr) {
                Ok(name) => name,
                Err(e) => {
                    debug!(%hostname, %addr, error = %e, "Reverse lookup failed");
                    continue;
                }
            };
            // getnameinfo hands back the numeric form when there is no PTR record
            if name.parse::<IpAddr>().is_ok() {
                continue;
            }
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if name.eq_ignore_ascii_case(hostname) {
                return Ok(name);
            }
            canonical.get_or_insert(name);
        }

        canonical.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address of {hostname} has a reverse record"),
            )
        })
    }
}

/// Fixed host name table, for tests and air-gapped deployments
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: RwLock<HashMap<String, String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `hostname` to itself
    pub fn with_host(self, hostname: &str) -> Self {
        self.insert(hostname, hostname);
        self
    }

    pub fn insert(&self, hostname: &str, canonical: &str) {
        self.names.write().insert(hostname.to_string(), canonical.to_string());
    }
}

impl HostnameResolver for StaticResolver {
    fn canonical_hostname(&self, hostname: &str) -> io::Result<String> {
        self.names
            .read()
            .get(hostname)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {hostname}")))
    }
}

/// Check that `hostname` is the name the resolver reports for it
pub(crate) fn validate_hostname(resolver: &dyn HostnameResolver, hostname: &str) -> Result<()> {
    let canonical = resolver
        .canonical_hostname(hostname)
        .map_err(|e| ClusterMapError::HostnameValidation {
            hostname: hostname.to_string(),
            reason: e.to_string(),
        })?;

    if !canonical.eq_ignore_ascii_case(hostname) {
        return Err(ClusterMapError::HostnameValidation {
            hostname: hostname.to_string(),
            reason: format!("host resolves to {canonical}"),
        });
    }
    Ok(())
}
