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

//! Network endpoints of data nodes and secure endpoint selection

use crate::config::normalize_datacenters;
use crate::error::{ClusterMapError, Result};
use crate::types::DataNodeKey;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Connection kind of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortKind {
    Plaintext,
    Ssl,
}

impl PortKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortKind::Plaintext => "PLAINTEXT",
            PortKind::Ssl => "SSL",
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port number together with its connection kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    number: u16,
    kind: PortKind,
}

impl Port {
    pub const fn new(number: u16, kind: PortKind) -> Self {
        Self { number, kind }
    }

    pub const fn plaintext(number: u16) -> Self {
        Self::new(number, PortKind::Plaintext)
    }

    pub const fn ssl(number: u16) -> Self {
        Self::new(number, PortKind::Ssl)
    }

    #[inline]
    pub fn number(&self) -> u16 {
        self.number
    }

    #[inline]
    pub fn kind(&self) -> PortKind {
        self.kind
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.number, self.kind)
    }
}

/// Ports of one data node: exactly one plaintext port, at most one SSL port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSet {
    plaintext: Port,
    ssl: Option<Port>,
}

impl PortSet {
    pub fn new(hostname: &str, plaintext: u16, ssl: Option<u16>) -> Result<Self> {
        let mut ports = vec![Port::plaintext(plaintext)];
        ports.extend(ssl.map(Port::ssl));
        Self::from_ports(hostname, ports)
    }

    /// Build from an arbitrary port list, rejecting missing plaintext ports
    /// and duplicate kinds.
    pub fn from_ports(hostname: &str, ports: impl IntoIterator<Item = Port>) -> Result<Self> {
        let mut plaintext = None;
        let mut ssl = None;

        for port in ports {
            if port.number() == 0 {
                return Err(ClusterMapError::malformed(format!("port 0 declared for data node {hostname}")));
            }
            let slot = match port.kind() {
                PortKind::Plaintext => &mut plaintext,
                PortKind::Ssl => &mut ssl,
            };
            if slot.replace(port).is_some() {
                return Err(ClusterMapError::malformed(format!(
                    "more than one {} port declared for data node {hostname}",
                    port.kind()
                )));
            }
        }

        let plaintext = plaintext.ok_or_else(|| ClusterMapError::MissingPlaintextPort {
            hostname: hostname.to_string(),
        })?;
        if let Some(ssl) = ssl
            && ssl.number() == plaintext.number()
        {
            return Err(ClusterMapError::malformed(format!(
                "ssl port of data node {hostname} equals its plaintext port {}",
                plaintext.number()
            )));
        }

        Ok(Self { plaintext, ssl })
    }

    #[inline]
    pub fn plaintext(&self) -> Port {
        self.plaintext
    }

    #[inline]
    pub fn ssl(&self) -> Option<Port> {
        self.ssl
    }

    /// All ports, plaintext first
    pub fn to_vec(&self) -> Vec<Port> {
        std::iter::once(self.plaintext).chain(self.ssl).collect()
    }

    /// Select the port a peer must connect to.
    ///
    /// Secure connections are a property of the datacenter: nodes in an
    /// SSL-enabled datacenter are only reachable over SSL, everything else
    /// uses plaintext even when an SSL port exists.
    pub fn connect_port(&self, node: &DataNodeKey, datacenter: &str, ssl_enabled: &SslEnabledDatacenters) -> Result<Port> {
        if !ssl_enabled.contains(datacenter) {
            return Ok(self.plaintext);
        }
        self.ssl.ok_or_else(|| ClusterMapError::UnavailableEndpoint {
            node: node.clone(),
            datacenter: datacenter.to_string(),
        })
    }
}

/// Cluster-wide set of datacenters that require SSL.
///
/// Reads are lock-free; updates swap in a new set atomically.
#[derive(Debug)]
pub struct SslEnabledDatacenters {
    inner: ArcSwap<BTreeSet<String>>,
}

impl SslEnabledDatacenters {
    pub fn new<I, S>(datacenters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            inner: ArcSwap::from_pointee(normalize_datacenters(datacenters).into_iter().collect()),
        }
    }

    pub fn contains(&self, datacenter: &str) -> bool {
        self.inner.load().contains(datacenter)
    }

    /// Sorted list of the current datacenters
    pub fn to_vec(&self) -> Vec<String> {
        self.inner.load().iter().cloned().collect()
    }

    pub fn replace<I, S>(&self, datacenters: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner
            .store(Arc::new(normalize_datacenters(datacenters).into_iter().collect()));
    }
}

impl Default for SslEnabledDatacenters {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DataNodeKey {
        DataNodeKey::new("h1", 7000)
    }

    #[test]
    fn test_plaintext_port_required() {
        let err = PortSet::from_ports("h1", [Port::ssl(7443)]).unwrap_err();
        assert!(matches!(err, ClusterMapError::MissingPlaintextPort { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_duplicate_port_kind_rejected() {
        let err = PortSet::from_ports("h1", [Port::plaintext(7000), Port::plaintext(7001)]).unwrap_err();
        assert!(matches!(err, ClusterMapError::MalformedLayout { .. }));
    }

    #[test]
    fn test_plaintext_when_datacenter_not_ssl_enabled() {
        let ports = PortSet::new("h1", 7000, Some(7443)).unwrap();
        let ssl = SslEnabledDatacenters::new(["dc2"]);

        let port = ports.connect_port(&key(), "dc1", &ssl).unwrap();
        assert_eq!(port, Port::plaintext(7000));
    }

    #[test]
    fn test_ssl_when_datacenter_ssl_enabled() {
        let ports = PortSet::new("h1", 7000, Some(7443)).unwrap();
        let ssl = SslEnabledDatacenters::new(["dc1"]);

        let port = ports.connect_port(&key(), "dc1", &ssl).unwrap();
        assert_eq!(port, Port::ssl(7443));
    }

    #[test]
    fn test_no_plaintext_fallback_without_ssl_port() {
        let ports = PortSet::new("h1", 7000, None).unwrap();
        let ssl = SslEnabledDatacenters::new(["dc1"]);

        let err = ports.connect_port(&key(), "dc1", &ssl).unwrap_err();
        assert!(matches!(err, ClusterMapError::UnavailableEndpoint { .. }));
    }

    #[test]
    fn test_ssl_set_replace() {
        let ssl = SslEnabledDatacenters::default();
        assert!(!ssl.contains("dc1"));

        ssl.replace(["dc2", " dc1 ", "dc2"]);
        assert!(ssl.contains("dc1"));
        assert_eq!(ssl.to_vec(), vec!["dc1", "dc2"]);
    }

    #[test]
    fn test_port_set_to_vec() {
        let ports = PortSet::new("h1", 7000, Some(7443)).unwrap();
        assert_eq!(ports.to_vec(), vec![Port::plaintext(7000), Port::ssl(7443)]);
        assert_eq!(Port::ssl(7443).to_string(), "7443(SSL)");
    }
}
