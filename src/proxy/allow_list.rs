//! Hostname allow-list.
//!
//! Built once from configuration and only read afterwards, so it is shared
//! between connection tasks without synchronization.

use url::Url;

/// Permitted upstream hostnames.
///
/// Matching is exact on the hostname only: scheme, port and path of the
/// target are not compared, so every port of an allowed host is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    hosts: Vec<String>,
}

impl AllowList {
    /// Builds the list, lower-casing entries and dropping blanks and
    /// duplicates. Configuration order is kept for error reports.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for host in hosts {
            let host = normalize(host.as_ref());
            if !host.is_empty() && !normalized.contains(&host) {
                normalized.push(host);
            }
        }
        Self { hosts: normalized }
    }

    /// True if `host` is on the list, ignoring ASCII case.
    pub fn contains(&self, host: &str) -> bool {
        let host = normalize(host);
        self.hosts.iter().any(|h| *h == host)
    }

    /// True if the hostname of `url` is on the list.
    pub fn permits(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.contains(host))
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
