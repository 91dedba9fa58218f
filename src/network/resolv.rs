use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
};

pub const MACOS_MAX_SEARCH_DOMAINS: usize = 6;
pub const MACOS_MAX_SEARCH_CHARS: usize = 256;

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// The parts of a `resolv.conf` the guest network cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl ResolverConfig {
    pub fn parse(contents: &str) -> Self {
        let mut config = ResolverConfig::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    if let Some(Ok(addr)) = words.next().map(str::parse::<IpAddr>) {
                        config.nameservers.push(addr);
                    }
                }
                // the last search or domain line wins
                Some("search") => config.search = words.map(str::to_owned).collect(),
                Some("domain") => config.search = words.take(1).map(str::to_owned).collect(),
                _ => {}
            }
        }

        config
    }

    pub async fn load(path: &Path) -> Result<Self, std::io::Error> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse(&contents))
    }

    /// Read the host's resolver configuration, falling back to an empty one.
    pub async fn from_host() -> Self {
        match Self::load(Path::new(HOST_RESOLV_CONF)).await {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!(error = %err, "no host resolver configuration, serving local zones only");
                Self::default()
            }
        }
    }

    /// The first nameserver, on the DNS port.
    pub fn upstream(&self) -> Option<SocketAddr> {
        self.nameservers.first().map(|addr| SocketAddr::new(*addr, 53))
    }
}

/// Keep at most `max_domains` search domains whose space-joined form fits in `max_chars`. An oversize list is cut
/// at the last space inside the limit, so no partial domain survives.
pub fn clamp_search_domains(domains: &[String], max_domains: usize, max_chars: usize) -> Vec<String> {
    let joined = domains
        .iter()
        .take(max_domains)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    if joined.len() <= max_chars {
        return joined.split_whitespace().map(str::to_owned).collect();
    }

    let cut = joined
        .match_indices(' ')
        .map(|(index, _)| index)
        .take_while(|index| *index <= max_chars)
        .last()
        .unwrap_or(0);
    joined[..cut].split_whitespace().map(str::to_owned).collect()
}
