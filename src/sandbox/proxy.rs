use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use url::Url;

/// A validated forward-proxy URL (`http://host:port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl(Url);

impl ProxyUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).map_err(|e| anyhow!("Invalid proxy URL '{}': {}", raw, e))?;
        match url.scheme() {
            "http" | "https" | "socks5" | "socks5h" => {}
            other => bail!("Unsupported proxy scheme '{}' in '{}'", other, raw),
        }
        if url.host_str().is_none_or(str::is_empty) {
            bail!("Proxy URL '{}' has no host", raw);
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        // Url always renders a trailing slash for an empty path; env consumers
        // expect the bare origin.
        self.0.as_str().trim_end_matches('/')
    }

    /// `host:port` form used by `netsh` and the WinINet registry value.
    pub fn host_port(&self) -> String {
        let host = self.0.host_str().unwrap_or_default();
        match self.0.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.0.port_or_known_default()
    }
}

impl FromStr for ProxyUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for ProxyUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_proxy() {
        let proxy = ProxyUrl::parse("http://10.1.8.5:23128").unwrap();
        assert_eq!(proxy.as_str(), "http://10.1.8.5:23128");
        assert_eq!(proxy.host_port(), "10.1.8.5:23128");
        assert_eq!(proxy.host(), "10.1.8.5");
        assert_eq!(proxy.port(), Some(23128));
    }

    #[test]
    fn test_default_port_filled_in() {
        let proxy = ProxyUrl::parse("http://proxy.internal").unwrap();
        assert_eq!(proxy.host_port(), "proxy.internal:80");
    }

    #[test]
    fn test_rejects_bad_scheme_and_garbage() {
        assert!(ProxyUrl::parse("ftp://proxy:21").is_err());
        assert!(ProxyUrl::parse("not a url").is_err());
        assert!(ProxyUrl::parse("").is_err());
    }
}
