//! Origin model used for same-origin classification.

use url::Url;

/// A web origin (scheme + host + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    /// An opaque origin (unique, cannot match anything).
    Opaque,
}

impl Origin {
    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        match url.scheme() {
            "data" | "file" | "javascript" | "blob" => Origin::Opaque,
            scheme => Origin::Tuple {
                scheme: scheme.to_string(),
                host: url.host_str().unwrap_or("").to_ascii_lowercase(),
                port: url.port_or_known_default(),
            },
        }
    }

    /// Check if two origins are the same.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1 == h2 && p1 == p2,
            // Opaque origins are never same-origin, not even with themselves
            _ => false,
        }
    }
}
