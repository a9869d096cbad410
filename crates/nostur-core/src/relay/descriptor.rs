use serde::{Deserialize, Deserializer, Serialize};

/// Normalize a relay URL so lookups ignore case in the scheme and host.
/// Path, query and fragment are kept as given.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_lowercase();
    };
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    format!("{}://{}{}", scheme.to_lowercase(), host.to_lowercase(), tail)
}

fn deserialize_url<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let url = String::deserialize(deserializer)?;
    Ok(normalize_url(&url))
}

fn default_true() -> bool {
    true
}

/// Persisted relay settings. `url` is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayDescriptor {
    #[serde(deserialize_with = "deserialize_url")]
    pub url: String,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    #[serde(default)]
    pub search: bool,
}

impl RelayDescriptor {
    /// Read/write relay
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            read: true,
            write: true,
            search: false,
        }
    }

    pub fn read_only(url: &str) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn write_only(url: &str) -> Self {
        Self {
            read: false,
            ..Self::new(url)
        }
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }
}
