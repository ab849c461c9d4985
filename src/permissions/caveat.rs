//! Caveats narrow a granted capability.
//!
//! Each kind is a pure predicate over the invocation context. For host-initiated
//! requests a caveat only constrains a request whose context carries its dimension; a
//! request without an origin is not rejected by an `allowed_origins` caveat, for example.
//! Host calls made by plugin code are strict: their params are untrusted, so a host,
//! path or coin type that is missing or malformed fails the caveat constraining it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Caveat {
    /// Origins allowed to reach the handler
    AllowedOrigins(Vec<String>),
    /// Method names allowed on the capability
    AllowedMethods(Vec<String>),
    /// Hosts reachable through the capability; `*.example.com` matches subdomains
    AllowedHosts(Vec<String>),
    /// Derivation path prefixes, as path segments (`["m", "44'", "60'"]`)
    AllowedDerivationPaths(Vec<Vec<String>>),
    AllowedCoinTypes(Vec<u32>),
    /// Upper bound on the request time in milliseconds
    MaxRequestTime(u64),
}

/// The parts of a request a caveat can look at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatContext {
    pub origin: Option<String>,
    pub method: Option<String>,
    pub host: Option<String>,
    pub derivation_path: Option<Vec<String>>,
    pub coin_type: Option<u32>,
    /// A caveat on a dimension this context lacks rejects the request
    #[serde(default)]
    pub strict: bool,
}

impl CaveatContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Context for a call made by plugin code into the host. Recognises the `host`,
    /// `url`, `path` and `coinType` fields of object params; anything of the wrong shape
    /// is left unset, which a strict context treats as a failed caveat.
    pub fn for_host_call(method: &str, params: &Value) -> Self {
        let mut ctx = Self::new().with_method(method);
        ctx.strict = true;
        ctx.host = host_param(params);
        ctx.derivation_path = params.get("path").and_then(Value::as_array).and_then(|segments| {
            segments
                .iter()
                .map(|segment| segment.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        });
        ctx.coin_type = params
            .get("coinType")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        ctx
    }
}

/// Host named by `host`, or by the authority of `url`. Both present and disagreeing
/// yields nothing.
fn host_param(params: &Value) -> Option<String> {
    let explicit = match params.get("host") {
        None => None,
        Some(value) => Some(value.as_str()?.to_ascii_lowercase()),
    };
    let from_url = match params.get("url") {
        None => None,
        Some(value) => Some(url_host(value.as_str()?)?),
    };
    match (explicit, from_url) {
        (Some(a), Some(b)) if a != b => None,
        (Some(host), _) | (None, Some(host)) => Some(host),
        (None, None) => None,
    }
}

fn url_host(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(|c| matches!(c, '/' | '?' | '#')).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    };
    if host.is_empty() || host.contains(|c: char| c == '[' || c == ']' || c.is_whitespace()) {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

impl Caveat {
    pub fn name(&self) -> &'static str {
        match self {
            Caveat::AllowedOrigins(_) => "allowed_origins",
            Caveat::AllowedMethods(_) => "allowed_methods",
            Caveat::AllowedHosts(_) => "allowed_hosts",
            Caveat::AllowedDerivationPaths(_) => "allowed_derivation_paths",
            Caveat::AllowedCoinTypes(_) => "allowed_coin_types",
            Caveat::MaxRequestTime(_) => "max_request_time",
        }
    }

    /// Evaluate the predicate against one request
    pub fn permits(&self, ctx: &CaveatContext) -> bool {
        match self {
            Caveat::AllowedOrigins(origins) => ctx
                .origin
                .as_ref()
                .map_or(true, |origin| origins.iter().any(|o| o == origin)),
            Caveat::AllowedMethods(methods) => ctx
                .method
                .as_ref()
                .map_or(true, |method| methods.iter().any(|m| m == method)),
            Caveat::AllowedHosts(hosts) => ctx.host.as_ref().map_or(!ctx.strict, |host| {
                hosts.iter().any(|pattern| host_matches(pattern, host))
            }),
            Caveat::AllowedDerivationPaths(paths) => ctx.derivation_path.as_ref().map_or(!ctx.strict, |path| {
                paths.iter().any(|prefix| path.starts_with(prefix))
            }),
            Caveat::AllowedCoinTypes(coin_types) => ctx
                .coin_type
                .map_or(!ctx.strict, |coin_type| coin_types.contains(&coin_type)),
            Caveat::MaxRequestTime(_) => true,
        }
    }

    pub fn max_request_time(&self) -> Option<Duration> {
        match self {
            Caveat::MaxRequestTime(ms) => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Reject caveats that could never be satisfied or carry nonsense bounds
    pub fn validate(&self) -> Result<(), String> {
        let empty = match self {
            Caveat::AllowedOrigins(v) | Caveat::AllowedMethods(v) | Caveat::AllowedHosts(v) => {
                v.is_empty()
            }
            Caveat::AllowedDerivationPaths(paths) => {
                paths.is_empty() || paths.iter().any(|p| p.is_empty())
            }
            Caveat::AllowedCoinTypes(v) => v.is_empty(),
            Caveat::MaxRequestTime(ms) => {
                if *ms == 0 {
                    return Err("max_request_time must be greater than zero".to_string());
                }
                false
            }
        };

        if empty {
            Err(format!("{} caveat has no values", self.name()))
        } else {
            Ok(())
        }
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .map_or(false, |rest| rest.ends_with('.') && rest.len() > 1),
        None => host == pattern,
    }
}
