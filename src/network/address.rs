use crate::{AppError, AppResult};

/// Network family a textual address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

/// Parses a listen/dial address.
///
/// Bare `host:port` strings imply IPv4 TCP. URL forms select the network
/// explicitly: `tcp://host:port`, `tcp4://…`, `tcp6://…` and
/// `unix:///path/to.sock` (scheme matching is case-insensitive).
pub fn parse_address(address: &str) -> AppResult<(Network, String)> {
    let Some((scheme, rest)) = address.split_once("://") else {
        return Ok((Network::Tcp4, address.to_string()));
    };

    let network = match scheme.to_ascii_lowercase().as_str() {
        "tcp" => Network::Tcp,
        "tcp4" => Network::Tcp4,
        "tcp6" => Network::Tcp6,
        "unix" => {
            // the path starts at the first slash past the authority
            return match rest.find('/') {
                Some(idx) => Ok((Network::Unix, rest[idx..].to_string())),
                None => Err(AppError::InvalidAddress(address.to_string())),
            };
        }
        _ => return Err(AppError::InvalidAddress(address.to_string())),
    };

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(AppError::InvalidAddress(address.to_string()));
    }
    Ok((network, authority.to_string()))
}
