//! Endpoint normalization
//!
//! Accepts the locator form `<scheme>/<host>:<port>` and turns it into a
//! WebSocket URL. Anything that is not of that two-part form is assumed to
//! already be a URL and is passed through untouched.

use crate::error::SessionError;

const SCHEMES: [&str; 2] = ["ws", "wss"];

/// Normalize an endpoint descriptor into a connectable URL.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, SessionError> {
    let parts: Vec<&str> = endpoint.split('/').collect();
    match parts.as_slice() {
        [scheme, address] => {
            if !SCHEMES.contains(scheme) {
                return Err(SessionError::InvalidEndpoint(format!(
                    "unsupported scheme '{}' in '{}', expected ws or wss",
                    scheme, endpoint
                )));
            }
            if address.is_empty() {
                return Err(SessionError::InvalidEndpoint(format!(
                    "missing address in '{}'",
                    endpoint
                )));
            }
            Ok(format!("{}://{}", scheme, address))
        }
        _ => Ok(endpoint.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_form() {
        assert_eq!(
            normalize_endpoint("ws/127.0.0.1:10000").unwrap(),
            "ws://127.0.0.1:10000"
        );
        assert_eq!(
            normalize_endpoint("wss/broker.example.com:443").unwrap(),
            "wss://broker.example.com:443"
        );
    }

    #[test]
    fn test_url_passes_through() {
        assert_eq!(
            normalize_endpoint("ws://localhost:10000").unwrap(),
            "ws://localhost:10000"
        );
        assert_eq!(
            normalize_endpoint("wss://example.com/remote").unwrap(),
            "wss://example.com/remote"
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(matches!(
            normalize_endpoint("tcp/127.0.0.1:7447"),
            Err(SessionError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            normalize_endpoint("ws/"),
            Err(SessionError::InvalidEndpoint(_))
        ));
    }
}
