//! URL helpers for the backend client and model download.

use url::Url;

use crate::CoreError;

/// Percent-encode a query value. `A-Za-z0-9-_.~` pass through unchanged;
/// everything else (including space and `!`) is escaped.
pub fn url_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Resolve a redirect `Location` against the URL that produced it.
/// Absolute locations pass through unchanged; `/rooted` and relative paths
/// follow RFC 3986 resolution.
pub fn resolve_redirect(base_url: &str, location: &str) -> Result<String, CoreError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let base = Url::parse(base_url)?;
    let resolved = base.join(location)?;
    Ok(resolved.to_string())
}

/// Derive the WebSocket endpoint from the backend base URL.
pub fn websocket_base(backend_url: &str) -> String {
    if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{backend_url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_preserves_unreserved() {
        assert_eq!(url_encode("AZaz09-_.~"), "AZaz09-_.~");
        assert_eq!(url_encode("hello world!"), "hello%20world%21");
    }

    #[test]
    fn redirect_resolution() {
        assert_eq!(
            resolve_redirect("https://h/p/f", "/x").unwrap(),
            "https://h/x"
        );
        assert_eq!(
            resolve_redirect("https://h/p/f", "y").unwrap(),
            "https://h/p/y"
        );
        assert_eq!(
            resolve_redirect("https://h/p/f", "https://host/x").unwrap(),
            "https://host/x"
        );
    }

    #[test]
    fn websocket_scheme_replacement() {
        assert_eq!(websocket_base("https://backend"), "wss://backend");
        assert_eq!(websocket_base("http://backend:8000"), "ws://backend:8000");
        assert_eq!(websocket_base("backend"), "ws://backend");
    }
}
