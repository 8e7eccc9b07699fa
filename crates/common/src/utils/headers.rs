use http::{HeaderMap, HeaderName, HeaderValue};

use crate::protocol::Headers;

/// Convert typed HTTP headers into the wire mapping.
///
/// Multi-valued headers become multiple list entries; values that are not
/// valid UTF-8 are skipped rather than mangled.
pub fn headers_to_wire(headers: &HeaderMap) -> Headers {
    let mut wire = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    wire
}

/// Convert the wire mapping back into typed HTTP headers.
///
/// Entries with invalid names or values are skipped; a frame from a
/// misbehaving peer must not take the whole exchange down.
pub fn wire_to_headers(wire: &Headers) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in wire {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}
