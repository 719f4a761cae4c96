//! Public path handling
//!
//! Public URLs have the shape `/<tunnel-id>/<rest>`. The first segment picks the
//! tunnel and is stripped before the request reaches the private service.

/// A request target split into tunnel identifier and forwarded path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPath<'a> {
    /// Raw first path segment (not yet validated as a [`crate::TunnelId`])
    pub tunnel_id: &'a str,
    /// Path forwarded to the private service, always starting with `/`
    pub forwarded: String,
}

/// Split a request target into tunnel identifier and remaining path.
///
/// Returns `None` when the target carries no identifier: `/`, `/?query`,
/// `*`, or anything that is not origin-form.
pub fn split_tunnel_path(target: &str) -> Option<TunnelPath<'_>> {
    let without_slash = target.strip_prefix('/')?;
    let end = without_slash
        .find(|c: char| c == '/' || c == '?')
        .unwrap_or(without_slash.len());
    let (tunnel_id, rest) = without_slash.split_at(end);

    if tunnel_id.is_empty() {
        return None;
    }

    let forwarded = if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('?') {
        format!("/{}", rest)
    } else {
        rest.to_string()
    };

    Some(TunnelPath {
        tunnel_id,
        forwarded,
    })
}

/// Replace the request target on the request line, leaving everything after
/// the first CRLF (headers and body) byte-for-byte unchanged.
///
/// Returns `None` if the request line cannot be located.
pub fn rewrite_request_target(request: &[u8], new_target: &str) -> Option<Vec<u8>> {
    let line_end = request.windows(2).position(|w| w == b"\r\n")?;
    let line = &request[..line_end];

    let first_space = line.iter().position(|b| *b == b' ')?;
    let second_space = first_space
        + 1
        + line[first_space + 1..].iter().position(|b| *b == b' ')?;

    let mut rewritten = Vec::with_capacity(request.len() + new_target.len());
    rewritten.extend_from_slice(&line[..=first_space]);
    rewritten.extend_from_slice(new_target.as_bytes());
    rewritten.extend_from_slice(&request[second_space..]);
    Some(rewritten)
}
