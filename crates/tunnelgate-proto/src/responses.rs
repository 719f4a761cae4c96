//! Canned HTTP responses synthesized by the relay and the agent
//!
//! Every response carries `Content-Length` and `Connection: close` so it is
//! correctly framed whether it travels to a public client or over the relay
//! connection.

/// Build a complete HTTP/1.1 response
pub fn simple_response(status: u16, reason: &str, content_type: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    )
    .into_bytes()
}

fn html_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    simple_response(status, reason, "text/html; charset=utf-8", body)
}

fn text_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    simple_response(status, reason, "text/plain; charset=utf-8", body)
}

/// Static page served for requests without a tunnel identifier
pub fn help_page() -> Vec<u8> {
    html_response(
        200,
        "OK",
        "<h1>Tunnel Server</h1>\
         <p>Append your tunnel ID to the URL: http://&lt;server&gt;/&lt;tunnel-id&gt;/</p>",
    )
}

/// No live registration for the requested identifier
pub fn tunnel_not_connected(tunnel_id: &str) -> Vec<u8> {
    html_response(
        502,
        "Bad Gateway",
        &format!(
            "<h1>502 Bad Gateway</h1><p>Tunnel '{}' not connected</p>",
            escape_html(tunnel_id)
        ),
    )
}

/// The relay connection failed while forwarding
pub fn tunnel_failed(tunnel_id: &str) -> Vec<u8> {
    html_response(
        502,
        "Bad Gateway",
        &format!(
            "<h1>502 Bad Gateway</h1><p>Tunnel '{}' stopped responding</p>",
            escape_html(tunnel_id)
        ),
    )
}

/// The tunnel did not answer within the relay timeout
pub fn tunnel_timeout(tunnel_id: &str) -> Vec<u8> {
    html_response(
        504,
        "Gateway Timeout",
        &format!(
            "<h1>504 Gateway Timeout</h1><p>Tunnel '{}' did not respond in time</p>",
            escape_html(tunnel_id)
        ),
    )
}

/// Sent back over the relay connection when the private service cannot be reached
pub fn local_service_unreachable(local_addr: &str) -> Vec<u8> {
    html_response(
        502,
        "Bad Gateway",
        &format!(
            "<h1>502 Bad Gateway</h1><p>Cannot connect to local service at {}</p>",
            escape_html(local_addr)
        ),
    )
}

pub fn bad_request(reason: &str) -> Vec<u8> {
    text_response(400, "Bad Request", &format!("Bad request: {}\n", reason))
}

pub fn request_timeout() -> Vec<u8> {
    text_response(408, "Request Timeout", "Request not received in time\n")
}

pub fn length_required() -> Vec<u8> {
    text_response(
        411,
        "Length Required",
        "Chunked request bodies are not supported; send Content-Length\n",
    )
}

pub fn payload_too_large(limit: usize) -> Vec<u8> {
    text_response(
        413,
        "Payload Too Large",
        &format!("Request body exceeds {} bytes\n", limit),
    )
}

pub fn headers_too_large() -> Vec<u8> {
    text_response(
        431,
        "Request Header Fields Too Large",
        "Request headers too large\n",
    )
}

/// Escape text for inclusion in an HTML body
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
