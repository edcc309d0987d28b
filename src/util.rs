use http::{Method, Request, Version};

/// String representation of HTTP method
pub fn http_method(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        Method::CONNECT => "CONNECT",
        Method::PATCH => "PATCH",
        Method::TRACE => "TRACE",
        _ => "_OTHER",
    }
}

/// String representation of network protocol version
pub fn http_version(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

/// Get the url scheme of the incoming request, as seen by the client.
///
/// Behind a proxy or a load balancer the scheme of the original
/// request survives only in the `X-Forwarded-Proto` or `Forwarded`
/// headers.
pub fn http_url_scheme<B>(req: &Request<B>) -> Option<&'static str> {
    let x_forwarded_proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| match v.to_str() {
            Ok(value) if value.eq_ignore_ascii_case("http") => Some("http"),
            Ok(value) if value.eq_ignore_ascii_case("https") => Some("https"),
            _ => None,
        });
    if let Some(x_forwarded_proto) = x_forwarded_proto {
        return Some(x_forwarded_proto);
    }

    req.headers()
        .get("forwarded")
        .and_then(|v| extract_proto_from_forwarded_header(v.as_bytes()))
}

fn extract_proto_from_forwarded_header(header_value: &[u8]) -> Option<&'static str> {
    for value_per_proxy in header_value.split(|c| *c == b',') {
        for directive in value_per_proxy.split(|c| *c == b';') {
            let directive = directive.trim_ascii().to_ascii_lowercase();

            if let Some(proto) = directive.strip_prefix(b"proto=") {
                return match proto {
                    b"http" => Some("http"),
                    b"https" => Some("https"),
                    _ => None,
                };
            }
        }
    }
    None
}

cfg_if::cfg_if! {
    if #[cfg(feature = "axum")] {
        pub fn http_route<B>(req: &http::Request<B>) -> Option<&str> {
            use axum::extract::MatchedPath;
            req.extensions().get::<MatchedPath>().map(|matched_path| matched_path.as_str())
        }
    } else {
        pub fn http_route<B>(_req: &http::Request<B>) -> Option<&str> {
            None
        }
    }
}
