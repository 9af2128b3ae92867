//! Security headers for HTTP responses

/// Content Security Policy for JSON endpoints
const API_CSP: &str = "default-src 'none'; frame-ancestors 'none';";

/// Wrap a JSON reply with strict headers: no framing, no sniffing, no caching
pub fn with_api_security_headers<T: warp::Reply>(reply: T) -> impl warp::Reply {
    let reply = warp::reply::with_header(reply, "X-Frame-Options", "DENY");
    let reply = warp::reply::with_header(reply, "X-Content-Type-Options", "nosniff");
    let reply = warp::reply::with_header(reply, "Referrer-Policy", "no-referrer");
    let reply = warp::reply::with_header(reply, "Content-Security-Policy", API_CSP);
    warp::reply::with_header(reply, "Cache-Control", "no-cache, no-store, must-revalidate")
}
