use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::env;

/// Security header values
const NOSNIFF: &str = "nosniff";
const DENY: &str = "DENY";
const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";
const CSP_API_VALUE: &str = "default-src 'none'; frame-ancestors 'none'";
const REFERRER_POLICY_VALUE: &str = "strict-origin-when-cross-origin";

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static(NOSNIFF));
    headers.insert("X-Frame-Options", HeaderValue::from_static(DENY));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(CSP_API_VALUE),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static(REFERRER_POLICY_VALUE),
    );

    // HSTS only makes sense behind HTTPS, so it is opt-in via the environment
    if hsts_enabled() {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static(HSTS_VALUE),
        );
    }

    response
}

fn hsts_enabled() -> bool {
    env::var("RUST_ENV")
        .map(|v| v.to_lowercase() == "production")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hsts_disabled_outside_production() {
        std::env::remove_var("RUST_ENV");
        assert!(!hsts_enabled());
    }

    #[test]
    fn test_header_values_parse() {
        for value in [NOSNIFF, DENY, HSTS_VALUE, CSP_API_VALUE, REFERRER_POLICY_VALUE] {
            assert!(value.parse::<HeaderValue>().is_ok());
        }
    }
}
