// src/platform.rs

use std::time::Duration;

/// Best-effort hosting-platform probe for a site domain. One request, one
/// header sniff; anything unclear is "unknown". Real detection heuristics
/// live outside this service.
pub async fn detect_platform(domain: &str) -> String {
    let url = format!("https://{domain}/");
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(_) => return "unknown".to_string(),
    };

    let resp = match client.get(&url).send().await {
        Ok(r) => r,
        Err(_) => return "unknown".to_string(),
    };

    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase()
    };

    if resp.headers().contains_key("x-shopify-stage") {
        return "shopify".to_string();
    }
    if header("x-powered-by").contains("wordpress") || header("link").contains("/wp-json/") {
        return "wordpress".to_string();
    }
    if header("x-powered-by").contains("wix") {
        return "wix".to_string();
    }

    "unknown".to_string()
}
