//! Reading the caller's API key and address from a request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::ConnectInfo;
use config::IdentityConfig;
use http::Request;
use rate_limit::{normalize_ip, parse_forwarded};

/// The presented API key: the query parameter first, then the configured headers in order.
pub(crate) fn api_key<B>(req: &Request<B>, config: &IdentityConfig) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == config.query_param.as_str())
            .map(|(_, value)| value.into_owned())
    });

    if let Some(key) = from_query.filter(|key| !key.is_empty()) {
        return Some(key);
    }

    config.key_headers.iter().find_map(|name| {
        req.headers()
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

/// The client address: the configured proxy headers in order, then the transport peer.
pub(crate) fn client_ip<B>(req: &Request<B>, config: &IdentityConfig) -> IpAddr {
    let from_headers = config.ip_headers.iter().find_map(|name| {
        let value = req.headers().get(name.as_str())?.to_str().ok()?;
        parse_forwarded(value)
    });

    if let Some(ip) = from_headers {
        return ip;
    }

    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => normalize_ip(addr.ip()),
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IdentityConfig {
        IdentityConfig::default()
    }

    #[test]
    fn query_parameter_wins() {
        let req = Request::builder()
            .uri("/v1/blocks?limit=5&apikey=from-query")
            .header("apikey", "from-header")
            .header("x-api-key", "from-x-header")
            .body(())
            .unwrap();

        assert_eq!(api_key(&req, &config()).as_deref(), Some("from-query"));
    }

    #[test]
    fn apikey_header_before_x_api_key() {
        let req = Request::builder()
            .uri("/v1/blocks")
            .header("x-api-key", "from-x-header")
            .header("apikey", "from-header")
            .body(())
            .unwrap();

        assert_eq!(api_key(&req, &config()).as_deref(), Some("from-header"));

        let req = Request::builder()
            .uri("/v1/blocks?apikey=")
            .header("x-api-key", "from-x-header")
            .body(())
            .unwrap();

        assert_eq!(api_key(&req, &config()).as_deref(), Some("from-x-header"));
    }

    #[test]
    fn query_value_is_decoded() {
        let req = Request::builder().uri("/x?apikey=a%2Bb").body(()).unwrap();

        assert_eq!(api_key(&req, &config()).as_deref(), Some("a+b"));
    }

    #[test]
    fn no_key() {
        let req = Request::builder().uri("/x").body(()).unwrap();

        assert_eq!(api_key(&req, &config()), None);
    }

    #[test]
    fn real_ip_before_forwarded_for() {
        let req = Request::builder()
            .header("x-forwarded-for", "1.1.1.1, 2.2.2.2")
            .header("x-real-ip", "3.3.3.3")
            .body(())
            .unwrap();

        assert_eq!(client_ip(&req, &config()), "3.3.3.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn last_forwarded_for_entry() {
        let req = Request::builder()
            .header("x-forwarded-for", "1.1.1.1, 2.2.2.2")
            .body(())
            .unwrap();

        assert_eq!(client_ip(&req, &config()), "2.2.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn peer_address_is_normalized() {
        let mut req = Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("[::1]:4000".parse::<SocketAddr>().unwrap()));

        assert_eq!(client_ip(&req, &config()), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn invalid_header_falls_through() {
        let mut req = Request::builder().header("x-real-ip", "nonsense").body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("10.9.8.7:4000".parse::<SocketAddr>().unwrap()));

        assert_eq!(client_ip(&req, &config()), "10.9.8.7".parse::<IpAddr>().unwrap());
    }
}
