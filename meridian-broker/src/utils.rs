/// Join path segments into an absolute coordination path, ignoring stray slashes.
pub(crate) fn join_path(parts: &[&str]) -> String {
    let mut path = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(trimmed);
    }
    path
}

/// WAN locator of a broker port as understood by the data plane.
pub(crate) fn wan_locator(host: &str, port: u16) -> String {
    format!("tcpv4_wan://{}:{}", host, port)
}

/// Peer scope of an edge broker's domain route.
pub(crate) fn edge_scope(addr: &str) -> String {
    format!("EdgeBrokerDomainRoute@{}", addr)
}

/// Peer scope of a routing broker's domain route.
pub(crate) fn routing_scope(addr: &str) -> String {
    format!("RoutingBrokerDomainRoute@{}", addr)
}
