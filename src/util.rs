use crate::client::Protocol;

/// `{scheme}://[{org}.]{domain}{path}/{api}`
pub(crate) fn service_url(
    protocol: Protocol,
    organization: Option<&str>,
    domain: &str,
    path: &str,
    api: &str,
) -> String {
    let domain = domain.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    let api = api.trim_start_matches('/');
    match organization {
        Some(org) => format!("{}://{}.{}{}/{}", protocol.scheme(), org, domain, path, api),
        None => format!("{}://{}{}/{}", protocol.scheme(), domain, path, api),
    }
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Parses `v4.0.2`, `4.0.2-7-gabc` and similar into `(major, minor, patch)`.
pub(crate) fn parse_version(v: &str) -> Option<(u32, u32, u32)> {
    let v = v.trim().trim_start_matches(['v', 'V']);
    let mut parts = v.split('.').map(|p| {
        let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok()
    });
    let major = parts.next()??;
    let minor = parts.next()??;
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// Media type without parameters, lowercased (`text/plain; charset=utf-8` -> `text/plain`).
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
