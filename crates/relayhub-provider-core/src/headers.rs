pub type Headers = Vec<(String, String)>;

/// Connection-scoped headers that must not be copied between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(&name))
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let idx = headers
        .iter()
        .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Copies `headers` without hop-by-hop entries.
pub fn end_to_end(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let mut headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
        assert_eq!(
            header_remove(&mut headers, "content-type").as_deref(),
            Some("application/json")
        );
        assert!(headers.is_empty());
    }

    #[test]
    fn end_to_end_drops_connection_headers() {
        let headers = vec![
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("x-upstream".to_string(), "1".to_string()),
            ("Connection".to_string(), "close".to_string()),
        ];
        assert_eq!(
            end_to_end(&headers),
            vec![("x-upstream".to_string(), "1".to_string())]
        );
    }
}
