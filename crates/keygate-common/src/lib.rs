mod settings;

pub use settings::{ProxySettings, ProxySettingsPatch, SettingsError};

/// Ordered header list used on the upstream side of the proxy.
///
/// Kept as a plain vector so duplicate header names and the original order
/// survive the round trip to the upstream.
pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let value = value.into();
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(name) {
            *v = value;
            return;
        }
    }
    headers.push((name.to_string(), value));
}

pub fn header_remove(headers: &mut Headers, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn header_remove_drops_all_occurrences() {
        let mut headers: Headers = vec![
            ("x-test".to_string(), "a".to_string()),
            ("X-Test".to_string(), "b".to_string()),
        ];
        header_remove(&mut headers, "x-test");
        assert!(headers.is_empty());
    }
}
