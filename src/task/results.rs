#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Extracts `key:value` lines from task output. Lines with no colon, more than one colon or an
/// empty key are ignored; a repeated key keeps its last value.
#[must_use]
pub fn parse_logs(logs: &str) -> BTreeMap<String, String> {
    let mut results = BTreeMap::new();
    for line in logs.lines() {
        let mut parts = line.split(':');
        if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next())
            && !key.trim().is_empty()
        {
            results.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_lines_become_results() {
        let r = parse_logs("k1:v1\n k2 : v2 \nnoise\n");
        assert_eq!(r.len(), 2);
        assert_eq!(r["k1"], "v1");
        assert_eq!(r["k2"], "v2");
    }

    #[test]
    fn extra_colons_and_repeats() {
        let r = parse_logs("url: http://x\nacc:0.1\nacc:0.45\r\n");
        assert!(!r.contains_key("url"));
        assert_eq!(r["acc"], "0.45");
        assert!(parse_logs("").is_empty());
        assert!(parse_logs(":v\n  : w\n").is_empty());
    }
}
