use axum::http::{header, HeaderMap};
use std::collections::HashMap;

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

impl Challenge {
    /// Parse a single header value such as
    /// `Bearer realm="https://auth.example.com/token",service="registry"`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
        let mut params = parse_params(rest);

        if scheme.eq_ignore_ascii_case("bearer") {
            Some(Challenge::Bearer {
                realm: params.remove("realm")?,
                service: params.remove("service"),
                scope: params.remove("scope"),
            })
        } else if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic {
                realm: params.remove("realm"),
            })
        } else {
            None
        }
    }

    /// First usable challenge among the response's `WWW-Authenticate` headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(Self::parse)
    }
}

/// Split `key="value",key2=value2` honouring commas inside quotes
/// (scopes such as `repository:a:pull,push` contain them).
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or_default();
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim();
            rest = &rest[end..];
            value
        };

        if !key.is_empty() {
            params.insert(key, value.to_string());
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:docker-hub/library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some("repository:docker-hub/library/alpine:pull".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_scope_with_commas() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.com/token", scope="repository:team/app:pull,push""#,
        )
        .unwrap();
        match challenge {
            Challenge::Bearer { scope, service, .. } => {
                assert_eq!(scope.as_deref(), Some("repository:team/app:pull,push"));
                assert_eq!(service, None);
            }
            other => panic!("expected bearer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_basic_challenge() {
        assert_eq!(
            Challenge::parse(r#"Basic realm="Registry Realm""#),
            Some(Challenge::Basic {
                realm: Some("Registry Realm".to_string())
            })
        );
        assert_eq!(
            Challenge::parse("basic"),
            Some(Challenge::Basic { realm: None })
        );
    }

    #[test]
    fn test_parse_rejects_unusable_challenges() {
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
        assert_eq!(Challenge::parse(r#"Negotiate abc"#), None);
    }

    #[test]
    fn test_from_headers_skips_unknown_schemes() {
        let mut headers = HeaderMap::new();
        headers.append(header::WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        headers.append(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer realm="https://auth.example.com/token""#),
        );
        assert!(matches!(
            Challenge::from_headers(&headers),
            Some(Challenge::Bearer { .. })
        ));
    }
}
