//! # Authentication
//!
//! Header construction for the four supported schemes, with a Redis-backed
//! encrypted token cache for the OAuth2 variants so a whole fleet shares
//! one refresh.
//!
//! ## Schemes
//!
//! ```text
//! ┌──────────────────────────┬─────────────────────────────────────────┐
//! │ Scheme                   │ Header value                            │
//! ├──────────────────────────┼─────────────────────────────────────────┤
//! │ basic                    │ Basic base64(user:pass)                 │
//! │ token                    │ Bearer <token> (optionally base64)      │
//! │ oauth2ClientCredentials  │ Bearer <cached or refreshed token>      │
//! │ oauth2GrantType          │ Bearer <cached or refreshed token>      │
//! └──────────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! ## Token Cache
//!
//! Cached tokens live in the hash `<prefix>requestHandler:<client>:oauth2`
//! with the sensitive fields encrypted by [`crate::crypto::TokenCipher`]:
//!
//! - `accessToken` - encrypted
//! - `expiresAt` - plaintext milliseconds since epoch
//! - `refreshToken` - encrypted, when the grant returned one
//!
//! A token within five minutes of expiry is treated as expired and
//! refreshed eagerly, so in-flight requests never straddle the boundary.

use crate::crypto::TokenCipher;
use crate::error::{CourierError, Result};
use crate::record::now_ms;
use crate::redis::RedisTransport;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Refresh this long before nominal expiry.
pub const EXPIRY_MARGIN_MS: u64 = 5 * 60 * 1000;

/// Where the OAuth2 refresh request carries its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLocation {
    #[serde(rename = "jsonBody")]
    JsonBody,
    #[serde(rename = "urlQuery")]
    UrlQuery,
    #[serde(rename = "urlEncodedForm")]
    UrlEncodedForm,
}

impl Default for DataLocation {
    fn default() -> Self {
        DataLocation::UrlEncodedForm
    }
}

/// Authentication scheme attached to a client spec.
///
/// Every variant carries the same header-placement knobs: `header_name`
/// (default `Authorization`), `prefix` (scheme-specific default) and
/// `exclude_prefix` for APIs that want the bare value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthSpec {
    /// HTTP Basic.
    #[serde(rename = "basic", rename_all = "camelCase")]
    Basic {
        username: String,
        password: String,
        #[serde(default)]
        header_name: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        exclude_prefix: bool,
    },

    /// Static token, optionally base64-encoded before sending.
    #[serde(rename = "token", rename_all = "camelCase")]
    Token {
        token: String,
        #[serde(default)]
        encode_base64: bool,
        #[serde(default)]
        header_name: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        exclude_prefix: bool,
    },

    /// OAuth2 client-credentials grant.
    #[serde(rename = "oauth2ClientCredentials", rename_all = "camelCase")]
    OAuth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        data_location: DataLocation,
        /// Authenticate the refresh call itself with HTTP Basic
        #[serde(default)]
        use_basic_auth: bool,
        /// Template overriding the default grant parameters; values may
        /// reference `{{clientId}}` and `{{clientSecret}}`
        #[serde(default)]
        data: HashMap<String, String>,
        #[serde(default)]
        header_name: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        exclude_prefix: bool,
    },

    /// OAuth2 refresh-token grant seeded with an initial refresh token.
    #[serde(rename = "oauth2GrantType", rename_all = "camelCase")]
    OAuth2GrantType {
        token_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        data_location: DataLocation,
        #[serde(default)]
        use_basic_auth: bool,
        /// Template overriding the default grant parameters; values may
        /// reference `{{clientId}}`, `{{clientSecret}}`, `{{refreshToken}}`
        #[serde(default)]
        data: HashMap<String, String>,
        #[serde(default)]
        header_name: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        exclude_prefix: bool,
    },
}

/// Builds the `(name, value)` pair for an auth header.
fn place_header(
    default_prefix: &str,
    value: &str,
    header_name: &Option<String>,
    prefix: &Option<String>,
    exclude_prefix: bool,
) -> (String, String) {
    let name = header_name
        .clone()
        .unwrap_or_else(|| "Authorization".to_string());
    let value = if exclude_prefix {
        value.to_string()
    } else {
        format!("{} {}", prefix.as_deref().unwrap_or(default_prefix), value)
    };
    (name, value)
}

/// Shape of a token endpoint response. `expires_at` (absolute ms) wins
/// over `expires_in` (relative seconds) when both appear.
#[derive(Debug, Clone, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenGrant {
    fn expires_at_ms(&self, now: u64) -> u64 {
        match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(seconds)) => now + seconds * 1000,
            // Grants without expiry metadata are re-refreshed each margin.
            (None, None) => now + EXPIRY_MARGIN_MS,
        }
    }
}

/// True while a cached token is still comfortably inside its validity
/// window.
pub fn token_is_fresh(expires_at_ms: u64, now: u64) -> bool {
    expires_at_ms > now + EXPIRY_MARGIN_MS
}

/// Substitutes the `{{clientId}}` / `{{clientSecret}}` / `{{refreshToken}}`
/// placeholders in a grant parameter template.
fn render_template(
    template: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: Option<&str>,
) -> String {
    template
        .replace("{{clientId}}", client_id)
        .replace("{{clientSecret}}", client_secret)
        .replace("{{refreshToken}}", refresh_token.unwrap_or(""))
}

/// Per-client header builder with access to the fleet's token cache.
#[derive(Clone)]
pub struct Authenticator {
    spec: AuthSpec,
    /// Tracked cache key, `<prefix>requestHandler:<client>:oauth2`
    cache_key: String,
    cipher: TokenCipher,
    http: reqwest::Client,
}

impl Authenticator {
    pub fn new(
        spec: AuthSpec,
        cache_key: String,
        cipher: TokenCipher,
        http: reqwest::Client,
    ) -> Self {
        Self {
            spec,
            cache_key,
            cipher,
            http,
        }
    }

    /// The Redis key this authenticator owns; deleted on client destroy.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Builds the authentication headers for one request.
    pub async fn headers(&self, transport: &RedisTransport) -> Result<HashMap<String, String>> {
        let (name, value) = match &self.spec {
            AuthSpec::Basic {
                username,
                password,
                header_name,
                prefix,
                exclude_prefix,
            } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                place_header("Basic", &encoded, header_name, prefix, *exclude_prefix)
            }
            AuthSpec::Token {
                token,
                encode_base64,
                header_name,
                prefix,
                exclude_prefix,
            } => {
                let value = if *encode_base64 {
                    BASE64.encode(token.as_bytes())
                } else {
                    token.clone()
                };
                place_header("Bearer", &value, header_name, prefix, *exclude_prefix)
            }
            AuthSpec::OAuth2ClientCredentials {
                header_name,
                prefix,
                exclude_prefix,
                ..
            }
            | AuthSpec::OAuth2GrantType {
                header_name,
                prefix,
                exclude_prefix,
                ..
            } => {
                let token = self.oauth2_token(transport).await?;
                place_header("Bearer", &token, header_name, prefix, *exclude_prefix)
            }
        };

        Ok(HashMap::from([(name, value)]))
    }

    /// Returns a valid access token: cached when fresh, refreshed (and
    /// re-cached for the whole fleet) otherwise.
    async fn oauth2_token(&self, transport: &RedisTransport) -> Result<String> {
        let cached = transport.read_hash(&self.cache_key).await?;

        if let (Some(sealed), Some(expires_at)) = (
            cached.get("accessToken"),
            cached.get("expiresAt").and_then(|v| v.parse::<u64>().ok()),
        ) {
            if token_is_fresh(expires_at, now_ms()) {
                return self.cipher.open(sealed);
            }
        }

        // Prefer a previously persisted refresh token over the seed one.
        let cached_refresh = match cached.get("refreshToken") {
            Some(sealed) => Some(self.cipher.open(sealed)?),
            None => None,
        };

        let grant = self.refresh(cached_refresh.as_deref()).await?;
        self.persist(transport, &grant).await?;
        Ok(grant.access_token)
    }

    async fn refresh(&self, cached_refresh: Option<&str>) -> Result<TokenGrant> {
        let (token_url, client_id, client_secret, refresh_token, data_location, use_basic_auth, params) =
            match &self.spec {
                AuthSpec::OAuth2ClientCredentials {
                    token_url,
                    client_id,
                    client_secret,
                    scope,
                    data_location,
                    use_basic_auth,
                    data,
                    ..
                } => {
                    let mut params = if data.is_empty() {
                        let mut defaults = HashMap::from([(
                            "grant_type".to_string(),
                            "client_credentials".to_string(),
                        )]);
                        if !*use_basic_auth {
                            defaults.insert("client_id".to_string(), "{{clientId}}".to_string());
                            defaults.insert(
                                "client_secret".to_string(),
                                "{{clientSecret}}".to_string(),
                            );
                        }
                        defaults
                    } else {
                        data.clone()
                    };
                    if let Some(scope) = scope {
                        params
                            .entry("scope".to_string())
                            .or_insert_with(|| scope.clone());
                    }
                    (
                        token_url,
                        client_id,
                        client_secret,
                        None,
                        *data_location,
                        *use_basic_auth,
                        params,
                    )
                }
                AuthSpec::OAuth2GrantType {
                    token_url,
                    client_id,
                    client_secret,
                    refresh_token,
                    data_location,
                    use_basic_auth,
                    data,
                    ..
                } => {
                    let params = if data.is_empty() {
                        let mut defaults = HashMap::from([
                            ("grant_type".to_string(), "refresh_token".to_string()),
                            ("refresh_token".to_string(), "{{refreshToken}}".to_string()),
                        ]);
                        if !*use_basic_auth {
                            defaults.insert("client_id".to_string(), "{{clientId}}".to_string());
                            defaults.insert(
                                "client_secret".to_string(),
                                "{{clientSecret}}".to_string(),
                            );
                        }
                        defaults
                    } else {
                        data.clone()
                    };
                    let effective = cached_refresh.unwrap_or(refresh_token);
                    (
                        token_url,
                        client_id,
                        client_secret,
                        Some(effective.to_string()),
                        *data_location,
                        *use_basic_auth,
                        params,
                    )
                }
                _ => {
                    return Err(CourierError::Internal(
                        "refresh called for a non-oauth2 scheme".to_string(),
                    ))
                }
            };

        let rendered: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    render_template(v, client_id, client_secret, refresh_token.as_deref()),
                )
            })
            .collect();

        let mut request = self.http.post(token_url.as_str());
        if use_basic_auth {
            request = request.basic_auth(client_id, Some(client_secret));
        }
        request = match data_location {
            DataLocation::JsonBody => request.json(&rendered),
            DataLocation::UrlQuery => request.query(&rendered),
            DataLocation::UrlEncodedForm => request.form(&rendered),
        };

        let response = request
            .send()
            .await
            .map_err(|e| CourierError::AuthRefresh(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CourierError::AuthRefresh(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| CourierError::AuthRefresh(format!("malformed token response: {}", e)))
    }

    async fn persist(&self, transport: &RedisTransport, grant: &TokenGrant) -> Result<()> {
        let now = now_ms();
        let mut fields = vec![
            (
                "accessToken".to_string(),
                self.cipher.seal(&grant.access_token)?,
            ),
            ("expiresAt".to_string(), grant.expires_at_ms(now).to_string()),
        ];
        if let Some(refresh) = &grant.refresh_token {
            fields.push(("refreshToken".to_string(), self.cipher.seal(refresh)?));
        }

        transport.write_hash(&self.cache_key, &fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_value() {
        let encoded = BASE64.encode("user:pass");
        let (name, value) = place_header("Basic", &encoded, &None, &None, false);
        assert_eq!(name, "Authorization");
        assert_eq!(value, format!("Basic {}", encoded));
    }

    #[test]
    fn test_prefix_override_and_exclusion() {
        let (name, value) = place_header(
            "Bearer",
            "abc",
            &Some("X-Api-Key".to_string()),
            &Some("Key".to_string()),
            false,
        );
        assert_eq!(name, "X-Api-Key");
        assert_eq!(value, "Key abc");

        let (name, value) = place_header("Bearer", "abc", &None, &None, true);
        assert_eq!(name, "Authorization");
        assert_eq!(value, "abc");
    }

    #[test]
    fn test_template_rendering() {
        let rendered = render_template(
            "id={{clientId}}&secret={{clientSecret}}&rt={{refreshToken}}",
            "cid",
            "shh",
            Some("rtok"),
        );
        assert_eq!(rendered, "id=cid&secret=shh&rt=rtok");
    }

    #[test]
    fn test_token_freshness_margin() {
        let now = 1_000_000;
        assert!(token_is_fresh(now + EXPIRY_MARGIN_MS + 1, now));
        assert!(!token_is_fresh(now + EXPIRY_MARGIN_MS, now));
        assert!(!token_is_fresh(now, now));
    }

    #[test]
    fn test_grant_expiry_resolution() {
        let now = 50_000;
        let relative = TokenGrant {
            access_token: "t".to_string(),
            expires_in: Some(3600),
            expires_at: None,
            refresh_token: None,
        };
        assert_eq!(relative.expires_at_ms(now), now + 3_600_000);

        let absolute = TokenGrant {
            access_token: "t".to_string(),
            expires_in: Some(3600),
            expires_at: Some(99_000),
            refresh_token: None,
        };
        assert_eq!(absolute.expires_at_ms(now), 99_000);
    }

    #[test]
    fn test_auth_spec_wire_shape() {
        let spec: AuthSpec = serde_json::from_str(
            r#"{"type":"oauth2ClientCredentials","tokenUrl":"https://id.example/token",
                "clientId":"cid","clientSecret":"shh","dataLocation":"jsonBody",
                "useBasicAuth":true}"#,
        )
        .unwrap();
        match spec {
            AuthSpec::OAuth2ClientCredentials {
                data_location,
                use_basic_auth,
                ..
            } => {
                assert_eq!(data_location, DataLocation::JsonBody);
                assert!(use_basic_auth);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_token_spec_defaults() {
        let spec: AuthSpec =
            serde_json::from_str(r#"{"type":"token","token":"abc"}"#).unwrap();
        match spec {
            AuthSpec::Token {
                encode_base64,
                exclude_prefix,
                ..
            } => {
                assert!(!encode_base64);
                assert!(!exclude_prefix);
            }
            _ => panic!("wrong variant"),
        }
    }
}
