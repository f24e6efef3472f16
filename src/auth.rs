//! Delegated credentials for job submission.
pub mod oidc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use oidc::{OidcProvider, ProviderList};
use serde::Deserialize;
use std::env;
use tracing::info;

#[derive(Clone, Debug, PartialEq)]
pub enum AuthMethod {
    /// Interactive device code flow with PKCE.
    DeviceCode { client_id: Option<String> },
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
    RefreshToken {
        client_id: Option<String>,
        refresh_token: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OidcOptions {
    pub provider_id: Option<String>,
    pub method: AuthMethod,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            provider_id: None,
            method: AuthMethod::DeviceCode { client_id: None },
        }
    }
}

impl OidcOptions {
    /// Reads the `OPENEO_AUTH_*` variables used for headless runs.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let provider_id = lookup("OPENEO_AUTH_PROVIDER_ID");
        let client_id = lookup("OPENEO_AUTH_CLIENT_ID");
        let method = lookup("OPENEO_AUTH_METHOD").unwrap_or_else(|| "device".to_string());

        let method = match method.as_str() {
            "device" | "device_code" => AuthMethod::DeviceCode { client_id },
            "client_credentials" => AuthMethod::ClientCredentials {
                client_id: client_id.ok_or_else(|| missing("OPENEO_AUTH_CLIENT_ID"))?,
                client_secret: lookup("OPENEO_AUTH_CLIENT_SECRET")
                    .ok_or_else(|| missing("OPENEO_AUTH_CLIENT_SECRET"))?,
            },
            "refresh_token" => AuthMethod::RefreshToken {
                client_id,
                refresh_token: lookup("OPENEO_AUTH_REFRESH_TOKEN")
                    .ok_or_else(|| missing("OPENEO_AUTH_REFRESH_TOKEN"))?,
            },
            other => {
                return Err(Error::Config(format!(
                    "unknown OPENEO_AUTH_METHOD '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            provider_id,
            method,
        })
    }
}

/// How a pipeline run obtains its job-submission credential.
#[derive(Clone, Debug, PartialEq)]
pub enum Credentials {
    Oidc(OidcOptions),
    Basic { username: String, password: String },
}

fn missing(var: &str) -> Error {
    Error::Config(format!("{} must be set", var))
}

#[derive(Deserialize, Debug)]
struct BasicToken {
    access_token: String,
}

impl Connection {
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        match credentials {
            Credentials::Oidc(options) => self.authenticate_oidc(options).await,
            Credentials::Basic { username, password } => {
                self.authenticate_basic(username, password).await
            }
        }
    }

    pub async fn list_oidc_providers(&self) -> Result<Vec<OidcProvider>> {
        let response = self.get("credentials/oidc")?.send().await?;
        if !response.status().is_success() {
            return Err(Error::Authentication(format!(
                "backend does not offer OIDC providers ({})",
                response.status()
            )));
        }
        let list: ProviderList = response.json().await?;
        Ok(list.providers)
    }

    /// Obtains an OIDC access token and stores it on the session. The
    /// previous credential is kept if any step fails.
    pub async fn authenticate_oidc(&mut self, options: &OidcOptions) -> Result<()> {
        let providers = self.list_oidc_providers().await?;
        let provider = match &options.provider_id {
            Some(id) => providers.iter().find(|p| &p.id == id).ok_or_else(|| {
                Error::Authentication(format!("unknown OIDC provider '{}'", id))
            })?,
            None => providers
                .first()
                .ok_or_else(|| Error::Authentication("no OIDC providers available".to_string()))?,
        };
        info!(provider = %provider.id, issuer = %provider.issuer, "Authenticating with OIDC");

        let config = oidc::issuer_configuration(self.http(), &provider.issuer).await?;
        let scopes = provider.scopes();
        let token = match &options.method {
            AuthMethod::ClientCredentials {
                client_id,
                client_secret,
            } => {
                oidc::client_credentials(self.http(), &config, client_id, client_secret, scopes)
                    .await?
            }
            AuthMethod::RefreshToken {
                client_id,
                refresh_token,
            } => {
                let client_id = resolve_client(provider, client_id, &[oidc::GRANT_REFRESH_TOKEN])?;
                oidc::refresh_token(self.http(), &config, &client_id, refresh_token).await?
            }
            AuthMethod::DeviceCode { client_id } => {
                let client_id = resolve_client(
                    provider,
                    client_id,
                    &[oidc::GRANT_DEVICE_CODE_PKCE, oidc::GRANT_DEVICE_CODE],
                )?;
                oidc::device_code(self.http(), &config, &client_id, scopes).await?
            }
        };

        let bearer = format!("oidc/{}/{}", provider.id, token.access_token);
        self.set_bearer(bearer);
        info!(provider = %provider.id, "Authenticated");
        Ok(())
    }

    /// HTTP basic login, offered by some backends next to OIDC.
    pub async fn authenticate_basic(&mut self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http()
            .get(self.endpoint("credentials/basic")?)
            .basic_auth(username, Some(password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Authentication(format!(
                "basic authentication rejected ({})",
                response.status()
            )));
        }
        let token: BasicToken = response.json().await?;
        self.set_bearer(format!("basic//{}", token.access_token));
        info!(username, "Authenticated");
        Ok(())
    }
}

fn resolve_client(
    provider: &OidcProvider,
    configured: &Option<String>,
    grants: &[&str],
) -> Result<String> {
    if let Some(client_id) = configured {
        return Ok(client_id.clone());
    }
    provider
        .default_client_for(grants)
        .map(|c| c.id.clone())
        .ok_or_else(|| {
            Error::Authentication(format!(
                "provider '{}' has no default client for {}",
                provider.id,
                grants.join(" or ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::mock_backend;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{basic_auth, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_options_default_to_device_flow() {
        let options = OidcOptions::from_lookup(lookup(&[])).unwrap();
        assert_eq!(options, OidcOptions::default());
    }

    #[test]
    fn test_options_client_credentials_from_env() {
        let options = OidcOptions::from_lookup(lookup(&[
            ("OPENEO_AUTH_METHOD", "client_credentials"),
            ("OPENEO_AUTH_PROVIDER_ID", "egi"),
            ("OPENEO_AUTH_CLIENT_ID", "svc"),
            ("OPENEO_AUTH_CLIENT_SECRET", "s3cr3t"),
        ]))
        .unwrap();
        assert_eq!(options.provider_id.as_deref(), Some("egi"));
        assert_eq!(
            options.method,
            AuthMethod::ClientCredentials {
                client_id: "svc".to_string(),
                client_secret: "s3cr3t".to_string()
            }
        );
    }

    #[test]
    fn test_options_require_secret() {
        let err = OidcOptions::from_lookup(lookup(&[
            ("OPENEO_AUTH_METHOD", "client_credentials"),
            ("OPENEO_AUTH_CLIENT_ID", "svc"),
        ]))
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_options_reject_unknown_method() {
        let err = OidcOptions::from_lookup(lookup(&[("OPENEO_AUTH_METHOD", "magic")]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    async fn mount_provider(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/credentials/oidc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "providers": [{
                    "id": "testidp",
                    "issuer": format!("{}/idp", server.uri()),
                    "title": "Test IdP",
                    "scopes": ["openid"],
                    "default_clients": [
                        {"id": "public-cli", "grant_types": [oidc::GRANT_DEVICE_CODE_PKCE, "refresh_token"]}
                    ]
                }]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/idp/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_endpoint": format!("{}/idp/token", server.uri())
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_authenticate_oidc_client_credentials() {
        let server = mock_backend().await;
        mount_provider(&server).await;
        Mock::given(method("POST"))
            .and(path("/idp/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "at-42", "token_type": "Bearer"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        let options = OidcOptions {
            provider_id: None,
            method: AuthMethod::ClientCredentials {
                client_id: "svc".to_string(),
                client_secret: "s3cr3t".to_string(),
            },
        };
        connection.authenticate_oidc(&options).await.unwrap();
        assert!(connection.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_oidc_refresh_uses_default_client() {
        let server = mock_backend().await;
        mount_provider(&server).await;
        Mock::given(method("POST"))
            .and(path("/idp/token"))
            .and(body_string_contains("client_id=public-cli"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "at-43", "token_type": "Bearer"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        let options = OidcOptions {
            provider_id: Some("testidp".to_string()),
            method: AuthMethod::RefreshToken {
                client_id: None,
                refresh_token: "rt-1".to_string(),
            },
        };
        connection.authenticate_oidc(&options).await.unwrap();
        assert!(connection.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_oidc_unknown_provider() {
        let server = mock_backend().await;
        mount_provider(&server).await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        let options = OidcOptions {
            provider_id: Some("elsewhere".to_string()),
            ..OidcOptions::default()
        };
        let err = connection.authenticate_oidc(&options).await.err().unwrap();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(!connection.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_basic() {
        let server = mock_backend().await;
        Mock::given(method("GET"))
            .and(path("/credentials/basic"))
            .and(basic_auth("alice", "wonderland"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "bt-1"})),
            )
            .mount(&server)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        connection
            .authenticate_basic("alice", "wonderland")
            .await
            .unwrap();
        assert!(connection.is_authenticated());

        let err = connection
            .authenticate_basic("alice", "wrong")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(connection.is_authenticated());
    }
}
