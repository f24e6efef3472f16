//! OpenID Connect grants against the identity provider advertised by the
//! backend.
use crate::error::{Error, Result};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthType, ClientId, ClientSecret, DeviceAuthorizationUrl, EndpointNotSet, EndpointSet,
    ErrorResponse, PkceCodeChallenge, RefreshToken, RequestTokenError, Scope,
    StandardDeviceAuthorizationResponse, TokenResponse, TokenUrl,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_DEVICE_CODE_PKCE: &str = "urn:ietf:params:oauth:grant-type:device_code+pkce";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct OidcProvider {
    pub id: String,
    pub issuer: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub default_clients: Vec<DefaultClient>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DefaultClient {
    pub id: String,
    #[serde(default)]
    pub grant_types: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ProviderList {
    pub providers: Vec<OidcProvider>,
}

impl OidcProvider {
    /// First default client that supports any of `grants`.
    pub fn default_client_for(&self, grants: &[&str]) -> Option<&DefaultClient> {
        self.default_clients
            .iter()
            .find(|c| c.grant_types.iter().any(|g| grants.contains(&g.as_str())))
    }

    pub fn scopes(&self) -> Vec<Scope> {
        if self.scopes.is_empty() {
            return vec![Scope::new("openid".to_string())];
        }
        self.scopes.iter().cloned().map(Scope::new).collect()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct IssuerConfiguration {
    pub token_endpoint: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
}

pub async fn issuer_configuration(client: &Client, issuer: &str) -> Result<IssuerConfiguration> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Authentication(format!(
            "unable to read issuer configuration at {}: {}",
            url,
            response.status()
        )));
    }
    Ok(response.json().await?)
}

/// Tokens issued by the identity provider.
#[derive(Clone, Debug)]
pub struct OidcTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

impl OidcTokens {
    fn from_response<T: TokenResponse>(response: &T) -> Self {
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response.expires_in(),
        }
    }
}

type TokenClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Client credentials travel in the form body, as openEO providers expect.
fn token_client(
    config: &IssuerConfiguration,
    client_id: &str,
    client_secret: Option<&str>,
) -> Result<TokenClient> {
    let token_url = TokenUrl::new(config.token_endpoint.clone()).map_err(|e| {
        Error::Authentication(format!("invalid token endpoint '{}': {}", config.token_endpoint, e))
    })?;
    let mut client = BasicClient::new(ClientId::new(client_id.to_string()))
        .set_auth_type(AuthType::RequestBody)
        .set_token_uri(token_url);
    if let Some(secret) = client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.to_string()));
    }
    Ok(client)
}

fn token_error<RE, T>(err: RequestTokenError<RE, T>) -> Error
where
    RE: std::error::Error + 'static,
    T: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => Error::Authentication(response.to_string()),
        RequestTokenError::Request(err) => Error::Connection(err.to_string()),
        RequestTokenError::Parse(err, _) => {
            Error::Authentication(format!("malformed token response: {}", err))
        }
        RequestTokenError::Other(message) => Error::Authentication(message),
    }
}

pub async fn client_credentials(
    http: &Client,
    config: &IssuerConfiguration,
    client_id: &str,
    client_secret: &str,
    scopes: Vec<Scope>,
) -> Result<OidcTokens> {
    debug!(client_id, "Client credentials grant");
    let response = token_client(config, client_id, Some(client_secret))?
        .exchange_client_credentials()
        .add_scopes(scopes)
        .request_async(http)
        .await
        .map_err(token_error)?;
    Ok(OidcTokens::from_response(&response))
}

pub async fn refresh_token(
    http: &Client,
    config: &IssuerConfiguration,
    client_id: &str,
    refresh_token: &str,
) -> Result<OidcTokens> {
    debug!(client_id, "Refresh token grant");
    let refresh_token = RefreshToken::new(refresh_token.to_string());
    let response = token_client(config, client_id, None)?
        .exchange_refresh_token(&refresh_token)
        .request_async(http)
        .await
        .map_err(token_error)?;
    Ok(OidcTokens::from_response(&response))
}

/// Interactive device authorization with PKCE: the user opens the printed
/// link in any browser while this call polls the token endpoint. Pending and
/// slow_down answers are retried until the device code expires.
pub async fn device_code(
    http: &Client,
    config: &IssuerConfiguration,
    client_id: &str,
    scopes: Vec<Scope>,
) -> Result<OidcTokens> {
    let endpoint = config.device_authorization_endpoint.as_deref().ok_or_else(|| {
        Error::Authentication("provider does not support the device code flow".to_string())
    })?;
    let device_url = DeviceAuthorizationUrl::new(endpoint.to_string()).map_err(|e| {
        Error::Authentication(format!("invalid device authorization endpoint '{}': {}", endpoint, e))
    })?;
    let client = token_client(config, client_id, None)?.set_device_authorization_url(device_url);
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

    let details: StandardDeviceAuthorizationResponse = client
        .exchange_device_code()
        .add_scopes(scopes)
        .add_extra_param("code_challenge", challenge.as_str())
        .add_extra_param("code_challenge_method", challenge.method().as_str())
        .request_async(http)
        .await
        .map_err(token_error)?;

    match details.verification_uri_complete() {
        Some(uri) => println!("Visit {} to authenticate.", uri.secret()),
        None => println!(
            "Visit {} and enter user code '{}' to authenticate.",
            details.verification_uri().url(),
            details.user_code().secret()
        ),
    }
    debug!(interval = ?details.interval(), expires_in = ?details.expires_in(), "Polling for device authorization");

    let response = client
        .exchange_device_access_token(&details)
        .add_extra_param("code_verifier", verifier.secret().as_str())
        .request_async(http, tokio::time::sleep, None)
        .await
        .map_err(token_error)?;
    info!("Device authorization granted");
    Ok(OidcTokens::from_response(&response))
}
