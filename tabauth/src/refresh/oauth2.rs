//! A refresher that uses an OAuth2 server as an authority

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use super::{RefreshedCredentials, Refresher};
use crate::{error::BoxError, AccessToken, ClientId, RefreshToken, RefreshTokenRef};

/// Performs the OAuth2 refresh token flow against a token endpoint
#[derive(Debug)]
pub struct OAuth2Refresher<T = JsonBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: ClientId,
    content_type: PhantomData<fn() -> T>,
}

impl OAuth2Refresher<JsonBody> {
    /// Constructs a new refresher for the given token endpoint and client
    pub fn new(client: reqwest::Client, token_url: reqwest::Url, client_id: ClientId) -> Self {
        Self {
            client,
            token_url,
            client_id,
            content_type: PhantomData,
        }
    }

    /// Configures the refresher to send the request to the authority as
    /// form data
    pub fn using_form_data(self) -> OAuth2Refresher<FormBody> {
        OAuth2Refresher {
            client: self.client,
            token_url: self.token_url,
            client_id: self.client_id,
            content_type: PhantomData,
        }
    }
}

#[async_trait]
impl<T: RequestType> Refresher for OAuth2Refresher<T> {
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredentials, BoxError> {
        let request = RefreshRequest {
            client_id: &self.client_id,
            refresh_token,
        };

        Ok(request_token::<T>(&self.client, self.token_url.clone(), &request).await?)
    }
}

/// An error while attempting to refresh credentials with the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(reqwest::Error),
}

#[derive(Debug)]
struct RefreshRequest<'a> {
    client_id: &'a ClientId,
    refresh_token: &'a RefreshTokenRef,
}

impl Serialize for RefreshRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshRequest", 3)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<AccessToken>,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[tracing::instrument(
    err,
    skip(client, token_url, request),
    fields(
        token_url = %token_url,
        client_id = %request.client_id,
    ),
)]
async fn request_token<T: RequestType>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    request: &RefreshRequest<'_>,
) -> Result<RefreshedCredentials, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let req = T::attach_payload(client.post(token_url), request);
    let resp = req.send().await.map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: TokenResponse = serde_json::from_slice(&body)?;

    tracing::info!(
        has_access_token = resp.access_token.is_some(),
        has_refresh_token = resp.refresh_token.is_some(),
        expires_in = ?resp.expires_in,
        "received new tokens"
    );

    Ok(RefreshedCredentials {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token,
    })
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches the request to the body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches the request to the body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}
