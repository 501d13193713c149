use alloy_rpc_types_engine::{Claims, JwtSecret};
use http::{HeaderValue, header::AUTHORIZATION, header::InvalidHeaderValue};
use jsonrpsee::core::http_helpers::HttpError;
use jsonrpsee::http_client::transport::Error as TransportError;
use std::{
    iter::once,
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, SystemTimeError, UNIX_EPOCH},
};
use thiserror::Error;
use tower::{Layer, Service};
use tower_http::sensitive_headers::{SetSensitiveRequestHeaders, SetSensitiveRequestHeadersLayer};

pub type Auth<S> = AuthService<SetSensitiveRequestHeaders<S>>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("system clock is before the unix epoch")]
    Clock(#[from] SystemTimeError),
    #[error("failed to issue engine api jwt: {0}")]
    Jwt(String),
    #[error("invalid authorization header: {0}")]
    Header(#[from] InvalidHeaderValue),
}

impl From<AuthError> for TransportError {
    fn from(err: AuthError) -> Self {
        TransportError::Http(HttpError::Stream(Box::new(err)))
    }
}

/// A layer that adds a new JWT token to every request using `AuthService`.
#[derive(Clone, Debug)]
pub struct AuthLayer {
    secret: JwtSecret,
}

impl AuthLayer {
    pub const fn new(secret: JwtSecret) -> Self {
        Self { secret }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = Auth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let inner = SetSensitiveRequestHeadersLayer::new(once(AUTHORIZATION)).layer(inner);
        AuthService::new(self.secret, inner)
    }
}

/// Authenticates every outgoing engine request with a freshly issued token.
///
/// A request whose token can't be issued is failed here and never sent unauthenticated.
#[derive(Debug, Clone)]
pub struct AuthService<S> {
    secret: JwtSecret,
    inner: S,
}

impl<S> AuthService<S> {
    const fn new(secret: JwtSecret, inner: S) -> Self {
        Self { secret, inner }
    }
}

impl<S, B> Service<http::Request<B>> for AuthService<S>
where
    S: Service<http::Request<B>>,
    S::Response: Send + 'static,
    S::Error: From<AuthError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        match secret_to_bearer_header(&self.secret) {
            Ok(header) => {
                request.headers_mut().insert(AUTHORIZATION, header);
                Box::pin(self.inner.call(request))
            }
            Err(e) => {
                let err = S::Error::from(e);
                Box::pin(std::future::ready(Err::<S::Response, S::Error>(err)))
            }
        }
    }
}

/// Converts a secret into a Bearer auth header value with the `iat` claim set to now, as per
/// <https://github.com/ethereum/execution-apis/blob/main/src/engine/authentication.md#jwt-claims>.
pub fn secret_to_bearer_header(secret: &JwtSecret) -> Result<HeaderValue, AuthError> {
    let iat = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let token = secret
        .encode(&Claims { iat, exp: None })
        .map_err(|e| AuthError::Jwt(e.to_string()))?;
    Ok(format!("Bearer {token}").parse()?)
}
