//! Identity endpoints the session authority talks to.

use async_trait::async_trait;
use cms_admin_shared::{
    error_message, ApiError, ChangePasswordRequest, Credentials, Identity, LoginResponse,
    MeResponse, MessageResponse, RegisterRequest, UpdateProfileRequest,
};

use crate::api_client::ApiClient;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No valid session: expected for anonymous visitors.
    #[error("not authenticated")]
    Unauthenticated,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    fn from_api(err: ApiError) -> Self {
        if err.is_unauthorized() {
            AuthError::Unauthenticated
        } else {
            AuthError::Api(err)
        }
    }
}

#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    /// Identity behind the current session.
    async fn fetch_identity(&self) -> Result<Identity, AuthError>;

    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError>;

    async fn logout(&self) -> Result<(), AuthError>;
}

/// [`AuthBackend`] over the REST API.
#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
    api: ApiClient,
}

impl HttpAuthBackend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<MessageResponse, AuthError> {
        self.api
            .post_json("/auth/register", request)
            .await
            .map_err(AuthError::from_api)
    }

    pub async fn update_profile(
        &self,
        request: &UpdateProfileRequest,
    ) -> Result<MessageResponse, AuthError> {
        self.api
            .put_json("/auth/profile", request)
            .await
            .map_err(AuthError::from_api)
    }

    pub async fn change_password(
        &self,
        request: &ChangePasswordRequest,
    ) -> Result<MessageResponse, AuthError> {
        self.api
            .put_json("/auth/password", request)
            .await
            .map_err(AuthError::from_api)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn fetch_identity(&self) -> Result<Identity, AuthError> {
        let me: MeResponse = self
            .api
            .get_json("/auth/me")
            .await
            .map_err(AuthError::from_api)?;
        Ok(me.user)
    }

    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        match self
            .api
            .post_json::<_, LoginResponse>("/auth/login", credentials)
            .await
        {
            Ok(resp) => Ok(resp.user),
            Err(ApiError::Http { status, body }) if status == 400 || status == 401 => {
                let message =
                    error_message(&body).unwrap_or_else(|| "invalid credentials".to_string());
                Err(AuthError::InvalidCredentials(message))
            }
            Err(e) => Err(AuthError::Api(e)),
        }
    }

    async fn logout(&self) -> Result<(), AuthError> {
        self.api
            .post_empty("/auth/logout")
            .await
            .map_err(AuthError::from_api)
    }
}
