//! The transport trait and the default HTTP implementation.

use crate::api::models::{
    AuthResponse, ChangePasswordRequest, RegisterRequest, Session, SignInRequest, SyncRequest,
    SyncResponse,
};
use crate::api::ApiError;
use crate::keys::KeyParams;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The injected server transport. Implementations perform the HTTP calls;
/// the library performs no network I/O of its own.
pub trait ApiClient: Send + Sync {
    /// Fetch the key params recorded for an account.
    fn key_params(&self, email: &str) -> Result<KeyParams, ApiError>;

    fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError>;

    fn sign_in(&self, request: &SignInRequest) -> Result<AuthResponse, ApiError>;

    fn change_password(
        &self,
        request: &ChangePasswordRequest,
        session: &Session,
    ) -> Result<AuthResponse, ApiError>;

    fn sync(&self, request: &SyncRequest, session: &Session) -> Result<SyncResponse, ApiError>;

    fn sign_out(&self, session: &Session) -> Result<(), ApiError>;
}

/// Default transport over `reqwest`'s blocking client.
pub struct HttpApiClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        session: Option<&Session>,
    ) -> Result<R, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(session) = session {
            request = request.header(
                "Authorization",
                format!("Bearer {}", session.access_token),
            );
        }

        let response = request
            .send()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response)
    }

    fn get<R: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<R, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::parse(response)
    }

    fn parse<R: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<R, ApiError> {
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(ApiError::InvalidSession);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_else(|_| "unknown".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .map_err(|e| ApiError::Serialization(e.to_string()))
    }
}

impl ApiClient for HttpApiClient {
    fn key_params(&self, email: &str) -> Result<KeyParams, ApiError> {
        // The query builder percent-encodes; emails with `+` or `&`
        // survive intact.
        self.get("/v1/auth/params", &[("email", email)])
    }

    fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        self.post("/v1/auth/register", request, None)
    }

    fn sign_in(&self, request: &SignInRequest) -> Result<AuthResponse, ApiError> {
        self.post("/v1/auth/sign-in", request, None)
    }

    fn change_password(
        &self,
        request: &ChangePasswordRequest,
        session: &Session,
    ) -> Result<AuthResponse, ApiError> {
        self.post("/v1/auth/change-password", request, Some(session))
    }

    fn sync(&self, request: &SyncRequest, session: &Session) -> Result<SyncResponse, ApiError> {
        self.post("/v1/items/sync", request, Some(session))
    }

    fn sign_out(&self, session: &Session) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post("/v1/auth/sign-out", &serde_json::json!({}), Some(session))?;
        Ok(())
    }
}
