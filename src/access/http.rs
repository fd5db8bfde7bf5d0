use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;

use super::provider::*;

#[derive(Serialize)]
struct CreateBody<'a> {
    validity: &'a [ValidityWindow],
    is_active: bool,
}

#[derive(Serialize)]
struct RescheduleBody<'a> {
    validity: &'a [ValidityWindow],
}

/// `reqwest` client for the provider's REST API.
#[derive(Clone)]
pub struct HttpAccessCodeProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpAccessCodeProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, entity: &EntityRef, action: Option<&str>) -> String {
        let base = format!("{}/{}/{}", self.base_url, entity.kind.path_segment(), entity.uuid);
        match action {
            Some(action) => format!("{base}/{action}"),
            None => base,
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("Accept", "application/json")
    }

    async fn send(builder: RequestBuilder) -> Result<Response, ProviderError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            StatusCode::CONFLICT => Err(ProviderError::Conflict),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!("{}: {body}", status.as_u16())))
            }
        }
    }

    async fn decode(response: Response) -> Result<RemoteAccessCode, ProviderError> {
        response
            .json::<RemoteAccessCode>()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad response body: {e}")))
    }
}

#[async_trait]
impl AccessCodeProvider for HttpAccessCodeProvider {
    async fn create(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
        is_active: bool,
    ) -> Result<RemoteAccessCode, ProviderError> {
        let request = self
            .request(Method::POST, self.url(entity, None))
            .json(&CreateBody { validity, is_active });
        Self::decode(Self::send(request).await?).await
    }

    async fn get(&self, entity: &EntityRef) -> Result<RemoteAccessCode, ProviderError> {
        let request = self.request(Method::GET, self.url(entity, None));
        Self::decode(Self::send(request).await?).await
    }

    async fn activate(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        let request = self.request(Method::POST, self.url(entity, Some("activate")));
        Self::send(request).await.map(|_| ())
    }

    async fn deactivate(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        let request = self.request(Method::POST, self.url(entity, Some("deactivate")));
        Self::send(request).await.map(|_| ())
    }

    async fn reschedule(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
    ) -> Result<(), ProviderError> {
        let request = self
            .request(Method::POST, self.url(entity, Some("reschedule")))
            .json(&RescheduleBody { validity });
        Self::send(request).await.map(|_| ())
    }

    async fn delete(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        let request = self.request(Method::DELETE, self.url(entity, None));
        Self::send(request).await.map(|_| ())
    }
}
