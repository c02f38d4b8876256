//! Per-feature consent lookups.

use async_trait::async_trait;
use tabletop_common::http::ApiClient;
use tabletop_common::models::{ConsentStatus, Feature};

#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn status(&self, feature: Feature) -> anyhow::Result<ConsentStatus>;
}

/// Reads consent from `GET /rooms/{room}/consent/{feature}`.
pub struct RestConsentProvider {
    api: ApiClient,
    room_id: String,
}

impl RestConsentProvider {
    pub fn new(api: ApiClient, room_id: impl Into<String>) -> Self {
        Self { api, room_id: room_id.into() }
    }
}

#[async_trait]
impl ConsentProvider for RestConsentProvider {
    async fn status(&self, feature: Feature) -> anyhow::Result<ConsentStatus> {
        let path = format!("/rooms/{}/consent/{}", self.room_id, feature.as_str());
        Ok(self.api.get(&path).await?)
    }
}

/// Fixed answers, for rooms whose consent was collected up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticConsent {
    pub speech_to_text: bool,
    pub recording: bool,
}

impl StaticConsent {
    pub fn all() -> Self {
        Self { speech_to_text: true, recording: true }
    }
}

#[async_trait]
impl ConsentProvider for StaticConsent {
    async fn status(&self, feature: Feature) -> anyhow::Result<ConsentStatus> {
        let consent_given = match feature {
            Feature::SpeechToText => self.speech_to_text,
            Feature::Recording => self.recording,
        };
        Ok(ConsentStatus { consent_given })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::routing::get;

    #[tokio::test]
    async fn rest_provider_reads_feature_endpoint() {
        let router = Router::new().route(
            "/rooms/{room}/consent/{feature}",
            get(|Path((_room, feature)): Path<(String, String)>| async move {
                axum::Json(serde_json::json!({ "consent_given": feature == "stt" }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let consent = RestConsentProvider::new(ApiClient::new(&format!("http://{addr}"), "").unwrap(), "12");

        assert!(consent.status(Feature::SpeechToText).await.unwrap().consent_given);
        assert!(!consent.status(Feature::Recording).await.unwrap().consent_given);
    }
}
