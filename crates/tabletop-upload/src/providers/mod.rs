//! Concrete upload providers and the factory that picks one.

mod local;
mod multipart;
mod resumable;

pub use local::LocalUploader;
pub use multipart::MultipartUploader;
pub use resumable::ResumableUploader;

use serde_json::Value;
use tabletop_common::http::ApiClient;
use tabletop_common::models::UploadProviderKind;

use crate::provider::UploadProvider;
use crate::session::UploadTuning;

/// Build the provider configured for a room. This is the only place the kind is matched.
pub fn create(kind: UploadProviderKind, api: ApiClient, tuning: &UploadTuning) -> Box<dyn UploadProvider> {
    match kind {
        UploadProviderKind::Local => Box::new(LocalUploader::new(api)),
        UploadProviderKind::MultipartCloud => {
            Box::new(MultipartUploader::new(api, tuning.multipart_part_size))
        }
        UploadProviderKind::ResumableDirect => {
            Box::new(ResumableUploader::new(api, tuning.resumable_chunk_granularity))
        }
    }
}

fn recordings_path(room_id: &str) -> String {
    format!("/rooms/{room_id}/recordings")
}

/// Servers hand ids back as numbers or strings.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::Router;

    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
