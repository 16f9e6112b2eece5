// ABOUTME: Async HTTP client for the knowledge-base note API
// ABOUTME: Handles auth headers, pagination, and tolerant response envelopes

use crate::util::truncate_str;
use crate::{AttachmentInfo, Error, NoteSummary, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PAGE_SIZE: usize = 100;

pub struct ApiClient {
    client: Client,
    kb_server: String,
    kb_guid: String,
    token: String,
    page_size: usize,
}

impl ApiClient {
    pub fn new(token: String, kb_guid: String, kb_server: String) -> Result<Self> {
        Self::with_timeout(token, kb_guid, kb_server, Duration::from_secs(30))
    }

    pub fn with_timeout(
        token: String,
        kb_guid: String,
        kb_server: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(ApiClient {
            client,
            kb_server: kb_server.trim_end_matches('/').to_string(),
            kb_guid,
            token,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.kb_server, endpoint);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .header("X-Wiz-Token", &self.token)
            .header("Accept", "application/json")
            .header("User-Agent", "notedown/0.1 (Rust)")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: endpoint.into(),
                status: status.as_u16(),
                message: truncate_str(&message, 100),
            });
        }

        Ok(response)
    }

    async fn get_json(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self.get(endpoint, query).await?;
        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            warn!(endpoint, preview = %truncate_str(&body, 200), "unparseable response");
            Error::Parse(e)
        })?;
        Ok(unwrap_envelope(value))
    }

    /// All folder paths in the knowledge base. The only call whose failure is
    /// fatal to a run.
    pub async fn list_folders(&self) -> Result<Vec<String>> {
        let endpoint = format!("/ks/category/all/{}", self.kb_guid);
        let value = self.get_json(&endpoint, &[]).await?;
        let folders: Vec<String> = serde_json::from_value(value)?;
        Ok(folders)
    }

    /// All notes in one folder, following pagination until a short page.
    pub async fn list_notes(&self, folder: &str) -> Result<Vec<NoteSummary>> {
        let endpoint = format!("/ks/note/list/category/{}", self.kb_guid);
        let mut notes = Vec::new();
        let mut start = 0usize;

        loop {
            let query = [
                ("category", folder.to_string()),
                ("start", start.to_string()),
                ("count", self.page_size.to_string()),
                ("orderBy", "modified".to_string()),
                ("ascending", "desc".to_string()),
                ("withAbstract", "false".to_string()),
            ];
            let value = self.get_json(&endpoint, &query).await?;
            let page: Vec<NoteSummary> = serde_json::from_value(value)?;
            let page_len = page.len();
            notes.extend(page);

            if page_len < self.page_size {
                break;
            }
            start += page_len;
        }

        Ok(notes)
    }

    /// Full note record, or None when the server answers with something that
    /// is not a note object (the view endpoint sometimes serves HTML).
    pub async fn get_note_info(&self, guid: &str) -> Result<Option<NoteSummary>> {
        let endpoint = format!("/ks/note/view/{}/{}/", self.kb_guid, guid);
        let value = match self.note_view(&endpoint).await? {
            Some(value) => value,
            None => return Ok(None),
        };

        match serde_json::from_value::<NoteSummary>(value) {
            Ok(note) => Ok(Some(note)),
            Err(e) => {
                warn!(guid, error = %e, "note info did not deserialize");
                Ok(None)
            }
        }
    }

    /// Attachment descriptors declared on the note record. The API has no
    /// standalone attachment listing; they ride along on the view response.
    pub async fn get_attachments(&self, guid: &str) -> Result<Vec<AttachmentInfo>> {
        let endpoint = format!("/ks/note/view/{}/{}/", self.kb_guid, guid);
        let Some(value) = self.note_view(&endpoint).await? else {
            return Ok(Vec::new());
        };

        match value.get("attachments") {
            Some(list) => Ok(serde_json::from_value(list.clone())?),
            None => Ok(Vec::new()),
        }
    }

    async fn note_view(&self, endpoint: &str) -> Result<Option<Value>> {
        let response = self.get(endpoint, &[]).await?;
        if !is_json(&response) {
            debug!(endpoint, "non-JSON view response");
            return Ok(None);
        }

        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body)?;
        Ok(Some(unwrap_envelope(value)))
    }

    /// Raw note markup. An empty string means the server had no content;
    /// the caller decides what that means for the run.
    pub async fn get_note_html(&self, guid: &str) -> Result<String> {
        let endpoint = format!("/ks/note/download/{}/{}", self.kb_guid, guid);
        let query = [
            ("downloadInfo", "0".to_string()),
            ("downloadData", "1".to_string()),
        ];

        let response = self.get(&endpoint, &query).await?;
        let json = is_json(&response);
        let body = response.text().await?;

        if json {
            let value: Value = serde_json::from_str(&body)?;
            let value = unwrap_envelope(value);
            Ok(value
                .get("html")
                .and_then(|h| h.as_str())
                .unwrap_or_default()
                .to_string())
        } else {
            // Older servers stream the HTML directly
            Ok(body)
        }
    }

    pub async fn download_attachment(&self, doc_guid: &str, att_guid: &str) -> Result<Vec<u8>> {
        let endpoint = format!(
            "/ks/attachment/download/{}/{}/{}",
            self.kb_guid, doc_guid, att_guid
        );
        let response = self.get(&endpoint, &[]).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn is_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

/// Some deployments wrap every payload in `{"returnCode": 200, "result": …}`,
/// others return the payload bare. Normalize to the payload.
fn unwrap_envelope(value: Value) -> Value {
    if let Value::Object(ref map) = value {
        if map.get("returnCode").and_then(|c| c.as_i64()) == Some(200) {
            if let Some(result) = map.get("result") {
                return result.clone();
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_envelope_wrapped() {
        let wrapped = json!({"returnCode": 200, "result": ["/a/", "/b/"]});
        assert_eq!(unwrap_envelope(wrapped), json!(["/a/", "/b/"]));
    }

    #[test]
    fn test_unwrap_envelope_bare() {
        let bare = json!(["/a/"]);
        assert_eq!(unwrap_envelope(bare.clone()), bare);
    }

    #[test]
    fn test_unwrap_envelope_error_code_left_alone() {
        let failed = json!({"returnCode": 301, "returnMessage": "token expired"});
        assert_eq!(unwrap_envelope(failed.clone()), failed);
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ApiClient::new(
            "t".into(),
            "kb-1".into(),
            "https://kb.example.net/".into(),
        )
        .unwrap();
        assert_eq!(client.kb_server, "https://kb.example.net");
    }

    #[test]
    fn test_page_size_floor() {
        let client = ApiClient::new("t".into(), "kb".into(), "http://x".into())
            .unwrap()
            .with_page_size(0);
        assert_eq!(client.page_size, 1);
    }
}
