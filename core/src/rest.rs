/// REST collaborator: the backend endpoints the stores read from and
/// mutate through
///
/// Endpoints:
///   GET    /notifications/user/:user_id
///   GET    /notifications/user/:user_id/unread-count
///   PUT    /notifications/:id/read?userId=N
///   PUT    /notifications/user/:user_id/read-all
///   DELETE /notifications/:id
///   GET    /conversations/staff/:staff_id | /conversations/user/:user_id
///   POST   /conversations                      body: {"userId":..,"staffId":..}
///   GET    /conversations/:id/messages
///   PUT    /conversations/:id/read?isUser=bool
///   POST   /conversations/:id/messages         body: {"senderId","senderType","content"}
use crate::error::{RealtimeError, Result};
use crate::models::{normalize_list, Conversation, Message, NewMessage, Notification, RecordId, SenderRole, Viewer};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Backend operations used by the stores
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn fetch_notifications(&self, user_id: &RecordId) -> Result<Vec<Notification>>;

    async fn fetch_unread_count(&self, user_id: &RecordId) -> Result<u64>;

    /// Returns the updated record when the server sends one back
    async fn mark_notification_read(&self, id: &RecordId, user_id: &RecordId) -> Result<Option<Notification>>;

    async fn mark_all_notifications_read(&self, user_id: &RecordId) -> Result<()>;

    async fn delete_notification(&self, id: &RecordId) -> Result<()>;

    async fn fetch_conversations(&self, viewer: &Viewer) -> Result<Vec<Conversation>>;

    /// Find or create the conversation between a user and a staff member
    async fn open_conversation(&self, user_id: &RecordId, staff_id: &RecordId) -> Result<Conversation>;

    async fn fetch_messages(&self, conversation_id: &RecordId) -> Result<Vec<Message>>;

    async fn mark_conversation_read(&self, conversation_id: &RecordId, is_user: bool) -> Result<()>;

    async fn send_message(&self, conversation_id: &RecordId, message: &NewMessage) -> Result<Message>;
}

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// [`RestApi`] over HTTP/1.1 with JSON bodies
#[derive(Clone)]
pub struct HttpRestClient {
    base_url: String,
    client: HttpClient,
    timeout: Duration,
}

impl HttpRestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            base_url,
            client,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let uri: Uri = url
            .parse()
            .map_err(|e| RealtimeError::Config(format!("Invalid URL {}: {}", url, e)))?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(ACCEPT, "application/json");
        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(serde_json::to_vec(&json)?))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(body)
            .map_err(|e| RealtimeError::Request(format!("{} {}: {}", method, path, e)))?;

        let response: Response<Incoming> = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| RealtimeError::Timeout(format!("{} {} after {:?}", method, path, self.timeout)))?
            .map_err(|e| RealtimeError::Request(format!("{} {}: {}", method, path, e)))?;

        let status = response.status();
        let bytes = timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| RealtimeError::Timeout(format!("{} {} body after {:?}", method, path, self.timeout)))?
            .map_err(|e| RealtimeError::Request(format!("{} {} body: {}", method, path, e)))?
            .to_bytes();
        debug!("{} {} -> {} ({} bytes)", method, path, status, bytes.len());

        if !status.is_success() {
            let body: String = String::from_utf8_lossy(&bytes).chars().take(512).collect();
            return Err(RealtimeError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        // Some mutation endpoints answer with plain text
        Ok(serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
    }
}

fn segment(id: &RecordId) -> String {
    urlencoding::encode(id.as_str()).into_owned()
}

/// Accept a bare array or an array wrapped in a common envelope key.
fn extract_list(value: Value, envelope: &[&str]) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::Object(mut fields) => {
            for key in ["data", "content"].iter().chain(envelope) {
                if let Some(Value::Array(items)) = fields.remove(*key) {
                    return Ok(items);
                }
            }
            Err(RealtimeError::Protocol("expected a JSON array".to_string()))
        }
        _ => Err(RealtimeError::Protocol("expected a JSON array".to_string())),
    }
}

fn extract_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(fields) => ["count", "unreadCount", "unread_count"]
            .iter()
            .find_map(|key| fields.get(*key))
            .and_then(extract_count),
        _ => None,
    }
}

#[async_trait]
impl RestApi for HttpRestClient {
    async fn fetch_notifications(&self, user_id: &RecordId) -> Result<Vec<Notification>> {
        let body = self
            .call(Method::GET, &format!("/notifications/user/{}", segment(user_id)), None)
            .await?;
        Ok(normalize_list(extract_list(body, &["notifications"])?, "notification"))
    }

    async fn fetch_unread_count(&self, user_id: &RecordId) -> Result<u64> {
        let body = self
            .call(
                Method::GET,
                &format!("/notifications/user/{}/unread-count", segment(user_id)),
                None,
            )
            .await?;
        extract_count(&body).ok_or_else(|| RealtimeError::Protocol(format!("unexpected unread-count body: {}", body)))
    }

    async fn mark_notification_read(&self, id: &RecordId, user_id: &RecordId) -> Result<Option<Notification>> {
        let path = format!(
            "/notifications/{}/read?userId={}",
            segment(id),
            urlencoding::encode(user_id.as_str())
        );
        let body = self.call(Method::PUT, &path, None).await?;
        Ok(serde_json::from_value(body).ok())
    }

    async fn mark_all_notifications_read(&self, user_id: &RecordId) -> Result<()> {
        self.call(
            Method::PUT,
            &format!("/notifications/user/{}/read-all", segment(user_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_notification(&self, id: &RecordId) -> Result<()> {
        self.call(Method::DELETE, &format!("/notifications/{}", segment(id)), None)
            .await?;
        Ok(())
    }

    async fn fetch_conversations(&self, viewer: &Viewer) -> Result<Vec<Conversation>> {
        let path = match viewer.role {
            SenderRole::Staff => format!("/conversations/staff/{}", segment(&viewer.id)),
            SenderRole::User => format!("/conversations/user/{}", segment(&viewer.id)),
        };
        let body = self.call(Method::GET, &path, None).await?;
        Ok(normalize_list(extract_list(body, &["conversations"])?, "conversation"))
    }

    async fn open_conversation(&self, user_id: &RecordId, staff_id: &RecordId) -> Result<Conversation> {
        let body = serde_json::json!({ "userId": user_id, "staffId": staff_id });
        let created = self.call(Method::POST, "/conversations", Some(body)).await?;
        Ok(serde_json::from_value(created)?)
    }

    async fn fetch_messages(&self, conversation_id: &RecordId) -> Result<Vec<Message>> {
        let body = self
            .call(
                Method::GET,
                &format!("/conversations/{}/messages", segment(conversation_id)),
                None,
            )
            .await?;
        let mut items = extract_list(body, &["messages"])?;
        for item in items.iter_mut() {
            fill_missing(item, &["conversationId", "conversation_id"], serde_json::json!(conversation_id));
        }
        Ok(normalize_list(items, "message"))
    }

    async fn mark_conversation_read(&self, conversation_id: &RecordId, is_user: bool) -> Result<()> {
        let path = format!("/conversations/{}/read?isUser={}", segment(conversation_id), is_user);
        self.call(Method::PUT, &path, None).await?;
        Ok(())
    }

    async fn send_message(&self, conversation_id: &RecordId, message: &NewMessage) -> Result<Message> {
        let path = format!("/conversations/{}/messages", segment(conversation_id));
        let mut created = self
            .call(Method::POST, &path, Some(serde_json::to_value(message)?))
            .await?;
        fill_missing(&mut created, &["conversationId", "conversation_id"], serde_json::json!(conversation_id));
        fill_missing(&mut created, &["senderType", "sender_type"], serde_json::json!(message.sender_type));
        fill_missing(&mut created, &["senderId", "sender_id"], serde_json::json!(message.sender_id));
        fill_missing(&mut created, &["content", "message", "text"], serde_json::json!(message.content));
        Ok(serde_json::from_value(created)?)
    }
}

/// Echo a request field into a response record that omits it.
fn fill_missing(record: &mut Value, keys: &[&str], value: Value) {
    if let Value::Object(fields) = record {
        if !keys.iter().any(|k| fields.get(*k).is_some_and(|v| !v.is_null())) {
            fields.insert(keys[0].to_string(), value);
        }
    }
}
