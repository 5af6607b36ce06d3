//! Server-sent events transport for the notification stream.

use std::sync::Arc;

use futures::StreamExt;
use reqwest_eventsource::{retry, Event, EventSource};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{resolve_access_token, CredentialProvider};
use crate::connection::{Link, LinkEvents, OpenFuture, Transport};
use crate::error::{OpenError, TransportError};

/// Opens `GET <stream-url>?token=<token>` as an event stream.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, url: Url, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            url,
            credentials,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Stream URL with the token appended as a query parameter.
pub fn stream_url(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

impl Transport for SseTransport {
    fn open(&self, events: LinkEvents) -> OpenFuture {
        let client = self.client.clone();
        let base = self.url.clone();
        let credentials = Arc::clone(&self.credentials);

        Box::pin(async move {
            let token = resolve_access_token(credentials.as_ref()).await?;
            let url = stream_url(&base, &token.token);

            let mut source = EventSource::new(client.get(url))
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            // Reconnection belongs to the connection manager.
            source.set_retry_policy(Box::new(retry::Never));

            debug!(
                component = "sse",
                event = "sse.stream.opening",
                generation = events.generation(),
                endpoint = %base,
                "Opening notification stream"
            );

            let pump = tokio::spawn(pump(source, events));
            Ok::<_, OpenError>(Box::new(SseLink { pump: Some(pump) }) as Box<dyn Link>)
        })
    }

    fn describe(&self) -> String {
        format!("sse {}", self.url)
    }
}

async fn pump(mut source: EventSource, events: LinkEvents) {
    while let Some(next) = source.next().await {
        let delivered = match next {
            Ok(Event::Open) => {
                info!(
                    component = "sse",
                    event = "sse.stream.open",
                    generation = events.generation(),
                    "Notification stream open"
                );
                events.opened()
            }
            Ok(Event::Message(message)) => events.frame(message.event, message.data),
            Err(reqwest_eventsource::Error::StreamEnded) => {
                events.closed(Some("stream ended".to_string()));
                break;
            }
            Err(e) => {
                warn!(
                    component = "sse",
                    event = "sse.stream.error",
                    generation = events.generation(),
                    error = %e,
                    "Notification stream failed"
                );
                events.error(e.to_string());
                break;
            }
        };
        if !delivered {
            break;
        }
    }
    source.close();
}

/// Receive-only handle; events arrive through the pump task.
struct SseLink {
    pump: Option<JoinHandle<()>>,
}

impl Link for SseLink {
    // Every named event arrives on the one stream; nothing to register.
    fn listen(&mut self, _event: &str) {}

    fn emit(&mut self, _event: &str, _payload: &Value) -> Result<(), TransportError> {
        Err(TransportError::ReceiveOnly("notification stream"))
    }

    fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for SseLink {
    fn drop(&mut self) {
        self.close();
    }
}
