use super::{BoxFuture, SignalConnector, SignalLink};
use crate::error::Result;
use crate::protocol::SignalMessage;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }
}

impl futures::Stream for WsStream {
    type Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.0).poll_next(cx)
    }
}

impl futures::Sink<Message> for WsStream {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: Message) -> std::result::Result<(), Self::Error> {
        std::pin::Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Connects to the session's signalling endpoint over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self { url }
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl SignalConnector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn SignalLink>>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            tracing::info!(host = url.host_str().unwrap_or_default(), "Connected to signalling endpoint");
            Ok(Box::new(WsLink { stream: WsStream::new(ws_stream) }) as Box<dyn SignalLink>)
        })
    }
}

struct WsLink {
    stream: WsStream,
}

impl WsLink {
    async fn read(&mut self) -> Result<Option<SignalMessage>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received signal: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(err) => tracing::warn!("Dropping malformed signal message: {err}"),
                    }
                }
                Message::Close(_) => {
                    tracing::info!("Signalling connection closed by server");
                    return Ok(None);
                }
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                _ => (),
            }
        }
        Ok(None)
    }
}

impl SignalLink for WsLink {
    fn send(&mut self, message: SignalMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&message)?;
            tracing::trace!("Sending signal: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
            self.stream.send(Message::Text(json.into())).await?;
            Ok(())
        })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<SignalMessage>>> {
        Box::pin(self.read())
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream.close().await?;
            Ok(())
        })
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> Cow<'_, str> {
    if s.len() <= max_bytes {
        return Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let truncated = safe_truncate(&text, 5);
        assert!(truncated.starts_with("éé "));
        assert!(truncated.contains(TRACE_TRUNCATE_SUFFIX));
    }

    #[test]
    fn short_text_is_borrowed() {
        assert!(matches!(safe_truncate("hi", 10), Cow::Borrowed("hi")));
    }
}
