//! Transport seam for the signaling channel
//!
//! The channel only needs a text-frame sink and stream; how those frames
//! move is behind [`SignalingConnector`]. Production uses the WebSocket
//! connector, tests plug in in-memory transports.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Writing half of a connected transport
pub type TransportSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Reading half of a connected transport; ends when the transport closes
pub type TransportStream = BoxStream<'static, Result<String>>;

/// Opens signaling transports on demand
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a transport to the given URL and split it into halves
    async fn connect(&self, url: &Url) -> Result<(TransportSink, TransportStream)>;
}

/// Production connector: WebSocket text frames via tokio-tungstenite
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<(TransportSink, TransportStream)> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (sink, stream) = ws.split();

        let sink: TransportSink = Box::pin(
            sink.sink_map_err(|e| Error::WebSocketError(e.to_string()))
                .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text)))),
        );

        // Ping/pong is handled by tungstenite itself; only text frames are
        // protocol messages. A close frame ends the stream shortly after.
        let stream: TransportStream = stream
            .filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::WebSocketError(e.to_string()))),
                })
            })
            .boxed();

        Ok((sink, stream))
    }
}
