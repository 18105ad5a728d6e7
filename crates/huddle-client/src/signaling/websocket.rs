use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::{Connection, Connector, LinkFrame};
use crate::error::{EngineError, Result};

/// Opens signaling links over WebSocket (`ws://` or `wss://`)
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| EngineError::TransportFailure(e.to_string()))?;

        tracing::debug!("WebSocket connected to {}", strip_query(url));

        Ok(Box::new(WsConnection { stream: ws_stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| EngineError::TransportFailure(e.to_string()))
    }

    async fn recv(&mut self) -> LinkFrame {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return LinkFrame::Text(text.as_str().to_owned()),
                Some(Ok(Message::Close(frame))) => {
                    return LinkFrame::Closed(frame.map(|f| u16::from(f.code)));
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is handled automatically by tungstenite
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    return LinkFrame::Closed(None);
                }
                None => return LinkFrame::Closed(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close error: {}", e);
        }
    }
}

/// Drop the query string so tokens never reach the logs
fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
