//!
//! This module defines connection related structs.
//!
//!

use crate::error::{self, ClientError};
use crate::frame::{self, Frame};
use bytes::{self, Buf, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    /// Establish a connection to the given socket address.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rocketmq_client::connection::Connection;
    /// use std::net::SocketAddr;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///    let endpoint = "127.0.0.1:9876";
    ///    let socket_addr = endpoint.parse::<SocketAddr>().unwrap();
    ///    let connection = Connection::new(&socket_addr).await.unwrap();
    /// }
    ///
    /// ```
    ///
    /// # Errors
    /// Raise ClientError::Connect if connection may not be established.
    pub async fn new(endpoint: &SocketAddr) -> Result<Self, error::ClientError> {
        let tcp_stream =
            TcpStream::connect(endpoint)
                .await
                .map_err(|e| error::ClientError::Connect {
                    addr: endpoint.to_string(),
                    source: e,
                })?;

        Ok(Connection::from_stream(tcp_stream))
    }

    pub(crate) fn from_stream(tcp_stream: TcpStream) -> Self {
        Connection {
            stream: BufWriter::new(tcp_stream),
            buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<frame::Frame>, ClientError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ClientError::ConnectionReset);
                }
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let buf = frame.encode()?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn parse_frame(&mut self) -> Result<Option<frame::Frame>, ClientError> {
        let mut buf = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;
                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;
                self.buffer.advance(len);
                Ok(frame)
            }

            Err(frame::Error::Incomplete) => Ok(None),

            Err(frame::Error::Other(e)) => Err(e),
        }
    }
}

/// Caches one connection per remote address and correlates responses to requests.
///
/// Requests on the same address are serialized on its connection.
pub(crate) struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Connection>>>>,
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Send `request` to `addr` and wait for the response carrying the same opaque.
    pub(crate) async fn invoke(
        &self,
        addr: &str,
        request: &Frame,
        timeout: Duration,
    ) -> Result<Frame, ClientError> {
        let result = tokio::time::timeout(timeout, self.exchange(addr, request))
            .await
            .unwrap_or_else(|_| Err(ClientError::Timeout(timeout.as_millis())));
        if result.is_err() {
            // The stream may hold a partial exchange; start over next time.
            self.evict(addr);
        }
        result
    }

    /// Write `request` to `addr` without waiting for any response.
    pub(crate) async fn invoke_oneway(
        &self,
        addr: &str,
        request: &Frame,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let result = tokio::time::timeout(timeout, self.write_only(addr, request))
            .await
            .unwrap_or_else(|_| Err(ClientError::Timeout(timeout.as_millis())));
        if result.is_err() {
            self.evict(addr);
        }
        result
    }

    async fn exchange(&self, addr: &str, request: &Frame) -> Result<Frame, ClientError> {
        let connection = self.connection(addr).await?;
        let mut connection = connection.lock().await;
        connection.write_frame(request).await?;
        loop {
            match connection.read_frame().await? {
                Some(frame)
                    if frame.frame_type() == frame::Type::Response
                        && frame.opaque == request.opaque =>
                {
                    return Ok(frame)
                }
                Some(frame) => {
                    debug!(
                        addr,
                        opaque = frame.opaque,
                        "Discard response of an abandoned request"
                    );
                }
                None => return Err(ClientError::ConnectionReset),
            }
        }
    }

    async fn write_only(&self, addr: &str, request: &Frame) -> Result<(), ClientError> {
        let connection = self.connection(addr).await?;
        let mut connection = connection.lock().await;
        connection.write_frame(request).await
    }

    pub(crate) fn close_all(&self) {
        match self.connections.lock() {
            Ok(mut map) => map.clear(),
            Err(e) => warn!("Lock is poisoned. Cause: {}", e),
        }
    }

    async fn connection(
        &self,
        addr: &str,
    ) -> Result<Arc<tokio::sync::Mutex<Connection>>, ClientError> {
        {
            let map = self.connections.lock().map_err(|e| {
                warn!("Lock is poisoned. Cause: {}", e);
                ClientError::Unknown
            })?;
            if let Some(connection) = map.get(addr) {
                return Ok(Arc::clone(connection));
            }
        }

        let endpoint: SocketAddr = addr
            .parse()
            .map_err(|_e| ClientError::BadAddress(addr.to_string()))?;
        let connection = Arc::new(tokio::sync::Mutex::new(Connection::new(&endpoint).await?));
        debug!(addr, "Established connection");

        let mut map = self.connections.lock().map_err(|_e| ClientError::Unknown)?;
        let entry = map
            .entry(addr.to_owned())
            .or_insert_with(|| Arc::clone(&connection));
        Ok(Arc::clone(entry))
    }

    fn evict(&self, addr: &str) {
        if let Ok(mut map) = self.connections.lock() {
            map.remove(addr);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::RequestCode;
    use std::future::Future;
    use tokio::net::TcpListener;

    /// Accept connections on an ephemeral port and answer each request with `handler`.
    /// A handler returning `None` leaves the request unanswered.
    pub(crate) async fn serve<F, Fut>(handler: F) -> SocketAddr
    where
        F: Fn(Frame) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Option<Frame>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut connection = Connection::from_stream(stream);
                    while let Ok(Some(request)) = connection.read_frame().await {
                        if let Some(response) = handler(request).await {
                            if connection.write_frame(&response).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_read_write_frame() -> Result<(), ClientError> {
        let addr = serve(|request: Frame| async move {
            let mut response = Frame::response(request.opaque, 0, "pong");
            response.body = request.body();
            Some(response)
        })
        .await;

        let mut connection = Connection::new(&addr).await?;
        let mut frame = Frame::request(RequestCode::GetRouteInfoByTopic);
        frame.put_ext_field("topic", "T1");
        frame.body = bytes::Bytes::from("ping");
        connection.write_frame(&frame).await?;

        let response = connection.read_frame().await?.ok_or(ClientError::Unknown)?;
        assert_eq!(response.frame_type(), frame::Type::Response);
        assert_eq!(response.opaque, frame.opaque);
        assert_eq!(response.remark(), "pong");
        assert_eq!(&response.body()[..], b"ping");
        Ok(())
    }

    #[tokio::test]
    async fn test_invoke_reuses_connection() -> Result<(), ClientError> {
        let addr = serve(|request: Frame| async move {
            Some(Frame::response(request.opaque, 0, ""))
        })
        .await
        .to_string();

        let manager = ConnectionManager::new();
        for _ in 0..3 {
            let request = Frame::request(RequestCode::GetRouteInfoByTopic);
            let response = manager
                .invoke(&addr, &request, Duration::from_secs(3))
                .await?;
            assert_eq!(response.opaque, request.opaque);
        }
        assert_eq!(manager.connections.lock().map(|m| m.len()).unwrap_or(0), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invoke_times_out_and_evicts() {
        let addr = serve(|_request: Frame| async move { None }).await.to_string();

        let manager = ConnectionManager::new();
        let request = Frame::request(RequestCode::SendMessage);
        let result = manager
            .invoke(&addr, &request, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(100))));
        assert_eq!(manager.connections.lock().map(|m| m.len()).unwrap_or(1), 0);
    }

    #[tokio::test]
    async fn test_bad_address() {
        let manager = ConnectionManager::new();
        let request = Frame::request(RequestCode::SendMessage);
        let result = manager
            .invoke("not-an-address", &request, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::BadAddress(_))));
    }
}
