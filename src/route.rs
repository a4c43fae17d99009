//!
//! This module defines RouteManager to dynamically fetch and refresh routes for each topic in use.
//!
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::frame::{Frame, RequestCode};
use crate::protocol::{self, response_code, GetRouteInfoRequestHeader};
use bytes::Buf;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(30);

struct CachedRoute {
    route: Arc<protocol::TopicRouteData>,
    fetched_at: Instant,
}

/// RouteManager maintains route entries for each topic.
pub(crate) struct RouteManager {
    /// Name server endpoints remain constant after construction.
    endpoints: Vec<String>,

    /// Topic routes are refetched once older than `ttl`, or after a failed send invalidates them.
    topic_routes: Mutex<HashMap<String, CachedRoute>>,

    ttl: Duration,
}

impl RouteManager {
    /// Parse a `;` separated name server list. Unparsable entries are skipped.
    pub(crate) fn new(addrs: &str) -> Result<Self, ClientError> {
        let endpoints: Vec<String> = addrs
            .split(';')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .flat_map(|addr| match addr.parse::<SocketAddr>() {
                Ok(socket_addr) => Some(socket_addr.to_string()),
                Err(e) => {
                    warn!(
                        "Failed to parse name server address {}. Cause: {}",
                        addr, e
                    );
                    None
                }
            })
            .collect();
        if endpoints.is_empty() {
            return Err(ClientError::BadAddress(addrs.to_owned()));
        }
        Ok(Self {
            endpoints,
            topic_routes: Mutex::new(HashMap::new()),
            ttl: DEFAULT_ROUTE_TTL,
        })
    }

    pub(crate) fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cached route of `topic`, querying name servers in order on a miss or once the entry expired.
    ///
    /// An expired entry is still served when no name server answers.
    pub(crate) async fn route(
        &self,
        topic: &str,
        connections: &ConnectionManager,
        timeout: Duration,
    ) -> Result<Arc<protocol::TopicRouteData>, ClientError> {
        let stale = match self.cached(topic)? {
            Some((route, fetched_at)) if fetched_at.elapsed() < self.ttl => return Ok(route),
            Some((route, _)) => Some(route),
            None => None,
        };

        let mut last_error = ClientError::NoRoute(topic.to_owned());
        for endpoint in &self.endpoints {
            match self.fetch(endpoint, topic, connections, timeout).await {
                Ok(route) => {
                    let route = Arc::new(route);
                    let mut guard = self.topic_routes.lock().map_err(|e| {
                        warn!("Lock is poisoned. Cause: {}", e);
                        ClientError::Unknown
                    })?;
                    guard.insert(
                        topic.to_owned(),
                        CachedRoute {
                            route: Arc::clone(&route),
                            fetched_at: Instant::now(),
                        },
                    );
                    return Ok(route);
                }
                Err(ClientError::NoRoute(_)) => {
                    self.invalidate(topic);
                    return Err(ClientError::NoRoute(topic.to_owned()));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, topic, error = %e, "Failed to query route");
                    last_error = e;
                }
            }
        }
        match stale {
            Some(route) => {
                warn!(topic, "Keep using an expired route. Cause: {}", last_error);
                Ok(route)
            }
            None => Err(last_error),
        }
    }

    pub(crate) fn invalidate(&self, topic: &str) {
        if let Ok(mut guard) = self.topic_routes.lock() {
            guard.remove(topic);
        }
    }

    fn cached(
        &self,
        topic: &str,
    ) -> Result<Option<(Arc<protocol::TopicRouteData>, Instant)>, ClientError> {
        let guard = match self.topic_routes.lock() {
            Ok(map) => map,
            Err(e) => {
                warn!("Lock is poisoned. Cause: {}", e);
                return Err(ClientError::Unknown);
            }
        };
        Ok(guard
            .get(topic)
            .map(|entry| (Arc::clone(&entry.route), entry.fetched_at)))
    }

    async fn fetch(
        &self,
        endpoint: &str,
        topic: &str,
        connections: &ConnectionManager,
        timeout: Duration,
    ) -> Result<protocol::TopicRouteData, ClientError> {
        let mut request = Frame::request(RequestCode::GetRouteInfoByTopic);
        request.add_ext_headers(GetRouteInfoRequestHeader::new(topic));
        let response = connections.invoke(endpoint, &request, timeout).await?;
        match response.code {
            response_code::SUCCESS => {
                let route: protocol::TopicRouteData =
                    serde_json::from_reader(response.body().reader()).map_err(|_e| {
                        ClientError::InvalidFrame("Response body is invalid JSON".to_owned())
                    })?;
                debug!(endpoint, topic, "Fetched topic route");
                Ok(route)
            }
            response_code::TOPIC_NOT_EXIST => Err(ClientError::NoRoute(topic.to_owned())),
            code => Err(ClientError::Broker {
                addr: endpoint.to_owned(),
                code,
                remark: response.remark().to_owned(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::RouteManager;
    use crate::connection::tests::serve;
    use crate::connection::ConnectionManager;
    use crate::error::ClientError;
    use crate::frame::Frame;
    use crate::protocol::response_code;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Route JSON with one broker named `b1` at `broker_addr` hosting `queues` writable queues.
    pub(crate) fn route_json(broker_addr: &str, queues: i32) -> String {
        format!(
            r#"{{"brokerDatas":[{{"brokerAddrs":{{"0":"{}"}},"brokerName":"b1","cluster":"C1"}}],"filterServerTable":{{}},"queueDatas":[{{"brokerName":"b1","perm":6,"readQueueNums":{},"topicSynFlag":0,"writeQueueNums":{}}}]}}"#,
            broker_addr, queues, queues
        )
    }

    #[test]
    fn test_route_manager_new() -> Result<(), Box<dyn std::error::Error>> {
        let addrs = "8.8.8.8:80;4.4.4.4.3:80";
        let manager = RouteManager::new(addrs)?;
        assert_eq!(manager.endpoints, vec!["8.8.8.8:80".to_owned()]);

        assert!(matches!(
            RouteManager::new("localhost;"),
            Err(ClientError::BadAddress(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_route_is_fetched_once() -> Result<(), ClientError> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let name_server = serve(move |request: Frame| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(request.ext_field("topic"), Some("T1"));
                let mut response = Frame::response(request.opaque, response_code::SUCCESS, "");
                response.body = bytes::Bytes::from(route_json("127.0.0.1:10911", 4));
                Some(response)
            }
        })
        .await;

        let manager = RouteManager::new(&name_server.to_string())?;
        let connections = ConnectionManager::new();
        let timeout = Duration::from_secs(3);
        let route = manager.route("T1", &connections, timeout).await?;
        assert_eq!(route.message_queues("T1").len(), 4);
        assert_eq!(route.master_address("b1"), Some("127.0.0.1:10911"));

        manager.route("T1", &connections, timeout).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager.invalidate("T1");
        manager.route("T1", &connections, timeout).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_route_is_refetched() -> Result<(), ClientError> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let name_server = serve(move |request: Frame| {
            let counter = Arc::clone(&counter);
            async move {
                // The second lookup sees the topic grow from 2 to 4 queues.
                let queues = if counter.fetch_add(1, Ordering::SeqCst) == 0 { 2 } else { 4 };
                let mut response = Frame::response(request.opaque, response_code::SUCCESS, "");
                response.body = bytes::Bytes::from(route_json("127.0.0.1:10911", queues));
                Some(response)
            }
        })
        .await;

        let manager =
            RouteManager::new(&name_server.to_string())?.with_ttl(Duration::from_millis(50));
        let connections = ConnectionManager::new();
        let timeout = Duration::from_secs(3);
        let route = manager.route("T1", &connections, timeout).await?;
        assert_eq!(route.message_queues("T1").len(), 2);
        manager.route("T1", &connections, timeout).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let route = manager.route("T1", &connections, timeout).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(route.message_queues("T1").len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_route_survives_name_server_outage() -> Result<(), ClientError> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let name_server = serve(move |request: Frame| {
            let counter = Arc::clone(&counter);
            async move {
                let code = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    response_code::SUCCESS
                } else {
                    1
                };
                let mut response = Frame::response(request.opaque, code, "");
                response.body = bytes::Bytes::from(route_json("127.0.0.1:10911", 2));
                Some(response)
            }
        })
        .await;

        let manager =
            RouteManager::new(&name_server.to_string())?.with_ttl(Duration::from_millis(50));
        let connections = ConnectionManager::new();
        let timeout = Duration::from_secs(3);
        manager.route("T1", &connections, timeout).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let route = manager.route("T1", &connections, timeout).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(route.message_queues("T1").len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_topic_not_exist() -> Result<(), ClientError> {
        let name_server = serve(|request: Frame| async move {
            Some(Frame::response(
                request.opaque,
                response_code::TOPIC_NOT_EXIST,
                "No topic route info in name server for the topic: T2",
            ))
        })
        .await;

        let manager = RouteManager::new(&name_server.to_string())?;
        let result = manager
            .route("T2", &ConnectionManager::new(), Duration::from_secs(3))
            .await;
        assert!(matches!(result, Err(ClientError::NoRoute(topic)) if topic == "T2"));
        Ok(())
    }
}
