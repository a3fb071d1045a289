use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio::time::{Duration, sleep};
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::traits::{InboundHandler, RpcResult};
use crate::types::NodeId;

use super::{Request, Response, Transport};

// --- 模拟网络配置 ---

/// 模拟网络行为的配置
#[derive(Debug, Clone, Default)]
pub struct MockNetworkConfig {
    /// 基础延迟 (毫秒)
    pub base_latency_ms: u64,
    /// 额外随机延迟的最大值 (毫秒)
    pub jitter_max_ms: u64,
    /// 消息丢失的概率 (0.0 - 1.0)
    pub drop_rate: f64,
}

/// In-process network joining the nodes of one test cluster.
///
/// Requests are handed straight to the target's `InboundHandler`. Nodes can be
/// cut off with `isolate` and reconnected with `heal`.
#[derive(Clone, Default)]
pub struct MockNetworkHub {
    inner: Arc<MockNetworkHubInner>,
}

#[derive(Default)]
struct MockNetworkHubInner {
    handlers: RwLock<HashMap<NodeId, Arc<dyn InboundHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
    /// Directed links that drop everything: (from, to)
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
    config: RwLock<MockNetworkConfig>,
}

impl MockNetworkHub {
    pub fn new(config: MockNetworkConfig) -> Self {
        let hub = Self::default();
        *hub.inner.config.write() = config;
        hub
    }

    pub fn register_node(&self, id: NodeId, handler: Arc<dyn InboundHandler>) {
        debug!("Mock network: registered {}", id);
        self.inner.handlers.write().insert(id, handler);
    }

    pub fn unregister_node(&self, id: &NodeId) {
        self.inner.handlers.write().remove(id);
    }

    pub fn update_config(&self, config: MockNetworkConfig) {
        *self.inner.config.write() = config;
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: &NodeId) {
        debug!("Mock network: isolating {}", id);
        self.inner.isolated.write().insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        debug!("Mock network: healing {}", id);
        self.inner.isolated.write().remove(id);
    }

    /// Drop traffic sent from `from` to `to`; the reverse direction still works.
    pub fn cut(&self, from: &NodeId, to: &NodeId) {
        self.inner
            .cut_links
            .write()
            .insert((from.clone(), to.clone()));
    }

    pub fn heal_all(&self) {
        self.inner.isolated.write().clear();
        self.inner.cut_links.write().clear();
    }

    fn reachable(&self, from: &NodeId, target: &NodeId) -> bool {
        let isolated = self.inner.isolated.read();
        if isolated.contains(from) || isolated.contains(target) {
            return false;
        }
        !self
            .inner
            .cut_links
            .read()
            .contains(&(from.clone(), target.clone()))
    }

    fn delay_or_drop(&self) -> RpcResult<Option<Duration>> {
        let config = self.inner.config.read().clone();
        let mut rng = rand::rng();
        if config.drop_rate > 0.0 && rng.random_bool(config.drop_rate.min(1.0)) {
            return Err(RpcError::Network("message dropped".into()));
        }
        let jitter = if config.jitter_max_ms > 0 {
            rng.random_range(0..=config.jitter_max_ms)
        } else {
            0
        };
        let latency = config.base_latency_ms + jitter;
        Ok((latency > 0).then(|| Duration::from_millis(latency)))
    }
}

#[async_trait]
impl Transport for MockNetworkHub {
    async fn call(&self, from: &NodeId, target: &NodeId, request: Request) -> RpcResult<Response> {
        if !self.reachable(from, target) {
            return Err(RpcError::Network(format!("{} cannot reach {}", from, target)));
        }
        let handler = self
            .inner
            .handlers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))?;

        if let Some(delay) = self.delay_or_drop()? {
            sleep(delay).await;
        }
        trace!("Mock network: {} -> {} {}", from, target, request.kind());
        let response = handler.handle(request).await;

        // a partition raised while the call was in flight loses the reply
        if !self.reachable(target, from) {
            return Err(RpcError::Network(format!("{} cannot reach {}", target, from)));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeartbeatRequest;
    use crate::traits::RpcChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InboundHandler for CountingHandler {
        async fn handle(&self, _request: Request) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Response::Ack
        }
    }

    fn heartbeat() -> HeartbeatRequest {
        HeartbeatRequest {
            group: "g".into(),
            term: 1,
            leader_id: "a".into(),
            commit_index: 0,
        }
    }

    #[tokio::test]
    async fn test_delivery_and_isolation() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let handler = Arc::new(CountingHandler::default());
        hub.register_node("b".into(), handler.clone());

        let (a, b) = ("a".to_string(), "b".to_string());
        hub.send_heartbeat(&a, &b, heartbeat()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        hub.isolate(&b);
        assert!(matches!(
            hub.send_heartbeat(&a, &b, heartbeat()).await,
            Err(RpcError::Network(_))
        ));
        hub.heal(&b);
        hub.send_heartbeat(&a, &b, heartbeat()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_way_cut() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let handler = Arc::new(CountingHandler::default());
        hub.register_node("b".into(), handler.clone());

        let (a, b) = ("a".to_string(), "b".to_string());
        hub.cut(&b, &a);
        // request arrives, reply is lost
        assert!(hub.send_heartbeat(&a, &b, heartbeat()).await.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        hub.heal_all();
        assert!(hub.send_heartbeat(&a, &b, heartbeat()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let result = hub
            .send_heartbeat(&"a".to_string(), &"zz".to_string(), heartbeat())
            .await;
        assert!(matches!(result, Err(RpcError::NodeNotFound(id)) if id == "zz"));
    }

    #[tokio::test]
    async fn test_drop_rate_one_drops_everything() {
        let hub = MockNetworkHub::new(MockNetworkConfig {
            drop_rate: 1.0,
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        hub.register_node("b".into(), handler.clone());
        for _ in 0..5 {
            assert!(
                hub.send_heartbeat(&"a".to_string(), &"b".to_string(), heartbeat())
                    .await
                    .is_err()
            );
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
