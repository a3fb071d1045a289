use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::RpcError;
use crate::traits::{InboundHandler, RpcResult};
use crate::types::NodeId;

use super::{Request, Response, Transport, read_frame, write_frame};

/// Accepts peer connections and serves one request at a time per connection.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub async fn bind(addr: &str, handler: Arc<dyn InboundHandler>) -> RpcResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("RPC server listening on {}", local_addr);

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(Self::accept_loop(listener, handler, rx));
        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(Self::serve_connection(stream, handler.clone(), shutdown.clone()));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("RPC accept loop stopped");
    }

    async fn serve_connection(
        mut stream: TcpStream,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let request: Request = tokio::select! {
                frame = read_frame(&mut stream) => match frame {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Dropping connection: {}", e);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };
            let response = handler.handle(request).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                warn!("Failed to write response: {}", e);
                break;
            }
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Client side: one cached connection per peer, reconnected after an error.
pub struct TcpChannel {
    addrs: HashMap<NodeId, String>,
    connections: HashMap<NodeId, Arc<Mutex<Option<TcpStream>>>>,
    call_timeout: Duration,
}

impl TcpChannel {
    pub fn new(addrs: HashMap<NodeId, String>, call_timeout: Duration) -> Self {
        let connections = addrs
            .keys()
            .map(|id| (id.clone(), Arc::new(Mutex::new(None))))
            .collect();
        Self {
            addrs,
            connections,
            call_timeout,
        }
    }

    /// Callers bound each call more tightly; the channel's own limit covers a
    /// push that waits on the follower's recovery pull.
    pub fn from_config(config: &NodeConfig) -> Self {
        let addrs = config
            .peers
            .iter()
            .map(|peer| (peer.id.clone(), peer.addr.clone()))
            .collect();
        Self::new(addrs, config.rpc_timeout() + config.pull_timeout())
    }

    async fn exchange(
        stream: Option<TcpStream>,
        addr: &str,
        request: &Request,
    ) -> RpcResult<(TcpStream, Response)> {
        let mut stream = match stream {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                stream
            }
        };
        write_frame(&mut stream, request).await?;
        let response = read_frame(&mut stream)
            .await?
            .ok_or_else(|| RpcError::Network(format!("{} closed the connection", addr)))?;
        Ok((stream, response))
    }
}

#[async_trait]
impl Transport for TcpChannel {
    async fn call(&self, _from: &NodeId, target: &NodeId, request: Request) -> RpcResult<Response> {
        let addr = self
            .addrs
            .get(target)
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))?;
        let connection = self
            .connections
            .get(target)
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))?;

        let mut slot = connection.lock().await;
        // the stream is only cached again after a full reply; a cancelled
        // call drops it with the unread reply
        let stream = slot.take();
        match timeout(self.call_timeout, Self::exchange(stream, addr, &request)).await {
            Ok(Ok((stream, response))) => {
                *slot = Some(stream);
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Timeout),
        }
    }
}
