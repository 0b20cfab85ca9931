use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use itertools::Itertools;
use rust_box::task_exec_queue::SpawnExt;

use crate::context::ServerContext;
use crate::net::{Listener, ListenerType, Result};
use crate::session;

pub struct HmqServerBuilder {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl HmqServerBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::default() }
    }

    pub fn listener(mut self, listen: Listener) -> Self {
        self.listeners.push(listen);
        self
    }

    pub fn listeners<I: IntoIterator<Item = Listener>>(mut self, listens: I) -> Self {
        self.listeners.extend(listens);
        self
    }

    pub fn build(self) -> HmqServer {
        HmqServer { inner: Arc::new(HmqServerInner { scx: self.scx, listeners: self.listeners }) }
    }
}

#[derive(Clone)]
pub struct HmqServer {
    inner: Arc<HmqServerInner>,
}

pub struct HmqServerInner {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl Deref for HmqServer {
    type Target = HmqServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl HmqServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> HmqServerBuilder {
        HmqServerBuilder::new(scx)
    }

    pub fn start(self) {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Failed to start the HMQ broker! {}", e);
                std::process::exit(1);
            }
        });
    }

    pub async fn run(self) -> Result<()> {
        futures::future::join_all(
            self.listeners
                .iter()
                .map(|l| match l.typ {
                    ListenerType::TCP => listen_tcp(self.scx.clone(), l).boxed(),
                    #[cfg(feature = "tls")]
                    ListenerType::TLS => listen_tls(self.scx.clone(), l).boxed(),
                })
                .collect_vec(),
        )
        .await;
        Ok(())
    }
}

async fn listen_tcp(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("tcp listen addr:{:?}, remote addr:{:?}", a.cfg.laddr, a.remote_addr);
                    let d = match a.tcp() {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!("Failed to hmq(tcp) accept, {:?}", e);
                            return;
                        }
                    };

                    scx.handshakings.inc();
                    let exec = scx.global_exec.clone();
                    let stream = match d.hmq().spawn(&exec).result().await {
                        Ok(Ok(stream)) => {
                            scx.handshakings.dec();
                            stream
                        }
                        Ok(Err(e)) => {
                            scx.handshakings.dec();
                            log::info!("Failed hmq(tcp) handshake, {:?}", e);
                            return;
                        }
                        Err(e) => {
                            scx.handshakings.dec();
                            log::info!("hmq(tcp) handshake execute error, {:?}", e.to_string());
                            return;
                        }
                    };

                    if let Err(e) = session::process(scx, stream).await {
                        log::warn!("Failed to process hmq(tcp) session, {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to accept TCP socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

#[cfg(feature = "tls")]
async fn listen_tls(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("tls listen addr:{:?}, remote addr:{:?}", a.cfg.laddr, a.remote_addr);
                    let d = match a.tls().await {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!("Failed to hmq(tls) accept, {:?}", e);
                            return;
                        }
                    };

                    scx.handshakings.inc();
                    let exec = scx.global_exec.clone();
                    let stream = match d.hmq().spawn(&exec).result().await {
                        Ok(Ok(stream)) => {
                            scx.handshakings.dec();
                            stream
                        }
                        Ok(Err(e)) => {
                            scx.handshakings.dec();
                            log::info!("Failed hmq(tls) handshake, {:?}", e);
                            return;
                        }
                        Err(e) => {
                            scx.handshakings.dec();
                            log::info!("hmq(tls) handshake execute error, {:?}", e.to_string());
                            return;
                        }
                    };

                    if let Err(e) = session::process(scx, stream).await {
                        log::warn!("Failed to process hmq(tls) session, {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to accept TLS socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}
