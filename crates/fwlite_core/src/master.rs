//! Master: binds the listener range and spawns accept loops.

use std::sync::Arc;
use std::time::Duration;

use fwlite_config::FwliteConfig;
use fwlite_policy::{DnsResolver, ProxyResolver, RuleResolver};
use fwlite_proxy::{ConnPool, ProxyEnv};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::worker::{WorkerCtx, handle_connection};

pub struct Master {
    cfg: Arc<FwliteConfig>,
    ctx: Arc<WorkerCtx>,
}

impl Master {
    pub fn new(cfg: FwliteConfig) -> Self {
        let cfg = Arc::new(cfg);
        let resolver = Arc::new(RuleResolver::from_config(&cfg));
        let dns = Arc::new(DnsResolver::new(&cfg.hosts));
        let pac_body = match cfg.fwlite.pac_file.as_str() {
            "" => None,
            path => match std::fs::read_to_string(path) {
                Ok(body) => Some(body),
                Err(e) => {
                    error!(target: "fwlite::master", %path, error = ?e, "pac file unreadable");
                    None
                }
            },
        };

        let shared_resolver: Arc<dyn ProxyResolver> = resolver.clone();
        let env = Arc::new(ProxyEnv {
            resolver: shared_resolver,
            dns,
            pool: ConnPool::new(cfg.fwlite.pool_depth),
            base_timeout: Duration::from_secs(cfg.fwlite.timeout_secs),
            x_forwarded_for: cfg.fwlite.x_forwarded_for,
            remote_api: cfg.fwlite.remote_api,
            listen_ports: cfg.listen_ports(),
            pac_body,
        });
        let ctx = Arc::new(WorkerCtx {
            env,
            resolver,
            keepalive_timeout: Duration::from_secs(cfg.fwlite.keepalive_timeout_secs),
        });

        Self { cfg, ctx }
    }

    /// Bind every profiled listener and serve until the process ends.
    pub async fn run(self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.fwlite.max_connections));
        self.spawn_listeners(semaphore).await?;

        info!(
            target: "fwlite::master",
            "master initialized; waiting for connections (Ctrl+C to stop)"
        );
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    async fn spawn_listeners(&self, semaphore: Arc<Semaphore>) -> anyhow::Result<()> {
        let host = self.cfg.listen_host().to_string();
        let base_port = self.cfg.base_port();

        for (i, level) in self.cfg.profile_levels().into_iter().enumerate() {
            let listen_addr = format!("{host}:{}", base_port + i as u16);
            info!(
                target: "fwlite::master",
                listen = %listen_addr,
                level,
                "preparing listener"
            );
            let listener = bind_listener(&listen_addr).await?;
            let semaphore = semaphore.clone();
            let ctx = self.ctx.clone();
            let addr_for_log = listen_addr.clone();

            tokio::spawn(async move {
                if let Err(e) = accept_loop(listener, listen_addr, level, semaphore, ctx).await {
                    error!(
                        target: "fwlite::master",
                        listen = %addr_for_log,
                        error = ?e,
                        "accept loop exited with an error"
                    );
                }
            });
        }
        Ok(())
    }
}

async fn bind_listener(listen_addr: &str) -> anyhow::Result<TcpListener> {
    match TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            info!(target: "fwlite::master", listen = %listen_addr, "bind successful");
            Ok(listener)
        }
        Err(e) => {
            error!(
                target: "fwlite::master",
                listen = %listen_addr,
                error = ?e,
                "failed to bind listener"
            );
            Err(e.into())
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    listen_addr: String,
    level: u8,
    semaphore: Arc<Semaphore>,
    ctx: Arc<WorkerCtx>,
) -> anyhow::Result<()> {
    info!(
        target: "fwlite::master",
        listen = %listen_addr,
        level,
        "accept loop started"
    );

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(
                    target: "fwlite::master",
                    listen = %listen_addr,
                    error = ?e,
                    "failed to accept connection"
                );
                return Err(e.into());
            }
        };
        let permit = semaphore.clone().acquire_owned().await?;
        let ctx = ctx.clone();
        let listen_for_span = listen_addr.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let span = tracing::info_span!(
                "worker_connection",
                client_addr = %addr,
                listen = %listen_for_span,
            );
            let _enter = span.enter();

            if let Err(e) = handle_connection(stream, addr, level, ctx).await {
                debug!(
                    target: "fwlite::worker",
                    client_addr = %addr,
                    error = ?e,
                    "connection ended with an error"
                );
            }
        });
    }
}
