use std::sync::Arc;

use anyhow::Result;

use hmq::context::ServerContext;
use hmq::logger::logger_init;
use hmq::net::Builder;
use hmq::node::Node;
use hmq::server::HmqServer;
use hmq::settings::{Options, Settings};
use hmq::storage::FileStorage;

fn parse_args() -> Options {
    let mut opts = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cfg" | "-c" => opts.cfg_name = args.next(),
            "--node-id" => opts.node_id = args.next().and_then(|v| v.parse().ok()),
            "--storage-dir" => opts.storage_dir = args.next(),
            other => {
                // a bare argument is treated as the config file, matching
                // older releases
                if !other.starts_with('-') && opts.cfg_name.is_none() {
                    opts.cfg_name = Some(other.to_string());
                }
            }
        }
    }
    opts
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Settings::init(parse_args())?.clone();
    logger_init(&cfg)?;
    log::info!("{:?}", cfg);

    let mut builder = ServerContext::new()
        .node(Node::new(cfg.node.id, cfg.node.name.clone()))
        .auto_queue_creation(cfg.broker.auto_queue_creation)
        .default_ack_timeout(cfg.broker.default_ack_timeout)
        .response_timeout(cfg.broker.response_timeout)
        .queue_defaults(cfg.queue.clone());

    if let Some(dir) = cfg.broker.storage_dir.as_ref() {
        builder = builder.storage(Arc::new(FileStorage::new(dir)?));
    }
    let scx = builder.build().await;

    let mut server = HmqServer::new(scx);
    for l in cfg.listeners.iter() {
        let builder = Builder::new()
            .name(&l.name)
            .laddr(l.addr)
            .max_connections(l.max_connections)
            .max_frame_size(l.max_frame_size)
            .backlog(l.backlog)
            .nodelay(l.nodelay)
            .handshake_timeout(l.handshake_timeout)
            .send_timeout(l.send_timeout)
            .idle_timeout(l.idle_timeout)
            .tls_cross_certificate(l.cross_certificate)
            .tls_cert(l.cert.clone())
            .tls_key(l.key.clone());

        let listener = builder.bind()?;
        let listener = if l.is_tls() { listener.tls()? } else { listener.tcp()? };
        server = server.listener(listener);
    }

    server.build().run().await?;
    Ok(())
}
