use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use actix_server::Server;
use actix_service::fn_service;
use log::{error, info};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::proxy::socks::socks5::serve_socks5;
use crate::proxy::socks::udp::{UdpRelay, UdpRelayRole};
use crate::proxy::ProxyContext;

mod common;
mod config;
mod crypto;
mod error;
mod proxy;

fn main() -> io::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(if config.verbose {
        "debug"
    } else {
        "info"
    }));
    info!("loaded config from {}", config_path);

    let ctx = match ProxyContext::from_config(&config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let local_ip: Option<IpAddr> = match config.local_address.as_deref() {
        Some(s) => match s.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                error!("invalid local_address: {}", s);
                std::process::exit(1);
            }
        },
        None => None,
    };

    actix_rt::System::new().block_on(async move {
        let udp = UdpRelay::new(
            UdpRelayRole::Local,
            ctx.clone(),
            local_ip,
            config.local_port,
        );
        if let Err(e) = udp.start().await {
            error!("UDP relay failed to start: {}", e);
            return Err(e);
        }

        let listen = format!(
            "{}:{}",
            local_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            config.local_port
        );
        info!("local listening at {}", listen);
        let service_ctx = ctx.clone();
        let server = Server::build().bind("socks", listen, move || {
            let ctx = service_ctx.clone();
            fn_service(move |io: TcpStream| {
                let ctx = ctx.clone();
                async move { serve_socks5(io, ctx).await }
            })
        });
        match server {
            Ok(server) => server.run().await,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                error!("Address in use, aborting");
                Err(e)
            }
            Err(e) => Err(e),
        }
    })
}
