use crate::config::Config;
use crate::error::ServerError;
use mio::net::TcpListener;
use std::net::{SocketAddr, ToSocketAddrs};

/// One bound socket and the server blocks that share it, in config order.
pub struct Listener {
    pub socket: TcpListener,
    pub addr: SocketAddr,
    pub servers: Vec<usize>,
}

/// Group server blocks by `host:port`, keeping first-seen order.
pub fn group_servers(config: &Config) -> Vec<((String, u16), Vec<usize>)> {
    let mut groups: Vec<((String, u16), Vec<usize>)> = Vec::new();
    for (idx, server) in config.servers.iter().enumerate() {
        let key = (server.host.clone(), server.port);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }
    groups
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ServerError::Resolve(format!("{}:{}", host, port)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ServerError::Resolve(format!("{}:{}", host, port)))
}

pub fn bind_all(config: &Config) -> Result<Vec<Listener>, ServerError> {
    group_servers(config)
        .into_iter()
        .map(|((host, port), servers)| {
            let addr = resolve(&host, port)?;
            let socket =
                TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            Ok(Listener {
                socket,
                addr,
                servers,
            })
        })
        .collect()
}
