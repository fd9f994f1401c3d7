use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::cmd::cmd;
use crate::connection::{Conn, Handshake};
use crate::errors::{Error, ErrorKind, RimcuResult};

/// A cluster node, master or replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) addr: String,
    pub(crate) role: Role,
    pub(crate) master_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Master,
    Slave,
}

/// One shard: a master and the replicas grouped under it.
#[derive(Debug, Clone)]
pub(crate) struct Shard {
    pub(crate) master: Node,
    pub(crate) slaves: Vec<Node>,
}

/// The discovered cluster topology.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterInfo {
    pub(crate) shards: HashMap<String, Shard>,
}

impl ClusterInfo {
    /// Addresses of all masters; the subscriber fan-out target set.
    pub(crate) fn masters(&self) -> Vec<String> {
        self.shards
            .values()
            .map(|shard| shard.master.addr.clone())
            .collect()
    }
}

/// Discovers the cluster topology from a set of seed nodes.
pub(crate) struct Explorer {
    seeds: Vec<String>,
    password: Option<String>,
    response_timeout: Duration,
}

impl Explorer {
    pub(crate) fn new(
        seeds: Vec<String>,
        password: Option<String>,
        response_timeout: Duration,
    ) -> Explorer {
        Explorer {
            seeds,
            password,
            response_timeout,
        }
    }

    /// Dials the first reachable seed and parses `CLUSTER NODES`.
    pub(crate) async fn discover(&self) -> RimcuResult<ClusterInfo> {
        let mut last_err = Error::from((ErrorKind::InvalidArgs, "no cluster seeds configured"));
        for seed in &self.seeds {
            match self.discover_from(seed).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    debug!("cluster discovery via {seed} failed: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn discover_from(&self, seed: &str) -> RimcuResult<ClusterInfo> {
        let mut conn =
            Conn::connect(seed, Handshake::None, None, self.response_timeout).await?;
        if let Some(password) = &self.password {
            conn.do_cmd(&cmd("AUTH").arg(password)).await?;
        }
        let raw = conn
            .do_cmd(&cmd("CLUSTER").arg("NODES"))
            .await?
            .into_string()?;
        parse_cluster_nodes(&raw)
    }
}

/// Parses the line-oriented `CLUSTER NODES` output.
///
/// Only lines carrying the `connected` token count. The flags field may
/// hold several comma-separated tokens (`myself,master`); the second is
/// the authoritative role then.
fn parse_cluster_nodes(raw: &str) -> RimcuResult<ClusterInfo> {
    let mut nodes = Vec::new();
    for line in raw.lines() {
        let words: Vec<&str> = line.split(' ').collect();
        if words.len() < 5 || !words.contains(&"connected") {
            continue;
        }
        let Some(role) = parse_role(words[2]) else {
            continue;
        };
        nodes.push(Node {
            id: words[0].to_string(),
            addr: trim_bus_port(words[1]).to_string(),
            role,
            master_id: (role == Role::Slave).then(|| words[3].to_string()),
        });
    }

    let mut shards: HashMap<String, Shard> = nodes
        .iter()
        .filter(|node| node.role == Role::Master)
        .map(|node| {
            (
                node.id.clone(),
                Shard {
                    master: node.clone(),
                    slaves: Vec::new(),
                },
            )
        })
        .collect();

    for node in nodes {
        if node.role == Role::Master {
            continue;
        }
        let master_id = node.master_id.clone().unwrap_or_default();
        let shard = shards.get_mut(&master_id).ok_or_else(|| {
            Error::from((
                ErrorKind::Parse,
                "replica references an unknown master",
                master_id,
            ))
        })?;
        shard.slaves.push(node);
    }

    Ok(ClusterInfo { shards })
}

fn parse_role(flags: &str) -> Option<Role> {
    let mut words = flags.split(',');
    let first = words.next()?;
    let role = words.next().unwrap_or(first);
    match role {
        "master" => Some(Role::Master),
        "slave" => Some(Role::Slave),
        _ => None,
    }
}

/// `host:port@bus-port` carries the cluster bus port after the `@`.
fn trim_bus_port(addr: &str) -> &str {
    addr.split('@').next().unwrap_or(addr)
}
