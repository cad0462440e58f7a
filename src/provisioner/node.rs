//! Provisioned machines and the pool that hands them out.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::ProvisionerError;

/// Default SSH port used for provisioned machines.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection details for reaching a node over SSH.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SshEndpoint {
    /// Address the SSH client connects to.
    pub host: IpAddr,
    /// TCP port of the SSH daemon.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key used for authentication, if not the client default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<Utf8PathBuf>,
}

impl SshEndpoint {
    /// Creates an endpoint on the default SSH port without an identity file.
    #[must_use]
    pub fn new(host: IpAddr, user: impl Into<String>) -> Self {
        Self {
            host,
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            identity_file: None,
        }
    }

    /// Sets the SSH port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the private key used for authentication.
    #[must_use]
    pub fn with_identity_file(mut self, identity_file: Option<Utf8PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }
}

/// A machine created by a provisioner.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Node {
    /// Backend-assigned node name.
    pub name: String,
    /// Address reachable from the orchestrating host.
    pub public_addr: IpAddr,
    /// Address used for cluster-internal traffic.
    pub private_addr: IpAddr,
    /// How to reach the node over SSH.
    pub ssh: SshEndpoint,
}

/// Nodes owned by a provisioner plus the set currently allocated to callers.
///
/// Allocation is atomic with respect to concurrent callers: two callers never
/// receive the same node.
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: Vec<Node>,
    allocated: Mutex<BTreeSet<String>>,
}

impl NodePool {
    /// Creates a pool with no nodes allocated.
    #[must_use]
    pub fn new(nodes: Vec<Node>) -> Self {
        Self::with_allocated(nodes, Vec::new())
    }

    /// Creates a pool, marking the named nodes as allocated.
    ///
    /// Names that do not refer to a pool member are ignored.
    #[must_use]
    pub fn with_allocated(nodes: Vec<Node>, allocated: Vec<String>) -> Self {
        let known: BTreeSet<String> = allocated
            .into_iter()
            .filter(|name| nodes.iter().any(|node| &node.name == name))
            .collect();
        Self {
            nodes,
            allocated: Mutex::new(known),
        }
    }

    /// Returns every node in the pool.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns `true` when the pool holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hands out the first node not yet allocated.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolExhausted`] when every node is in use.
    pub fn allocate(&self) -> Result<Node, ProvisionerError> {
        let mut allocated = self.lock()?;
        let node = self
            .nodes
            .iter()
            .find(|node| !allocated.contains(&node.name))
            .ok_or(ProvisionerError::PoolExhausted {
                total: self.nodes.len(),
            })?;
        allocated.insert(node.name.clone());
        Ok(node.clone())
    }

    /// Returns a node to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::UnknownNode`] when the node is not a pool
    /// member and [`ProvisionerError::NotAllocated`] when it is not in use.
    pub fn deallocate(&self, node: &Node) -> Result<(), ProvisionerError> {
        if !self.nodes.iter().any(|member| member.name == node.name) {
            return Err(ProvisionerError::UnknownNode {
                name: node.name.clone(),
            });
        }
        if self.lock()?.remove(&node.name) {
            Ok(())
        } else {
            Err(ProvisionerError::NotAllocated {
                name: node.name.clone(),
            })
        }
    }

    /// Returns the nodes currently allocated, in pool order.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolPoisoned`] if a holder of the lock
    /// panicked.
    pub fn allocated(&self) -> Result<Vec<Node>, ProvisionerError> {
        let allocated = self.lock()?;
        Ok(self
            .nodes
            .iter()
            .filter(|node| allocated.contains(&node.name))
            .cloned()
            .collect())
    }

    /// Returns the names of the allocated nodes in pool order.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolPoisoned`] if a holder of the lock
    /// panicked.
    pub fn allocated_names(&self) -> Result<Vec<String>, ProvisionerError> {
        Ok(self
            .allocated()?
            .into_iter()
            .map(|node| node.name)
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<String>>, ProvisionerError> {
        self.allocated
            .lock()
            .map_err(|_| ProvisionerError::PoolPoisoned)
    }
}
