//! Resource addresses and the dependency graph between them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::{Result, SealplaneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceAddress {
    Key,
    Bucket,
    Provider,
    Role,
    Policy,
    Attachment,
}

impl ResourceAddress {
    pub const ALL: [ResourceAddress; 6] = [
        ResourceAddress::Key,
        ResourceAddress::Bucket,
        ResourceAddress::Provider,
        ResourceAddress::Role,
        ResourceAddress::Policy,
        ResourceAddress::Attachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAddress::Key => "kms_key.unseal",
            ResourceAddress::Bucket => "s3_bucket.storage",
            ResourceAddress::Provider => "oidc_provider.cluster",
            ResourceAddress::Role => "iam_role.vault",
            ResourceAddress::Policy => "iam_policy.vault",
            ResourceAddress::Attachment => "iam_role_policy_attachment.vault",
        }
    }

    /// Resources that must converge before this one.
    pub fn dependencies(&self) -> &'static [ResourceAddress] {
        match self {
            ResourceAddress::Key | ResourceAddress::Provider => &[],
            ResourceAddress::Bucket => &[ResourceAddress::Key],
            ResourceAddress::Role => &[ResourceAddress::Provider],
            ResourceAddress::Policy => &[ResourceAddress::Key, ResourceAddress::Bucket],
            ResourceAddress::Attachment => &[ResourceAddress::Role, ResourceAddress::Policy],
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed acyclic graph of resource dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
}

impl DependencyGraph {
    /// The bootstrap graph: key, bucket, provider, role, policy, attachment.
    pub fn bootstrap() -> Self {
        let mut graph = Self::default();
        for address in ResourceAddress::ALL {
            graph.add_node(address);
            for dependency in address.dependencies() {
                graph.add_edge(address, *dependency);
            }
        }
        graph
    }

    pub fn add_node(&mut self, node: ResourceAddress) {
        self.edges.entry(node).or_default();
    }

    /// Record that `node` depends on `dependency`.
    pub fn add_edge(&mut self, node: ResourceAddress, dependency: ResourceAddress) {
        self.add_node(dependency);
        self.edges.entry(node).or_default().insert(dependency);
    }

    /// Kahn's algorithm. Ties are broken by the address ordering so the same
    /// graph always yields the same order.
    pub fn topological_order(&self) -> Result<Vec<ResourceAddress>> {
        let mut remaining: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> = self.edges.clone();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .find(|(_, deps)| deps.is_empty())
                .map(|(node, _)| *node)
                .ok_or_else(|| {
                    let cycle: Vec<_> = remaining.keys().map(|a| a.as_str()).collect();
                    SealplaneError::internal(format!("dependency cycle among {}", cycle.join(", ")))
                })?;

            remaining.remove(&ready);
            for deps in remaining.values_mut() {
                deps.remove(&ready);
            }
            order.push(ready);
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_order_respects_dependencies() {
        let order = DependencyGraph::bootstrap().topological_order().unwrap();
        assert_eq!(order.len(), 6);

        let position = |a: ResourceAddress| order.iter().position(|x| *x == a).unwrap();
        for address in ResourceAddress::ALL {
            for dependency in address.dependencies() {
                assert!(position(*dependency) < position(address), "{} before {}", dependency, address);
            }
        }
    }

    #[test]
    fn order_is_deterministic() {
        let order = DependencyGraph::bootstrap().topological_order().unwrap();
        assert_eq!(
            order,
            vec![
                ResourceAddress::Key,
                ResourceAddress::Bucket,
                ResourceAddress::Provider,
                ResourceAddress::Role,
                ResourceAddress::Policy,
                ResourceAddress::Attachment,
            ]
        );
        assert_eq!(order, DependencyGraph::bootstrap().topological_order().unwrap());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = DependencyGraph::default();
        graph.add_edge(ResourceAddress::Key, ResourceAddress::Bucket);
        graph.add_edge(ResourceAddress::Bucket, ResourceAddress::Key);
        assert!(graph.topological_order().is_err());
    }
}
