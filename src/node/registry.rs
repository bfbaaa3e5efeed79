use std::sync::Arc;

use parking_lot::RwLock;

use super::NodeLink;
use crate::error::{Error, Result};

/// Read-side view over every known [`NodeLink`].
///
/// The registry keeps no state of its own beyond membership; every ranking
/// is computed from the links at call time.
#[derive(Default)]
pub struct NodeRegistry {
    links: RwLock<Vec<Arc<NodeLink>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, link: Arc<NodeLink>) -> Result<()> {
        let mut links = self.links.write();
        if links.iter().any(|l| l.name() == link.name()) {
            return Err(Error::InvalidConfig(format!("duplicate node name {}", link.name())));
        }
        links.push(link);
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<NodeLink>> {
        let mut links = self.links.write();
        let index = links.iter().position(|l| l.name() == name)?;
        Some(links.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeLink>> {
        self.links.read().iter().find(|l| l.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<NodeLink>> {
        self.links.read().clone()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Ready links only.
    pub fn connected(&self) -> Vec<Arc<NodeLink>> {
        self.links.read().iter().filter(|l| l.is_ready()).cloned().collect()
    }

    /// Ready links, fewest submitted commands first.
    pub fn least_used(&self) -> Vec<Arc<NodeLink>> {
        let mut links = self.connected();
        links.sort_by_key(|l| l.calls());
        links
    }

    /// Ready links, lowest penalty first.
    pub fn best(&self) -> Vec<Arc<NodeLink>> {
        let mut links = self.connected();
        links.sort_by_key(|l| l.penalty());
        links
    }

    /// Ready links tagged with `region`, lowest penalty first.
    pub fn by_region(&self, region: &str) -> Vec<Arc<NodeLink>> {
        self.best()
            .into_iter()
            .filter(|l| l.config().serves_region(region))
            .collect()
    }

    /// Picks the node for a new session: the best node serving `region` if
    /// there is one, otherwise the best node overall.
    pub fn select(&self, region: Option<&str>) -> Result<Arc<NodeLink>> {
        if let Some(region) = region {
            if let Some(link) = self.by_region(region).into_iter().next() {
                return Ok(link);
            }
        }

        self.best()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NodeUnavailable("no node is ready".to_string()))
    }
}
