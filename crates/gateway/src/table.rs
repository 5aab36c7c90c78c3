use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::session::Gateway;

/// Shared table of hub sessions keyed by hub IP.
///
/// Filled by discovery, read by the push listener to demultiplex reports.
#[derive(Clone, Default)]
pub struct GatewayTable {
    inner: Arc<RwLock<HashMap<Ipv4Addr, Arc<Gateway>>>>,
}

impl GatewayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session unless one already exists for its IP.
    /// Returns `false` if the IP was already present.
    pub fn insert(&self, gateway: Arc<Gateway>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&gateway.ip()) {
            return false;
        }
        map.insert(gateway.ip(), gateway);
        true
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Arc<Gateway>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&ip)
    }

    /// Looks up a session by hub sid.
    pub fn by_sid(&self, sid: &str) -> Option<Arc<Gateway>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|g| g.sid() == sid)
            .cloned()
    }

    /// All sessions, in no particular order.
    pub fn all(&self) -> Vec<Arc<Gateway>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GatewayParams;

    #[tokio::test]
    async fn insert_is_unique_per_ip() {
        let table = GatewayTable::new();
        let params = GatewayParams::new(Ipv4Addr::LOCALHOST, 9898, "7811dcb07917");

        let first = Gateway::connect(params.clone()).await.unwrap();
        let second = Gateway::connect(params).await.unwrap();

        assert!(table.insert(first));
        assert!(!table.insert(second));
        assert_eq!(table.len(), 1);
        assert!(table.contains(Ipv4Addr::LOCALHOST));
        assert!(table.by_sid("7811dcb07917").is_some());
        assert!(table.by_sid("missing").is_none());
    }
}
