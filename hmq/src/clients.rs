//! Registry of connected clients, indexed by id (primary), by name and by
//! type. Directed lookups back the `@name:` / `@type:` target syntax; the
//! iteration order of an index set is the registry's scan order, which is
//! what "first acquirer" refers to.

use hmq_codec::types::{TARGET_NAME_PREFIX, TARGET_TYPE_PREFIX};
use hmq_codec::Frame;

use crate::types::{ClientId, ClientName, ClientType, DashMap, DashSet, Id, SessionCommand, Tx};

#[derive(Clone)]
pub struct ClientEntry {
    pub info: Id,
    pub tx: Tx,
}

pub struct ClientRegistry {
    peers: DashMap<ClientId, ClientEntry>,
    by_name: DashMap<ClientName, DashSet<ClientId>>,
    by_type: DashMap<ClientType, DashSet<ClientId>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    #[inline]
    pub fn new() -> Self {
        Self { peers: DashMap::default(), by_name: DashMap::default(), by_type: DashMap::default() }
    }

    /// Registers a client; an existing entry under the same id is replaced
    /// and returned so the caller can close it.
    pub fn add(&self, info: Id, tx: Tx) -> Option<ClientEntry> {
        let client_id = info.client_id.clone();
        if !info.client_name.is_empty() {
            self.by_name.entry(info.client_name.clone()).or_default().insert(client_id.clone());
        }
        if !info.client_type.is_empty() {
            self.by_type.entry(info.client_type.clone()).or_default().insert(client_id.clone());
        }
        self.peers.insert(client_id, ClientEntry { info, tx })
    }

    pub fn remove_by_id(&self, client_id: &str) -> Option<ClientEntry> {
        let (_, entry) = self.peers.remove(client_id)?;
        if let Some(ids) = self.by_name.get(&entry.info.client_name) {
            ids.remove(client_id);
        }
        self.by_name.remove_if(&entry.info.client_name, |_, ids| ids.is_empty());
        if let Some(ids) = self.by_type.get(&entry.info.client_type) {
            ids.remove(client_id);
        }
        self.by_type.remove_if(&entry.info.client_type, |_, ids| ids.is_empty());
        Some(entry)
    }

    #[inline]
    pub fn find_by_id(&self, client_id: &str) -> Option<ClientEntry> {
        self.peers.get(client_id).map(|e| e.value().clone())
    }

    pub fn find_by_name(&self, name: &str) -> Vec<ClientEntry> {
        self.by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.find_by_id(id.key())).collect())
            .unwrap_or_default()
    }

    pub fn find_by_type(&self, typ: &str) -> Vec<ClientEntry> {
        self.by_type
            .get(typ)
            .map(|ids| ids.iter().filter_map(|id| self.find_by_id(id.key())).collect())
            .unwrap_or_default()
    }

    /// Receivers for a directed target: `@name:X`, `@type:T` or a plain
    /// client id.
    pub fn resolve_target(&self, target: &str) -> Vec<ClientEntry> {
        if let Some(name) = target.strip_prefix(TARGET_NAME_PREFIX) {
            self.find_by_name(name)
        } else if let Some(typ) = target.strip_prefix(TARGET_TYPE_PREFIX) {
            self.find_by_type(typ)
        } else {
            self.find_by_id(target).into_iter().collect()
        }
    }

    /// Forwards a frame to every client matching the predicate; returns how
    /// many writers accepted it.
    pub fn broadcast<F>(&self, predicate: F, frame: &Frame) -> usize
    where
        F: Fn(&Id) -> bool,
    {
        let mut sent = 0;
        for entry in self.peers.iter() {
            if predicate(&entry.info) {
                if entry.tx.unbounded_send(SessionCommand::Forward(frame.clone())).is_ok() {
                    sent += 1;
                } else {
                    log::debug!("{} broadcast skipped, writer is closed", entry.info);
                }
            }
        }
        sent
    }

    #[inline]
    pub fn contains(&self, client_id: &str) -> bool {
        self.peers.contains_key(client_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter_infos(&self) -> Vec<Id> {
        self.peers.iter().map(|e| e.info.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    fn client(id: &str, name: &str, typ: &str) -> (Id, Tx, crate::types::Rx) {
        let (tx, rx) = mpsc::unbounded();
        (Id::new(ClientId::from(id), ClientName::from(name), ClientType::from(typ), None), tx, rx)
    }

    #[test]
    fn indexes_follow_add_and_remove() {
        let registry = ClientRegistry::new();
        let (a, tx, _rx_a) = client("c1", "worker", "consumer");
        registry.add(a, tx);
        let (b, tx, _rx_b) = client("c2", "worker", "producer");
        registry.add(b, tx);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_name("worker").len(), 2);
        assert_eq!(registry.find_by_type("producer").len(), 1);

        registry.remove_by_id("c1");
        assert_eq!(registry.find_by_name("worker").len(), 1);
        assert!(registry.find_by_type("consumer").is_empty());
    }

    #[test]
    fn target_resolution() {
        let registry = ClientRegistry::new();
        let (a, tx, _rx) = client("c1", "billing", "svc");
        registry.add(a, tx);

        assert_eq!(registry.resolve_target("@name:billing").len(), 1);
        assert_eq!(registry.resolve_target("@type:svc").len(), 1);
        assert_eq!(registry.resolve_target("c1").len(), 1);
        assert!(registry.resolve_target("@name:unknown").is_empty());
    }

    #[test]
    fn broadcast_filters_by_predicate() {
        let registry = ClientRegistry::new();
        let (a, tx, _rx_a) = client("c1", "n", "alpha");
        registry.add(a, tx);
        let (b, tx, _rx_b) = client("c2", "n", "beta");
        registry.add(b, tx);

        let frame = Frame::new(hmq_codec::MessageType::Event);
        let sent = registry.broadcast(|info| info.client_type == "alpha", &frame);
        assert_eq!(sent, 1);
    }
}
