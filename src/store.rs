//! Bootstrap contact persistence.
//!
//! The only durable state the routing core keeps: an ordered,
//! deduplicated set of [`Contact`]s to dial on the next start. The core
//! treats the store as opaque; two implementations ship here: an
//! in-memory store for tests and short-lived nodes, and a bincode file
//! store for real deployments.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bincode::Options;

use crate::identity::Contact;

/// Bound on persisted contacts; the oldest fall off the end.
const MAX_STORED_CONTACTS: usize = 1500;

/// Bound for decoding a contact file that may have been tampered with.
const MAX_STORE_FILE_SIZE: u64 = 4 * 1024 * 1024;

pub trait BootstrapStore: Send + 'static {
    /// All known contacts, oldest first.
    fn read(&self) -> Vec<Contact>;

    /// Append contacts, ignoring those already present by id.
    fn add(&mut self, contacts: &[Contact]) -> Result<()>;

    /// Forget a contact; idempotent.
    fn remove(&mut self, contact: &Contact) -> Result<()>;
}

/// Volatile contact store.
#[derive(Default)]
pub struct MemoryStore {
    contacts: Vec<Contact>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contacts: Vec<Contact>) -> Self {
        let mut store = Self::new();
        let _ = store.add(&contacts);
        store
    }
}

impl BootstrapStore for MemoryStore {
    fn read(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    fn add(&mut self, contacts: &[Contact]) -> Result<()> {
        merge_contacts(&mut self.contacts, contacts);
        Ok(())
    }

    fn remove(&mut self, contact: &Contact) -> Result<()> {
        self.contacts.retain(|known| known.id != contact.id);
        Ok(())
    }
}

/// Contact store persisted as a bincode file.
pub struct FileStore {
    path: PathBuf,
    contacts: Vec<Contact>,
}

impl FileStore {
    /// Open or create a store at `path`. An unreadable or corrupt file is
    /// treated as empty rather than fatal: bootstrap can still proceed
    /// from contacts added at runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let contacts = std::fs::read(&path)
            .ok()
            .and_then(|bytes| {
                bincode::DefaultOptions::new()
                    .with_limit(MAX_STORE_FILE_SIZE)
                    .deserialize(&bytes)
                    .ok()
            })
            .unwrap_or_default();
        Self { path, contacts }
    }

    fn persist(&self) -> Result<()> {
        let bytes = bincode::DefaultOptions::new()
            .with_limit(MAX_STORE_FILE_SIZE)
            .serialize(&self.contacts)
            .context("serialising bootstrap contacts")?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("writing bootstrap store {}", self.path.display()))
    }
}

impl BootstrapStore for FileStore {
    fn read(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    fn add(&mut self, contacts: &[Contact]) -> Result<()> {
        merge_contacts(&mut self.contacts, contacts);
        self.persist()
    }

    fn remove(&mut self, contact: &Contact) -> Result<()> {
        self.contacts.retain(|known| known.id != contact.id);
        self.persist()
    }
}

fn merge_contacts(known: &mut Vec<Contact>, new: &[Contact]) {
    for contact in new {
        if !known.iter().any(|existing| existing.id == contact.id) {
            known.push(*contact);
        }
    }
    if known.len() > MAX_STORED_CONTACTS {
        let excess = known.len() - MAX_STORED_CONTACTS;
        known.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, EndpointPair, ADDRESS_LENGTH};

    fn contact(seed: u8) -> Contact {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = seed;
        let addr = format!("127.0.0.1:{}", 5000 + seed as u16).parse().unwrap();
        Contact::new(Address::from_bytes(bytes), EndpointPair::new(addr, addr))
    }

    #[test]
    fn memory_store_deduplicates_by_id() {
        let mut store = MemoryStore::new();
        store.add(&[contact(1), contact(2)]).unwrap();
        store.add(&[contact(2), contact(3)]).unwrap();

        let contacts = store.read();
        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts[0], contact(1));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = MemoryStore::with_contacts(vec![contact(1), contact(2)]);
        store.remove(&contact(1)).unwrap();
        store.remove(&contact(1)).unwrap();
        assert_eq!(store.read(), vec![contact(2)]);
    }

    #[test]
    fn file_store_round_trips() {
        let dir = std::env::temp_dir().join("xorlay-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("contacts-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut store = FileStore::open(&path);
            assert!(store.read().is_empty());
            store.add(&[contact(1), contact(2)]).unwrap();
        }

        let mut reopened = FileStore::open(&path);
        assert_eq!(reopened.read(), vec![contact(1), contact(2)]);
        reopened.remove(&contact(1)).unwrap();

        let reopened = FileStore::open(&path);
        assert_eq!(reopened.read(), vec![contact(2)]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = std::env::temp_dir().join("xorlay-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("corrupt-{}.db", std::process::id()));
        std::fs::write(&path, b"not a contact list").unwrap();

        assert!(FileStore::open(&path).read().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
