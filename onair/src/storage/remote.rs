//! Remote storage over a memcached-compatible key/value cache.
//!
//! Pages are stored under the 32-hex-digit form of their content address.
//! The item flags field carries the CRC32 of the payload and is verified on
//! every read, so a damaged or foreign item surfaces as
//! [`StorageError::Corruption`] instead of a bad page.
//!
//! Reads go through a bounded LRU of recently seen pages. When an internal
//! page is loaded, the durable children it references are fetched with one
//! multi-key `get` and parked in the same LRU.
//!
//! The connection is a single blocking TCP stream guarded by a mutex; the
//! page cache has its own lock and the two are never held together. Replies
//! are always read through to their terminator, and a stream that lost its
//! framing (I/O or protocol error) is replaced by a fresh connection.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::storage::address::Address;
use crate::storage::backend::{Storage, StorageError};
use crate::storage::btree::Page;

/// Default number of pages kept in the read cache.
pub const DEFAULT_PAGE_CACHE_SIZE: usize = 4096;

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn new(stream: TcpStream) -> Result<Self, StorageError> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Send a multi-key `get` and read the reply up to `END`.
    ///
    /// A checksum mismatch does not stop the read, so the stream stays in
    /// step; the first mismatch is returned once the reply is consumed.
    fn get(
        &mut self,
        command: &str,
        keys: &HashMap<String, Address>,
    ) -> Result<HashMap<Address, Vec<u8>>, StorageError> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.flush()?;

        let mut found = HashMap::with_capacity(keys.len());
        let mut corrupted = None;
        loop {
            let line = read_line(&mut self.reader)?;
            if line == "END" {
                return corrupted.map_or(Ok(found), Err);
            }
            let (key, flags, len) = parse_value_header(&line)?;
            let mut data = vec![0u8; len + 2];
            self.reader.read_exact(&mut data)?;
            if !data.ends_with(b"\r\n") {
                return Err(StorageError::Protocol(format!(
                    "item {key} not terminated by CRLF"
                )));
            }
            data.truncate(len);

            let Some(address) = keys.get(key) else {
                tracing::warn!("remote storage returned unrequested key {key}");
                continue;
            };
            let checksum = crc32fast::hash(&data);
            if checksum != flags {
                corrupted.get_or_insert_with(|| {
                    StorageError::Corruption(format!(
                        "checksum mismatch for {address}: stored {flags:#010x}, computed {checksum:#010x}"
                    ))
                });
                continue;
            }
            found.insert(*address, data);
        }
    }

    /// Send a `set` and read its one-line reply.
    fn set(&mut self, header: &str, bytes: &[u8]) -> Result<String, StorageError> {
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(bytes)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        read_line(&mut self.reader)
    }
}

/// Storage backed by a remote memcached-protocol server.
pub struct RemoteStorage {
    peer: SocketAddr,
    connection: Mutex<Connection>,
    pages: Mutex<LruCache<Address, Vec<u8>>>,
}

impl std::fmt::Debug for RemoteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorage")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl RemoteStorage {
    /// Connect with the default page cache size.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, StorageError> {
        Self::connect_with_cache(addr, DEFAULT_PAGE_CACHE_SIZE)
    }

    /// Connect, keeping up to `cache_size` pages in the read cache.
    pub fn connect_with_cache(
        addr: impl ToSocketAddrs,
        cache_size: usize,
    ) -> Result<Self, StorageError> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        tracing::info!("connected to remote storage at {peer}");
        Ok(Self {
            peer,
            connection: Mutex::new(Connection::new(stream)?),
            pages: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Address of the remote server.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Number of pages currently held in the read cache.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Fetch several items with a single multi-key `get`.
    fn get_many(&self, addresses: &[Address]) -> Result<HashMap<Address, Vec<u8>>, StorageError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: HashMap<String, Address> = addresses.iter().map(|a| (a.to_hex(), *a)).collect();

        let mut command = String::from("get");
        for key in keys.keys() {
            command.push(' ');
            command.push_str(key);
        }
        command.push_str("\r\n");

        let mut conn = self.connection.lock();
        let reply = conn.get(&command, &keys);
        if let Err(e) = &reply {
            self.recover(&mut conn, e);
        }
        reply
    }

    /// Replace the connection after an error that may have left unread
    /// reply bytes behind.
    fn recover(&self, conn: &mut Connection, error: &StorageError) {
        if matches!(error, StorageError::Corruption(_)) {
            return;
        }
        match TcpStream::connect(self.peer).map_err(StorageError::from).and_then(Connection::new) {
            Ok(fresh) => {
                *conn = fresh;
                tracing::warn!("reconnected to remote storage at {} after: {error}", self.peer);
            }
            Err(e) => tracing::warn!("reconnecting to remote storage at {} failed: {e}", self.peer),
        }
    }
}

impl Storage for RemoteStorage {
    fn lookup(&self, address: Address) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(bytes) = self.pages.lock().get(&address) {
            return Ok(Some(bytes.clone()));
        }
        let Some(bytes) = self.get_many(&[address])?.remove(&address) else {
            return Ok(None);
        };
        self.pages.lock().put(address, bytes.clone());
        Ok(Some(bytes))
    }

    fn store(&self, address: Address, bytes: &[u8]) -> Result<(), StorageError> {
        let header = format!(
            "set {} {} 0 {}\r\n",
            address.to_hex(),
            crc32fast::hash(bytes),
            bytes.len()
        );

        let mut conn = self.connection.lock();
        let reply = match conn.set(&header, bytes) {
            Ok(reply) => reply,
            Err(e) => {
                self.recover(&mut conn, &e);
                return Err(e);
            }
        };
        drop(conn);
        if reply != "STORED" {
            tracing::warn!("remote storage rejected {address}: {reply}");
            return Err(StorageError::Protocol(format!(
                "set {address} answered '{reply}'"
            )));
        }
        Ok(())
    }

    fn prefetch(&self, address: Address, page: &Page) {
        let Page::Internal(internal) = page else {
            return;
        };
        let missing: Vec<Address> = {
            let pages = self.pages.lock();
            internal
                .children()
                .iter()
                .map(|c| c.address)
                .filter(|a| !a.is_novelty() && !pages.contains(a))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        match self.get_many(&missing) {
            Ok(found) => {
                tracing::debug!(
                    "prefetched {} of {} children of {address}",
                    found.len(),
                    missing.len()
                );
                let mut pages = self.pages.lock();
                for (child, bytes) in found {
                    pages.put(child, bytes);
                }
            }
            Err(e) => tracing::debug!("prefetch of children of {address} failed: {e}"),
        }
    }
}

/// Read one CRLF-terminated line without its terminator.
fn read_line(reader: &mut BufReader<TcpStream>) -> Result<String, StorageError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(StorageError::Protocol(
            "connection closed by remote storage".to_string(),
        ));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Parse `VALUE <key> <flags> <bytes>`.
fn parse_value_header(line: &str) -> Result<(&str, u32, usize), StorageError> {
    let invalid = || StorageError::Protocol(format!("unexpected reply '{line}'"));
    let mut parts = line.split_ascii_whitespace();
    if parts.next() != Some("VALUE") {
        return Err(invalid());
    }
    let key = parts.next().ok_or_else(invalid)?;
    let flags = parts
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(invalid)?;
    let len = parts
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(invalid)?;
    Ok((key, flags, len))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;

    use super::*;
    use crate::storage::btree::BTree;
    use crate::storage::novelty::Novelty;

    /// Serve the memcached text protocol for one client from a local map.
    /// Items whose payload matches `corrupt` are returned with wrong flags.
    fn spawn_server(corrupt: impl Fn(&[u8]) -> bool + Send + 'static) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut writer = stream;
            let mut items: HashMap<String, (u32, Vec<u8>)> = HashMap::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    return;
                }
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["set", key, flags, _exptime, len] => {
                        let len: usize = len.parse().expect("length");
                        let mut data = vec![0u8; len + 2];
                        reader.read_exact(&mut data).expect("payload");
                        data.truncate(len);
                        let flags: u32 = flags.parse().expect("flags");
                        items.insert((*key).to_string(), (flags, data));
                        writer.write_all(b"STORED\r\n").expect("reply");
                    }
                    ["get", keys @ ..] => {
                        for key in keys {
                            if let Some((flags, data)) = items.get(*key) {
                                let flags = if corrupt(data.as_slice()) { flags ^ 1 } else { *flags };
                                write!(writer, "VALUE {key} {flags} {}\r\n", data.len())
                                    .expect("header");
                                writer.write_all(data).expect("data");
                                writer.write_all(b"\r\n").expect("terminator");
                            }
                        }
                        writer.write_all(b"END\r\n").expect("end");
                    }
                    _ => writer.write_all(b"ERROR\r\n").expect("error reply"),
                }
            }
        });
        addr
    }

    #[test]
    fn test_remote_roundtrip() {
        let storage = RemoteStorage::connect(spawn_server(|_| false)).expect("connect");
        let bytes = b"Hello".to_vec();
        let address = storage.alloc(&bytes);
        storage.store(address, &bytes).expect("store");

        assert_eq!(storage.lookup(address).expect("lookup"), Some(bytes.clone()));
        assert_eq!(storage.lookup(address).expect("lookup again"), Some(bytes));
    }

    #[test]
    fn test_remote_not_found() {
        let storage = RemoteStorage::connect(spawn_server(|_| false)).expect("connect");
        assert_eq!(storage.lookup(Address::new(-42, -42)).expect("lookup"), None);
    }

    #[test]
    fn test_remote_detects_checksum_mismatch() {
        let storage = RemoteStorage::connect(spawn_server(|_| true)).expect("connect");
        let address = storage.alloc(b"payload");
        storage.store(address, b"payload").expect("store");
        assert!(matches!(
            storage.lookup(address),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_corrupt_item_keeps_connection_in_step() {
        let storage =
            RemoteStorage::connect(spawn_server(|data: &[u8]| data == b"bad")).expect("connect");
        let bad = storage.alloc(b"bad");
        let good = storage.alloc(b"good");
        storage.store(bad, b"bad").expect("store bad");
        storage.store(good, b"good").expect("store good");

        assert!(matches!(
            storage.get_many(&[bad, good]),
            Err(StorageError::Corruption(_))
        ));

        // The rest of the multi-get reply was consumed with the error.
        assert_eq!(storage.lookup(good).expect("lookup"), Some(b"good".to_vec()));
        let third = storage.alloc(b"third");
        storage.store(third, b"third").expect("store after corruption");
        assert_eq!(storage.lookup(third).expect("lookup third"), Some(b"third".to_vec()));
    }

    #[test]
    fn test_parse_value_header() {
        assert_eq!(
            parse_value_header("VALUE abc 42 7").expect("parse"),
            ("abc", 42, 7)
        );
        assert!(parse_value_header("VALUE abc x 7").is_err());
        assert!(parse_value_header("ERROR").is_err());
    }

    #[test]
    fn test_tree_over_remote_storage_prefetches_children() {
        let storage = Arc::new(RemoteStorage::connect(spawn_server(|_| false)).expect("connect"));
        let novelty = Novelty::anonymous(16 * 1024 * 1024).expect("novelty");
        let mut tree = BTree::create(&novelty, storage.clone(), 4).expect("create");
        for i in 0u32..200 {
            tree.put(&novelty, &i.to_be_bytes(), &i.to_le_bytes(), true)
                .expect("put");
        }
        let root = tree.store(&novelty).expect("store");

        let fresh = Novelty::anonymous(1024 * 1024).expect("fresh novelty");
        let reloaded = BTree::load(storage.clone(), 4, root);
        assert_eq!(
            reloaded.get(&fresh, &7u32.to_be_bytes()).expect("get"),
            Some(7u32.to_le_bytes().to_vec())
        );
        // Root plus every child fetched by the prefetch.
        let stats = reloaded.stats(&fresh).expect("stats");
        assert_eq!(storage.cached_pages(), stats.bottom_pages + stats.internal_pages);
    }
}
