//! Shared types and identifiers for Reef.
//!
//! This crate defines the core types used across the Reef workspace:
//! the opaque [`Key`] of the shared address space, the interned node
//! address [`NodeAddr`] with its fixed 6-byte wire encoding, blob
//! identifiers for the byte backends ([`BlobId`]), the periodic health
//! snapshot ([`Heartbeat`]), and small wire enums ([`RebootCause`],
//! [`BackendKind`]).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// An opaque, immutable byte sequence naming a value in the shared
/// key/value address space.
///
/// Keys carry no structure; placement and storage derive everything they
/// need from the raw bytes ([`Key::position`], [`Key::blob_id`]).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    /// Create a key from arbitrary bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Return the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key's position on the u64 placement ring: the first 8 bytes of
    /// `blake3(key)`, little-endian.
    pub fn position(&self) -> u64 {
        let hash = blake3::hash(&self.0);
        let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
        u64::from_le_bytes(bytes)
    }

    /// The stable blob identifier used when this key's value is persisted
    /// through a byte backend: `blake3(key)`.
    pub fn blob_id(&self) -> BlobId {
        BlobId(blake3::hash(&self.0).into())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printable keys render as text, everything else as hex. Long keys
        // are truncated so log lines stay readable.
        const MAX: usize = 32;
        let shown = &self.0[..self.0.len().min(MAX)];
        if shown.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            f.write_str(std::str::from_utf8(shown).expect("ascii"))?;
        } else {
            for byte in shown {
                write!(f, "{byte:02x}")?;
            }
        }
        if self.0.len() > MAX {
            f.write_str("...")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

// ---------------------------------------------------------------------------
// BlobId
// ---------------------------------------------------------------------------

/// Content-derived identifier for a persisted value blob: `blake3(key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Create an ID by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BlobId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({self})")
    }
}

// ---------------------------------------------------------------------------
// NodeAddr
// ---------------------------------------------------------------------------

/// A cluster endpoint is uniquely named by its IPv4 address and port.
///
/// On the wire an address is exactly 6 bytes: the 4 address octets
/// followed by the port in big-endian. The registry interns one canonical
/// node handle per distinct address (see `reef-cluster`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawAddr", into = "RawAddr")]
pub struct NodeAddr {
    ip: Ipv4Addr,
    port: u16,
}

/// Fixed wire form of [`NodeAddr`]: 4 address octets + 2 port bytes.
#[derive(Serialize, Deserialize)]
struct RawAddr {
    ip: [u8; 4],
    port: [u8; 2],
}

impl From<NodeAddr> for RawAddr {
    fn from(addr: NodeAddr) -> Self {
        Self {
            ip: addr.ip.octets(),
            port: addr.port.to_be_bytes(),
        }
    }
}

impl From<RawAddr> for NodeAddr {
    fn from(raw: RawAddr) -> Self {
        Self {
            ip: Ipv4Addr::from(raw.ip),
            port: u16::from_be_bytes(raw.port),
        }
    }
}

impl NodeAddr {
    /// Create an address from an IPv4 address and port.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The IPv4 address.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address as a standard socket address, for binding and connecting.
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from((self.ip, self.port))
    }
}

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s.split_once(':').ok_or(AddrParseError)?;
        Ok(Self {
            ip: ip.parse().map_err(|_| AddrParseError)?,
            port: port.parse().map_err(|_| AddrParseError)?,
        })
    }
}

/// Failure to parse an `ip:port` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrParseError;

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected a node address of the form `a.b.c.d:port`")
    }
}

impl std::error::Error for AddrParseError {}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({self})")
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Periodic health snapshot a node reports to its peers.
///
/// The `view_id` field is how membership is judged: a node is a member of
/// a cluster view only if the view id it last reported matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// The cluster view id this node last agreed to.
    pub view_id: u64,
    /// Number of keys homed at this node.
    pub keys: u64,
    /// Free memory estimate in bytes (0 when unknown).
    pub free_mem: u64,
    /// Sender wall clock in milliseconds when the snapshot was taken.
    pub sent_at_ms: u64,
}

// ---------------------------------------------------------------------------
// RebootCause
// ---------------------------------------------------------------------------

/// Cause carried by a reboot notice.
///
/// `Reboot` is informational: the peer restarted and its task history is
/// void. Every other cause is a kill signal — the receiving process must
/// close its listeners and terminate rather than keep serving a stale or
/// incompatible cluster view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootCause {
    /// The sender restarted; forget its task history.
    Reboot,
    /// Orderly cluster-wide shutdown.
    Shutdown,
    /// A peer hit an unrecoverable error and is taking the cluster down.
    Error,
    /// Rejected while trying to join a locked cluster.
    LockedCloud,
    /// Rejected for running a different software version than the cluster.
    VersionMismatch,
}

impl RebootCause {
    /// Whether receiving this cause must terminate the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RebootCause::Reboot)
    }
}

impl fmt::Display for RebootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebootCause::Reboot => "peer reboot",
            RebootCause::Shutdown => "orderly shutdown",
            RebootCause::Error => "error leading to a cluster kill",
            RebootCause::LockedCloud => "killed joining a locked cluster",
            RebootCause::VersionMismatch => "killed joining a cluster with a different version",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// BackendKind
// ---------------------------------------------------------------------------

/// Selects which byte backend holds a value's persisted copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// In-memory blob storage (volatile, for testing or caching).
    Memory,
    /// Local-disk blob storage, one file per blob.
    Disk,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
