//! P2P wire messages: one tagged enum per direction-agnostic message,
//! bit-exact encoding per the reference network format.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::chain::block::{Block, BlockHeader};
use crate::chain::merkle::PartialMerkleTree;
use crate::chain::transaction::Transaction;
use crate::primitives::encode::{
    read_bytes, read_list, read_string, write_bytes, write_list, write_string, Decodable,
    Encodable, ProtocolError, VarInt,
};
use crate::primitives::Sha256dHash;

/// Wire protocol version we speak. 70001 is the first with BIP37 filter
/// support and the `relay` flag.
pub const PROTOCOL_VERSION: i32 = 70001;

/// Service bit for a full chain-serving node.
pub const NODE_NETWORK: u64 = 1;

/// Inventory item types.
pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;
pub const INV_FILTERED_BLOCK: u32 = 3;

/// A network endpoint with service bits. Addresses travel as 16-byte
/// IPv6, with IPv4 in v4-mapped form; the port is big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        NetAddr {
            services,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Encodable for NetAddr {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        self.services.encode(w)?;
        let v6 = match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        w.write_all(&v6.octets())?;
        w.write_all(&self.port.to_be_bytes())?;
        Ok(8 + 16 + 2)
    }
}

impl Decodable for NetAddr {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let services = u64::decode(r)?;
        let mut octets = [0u8; 16];
        r.read_exact(&mut octets)?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let mut port_be = [0u8; 2];
        r.read_exact(&mut port_be)?;
        Ok(NetAddr {
            services,
            ip,
            port: u16::from_be_bytes(port_be),
        })
    }
}

/// An `addr` entry: last-seen time plus endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddr {
    pub time: u32,
    pub addr: NetAddr,
}

impl Encodable for TimestampedAddr {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.time.encode(w)?;
        n += self.addr.encode(w)?;
        Ok(n)
    }
}

impl Decodable for TimestampedAddr {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(TimestampedAddr {
            time: u32::decode(r)?,
            addr: NetAddr::decode(r)?,
        })
    }
}

/// Version handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// BIP37: false asks the peer not to relay transactions until a
    /// filter is loaded.
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.version.encode(w)?;
        n += self.services.encode(w)?;
        n += self.timestamp.encode(w)?;
        n += self.receiver.encode(w)?;
        n += self.sender.encode(w)?;
        n += self.nonce.encode(w)?;
        n += write_string(w, &self.user_agent)?;
        n += self.start_height.encode(w)?;
        n += (self.relay as u8).encode(w)?;
        Ok(n)
    }
}

impl Decodable for VersionMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let version = i32::decode(r)?;
        let services = u64::decode(r)?;
        let timestamp = i64::decode(r)?;
        let receiver = NetAddr::decode(r)?;
        let sender = NetAddr::decode(r)?;
        let nonce = u64::decode(r)?;
        let user_agent = read_string(r)?;
        let start_height = i32::decode(r)?;
        // Old peers omit the relay flag.
        let relay = match u8::decode(r) {
            Ok(b) => b != 0,
            Err(ref e) if e.is_eof() => true,
            Err(e) => return Err(e),
        };
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// One inventory announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Sha256dHash,
}

impl InvItem {
    pub fn tx(hash: Sha256dHash) -> Self {
        InvItem { kind: INV_TX, hash }
    }

    pub fn block(hash: Sha256dHash) -> Self {
        InvItem {
            kind: INV_BLOCK,
            hash,
        }
    }

    pub fn filtered_block(hash: Sha256dHash) -> Self {
        InvItem {
            kind: INV_FILTERED_BLOCK,
            hash,
        }
    }
}

impl Encodable for InvItem {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.kind.encode(w)?;
        n += self.hash.encode(w)?;
        Ok(n)
    }
}

impl Decodable for InvItem {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(InvItem {
            kind: u32::decode(r)?,
            hash: Sha256dHash::decode(r)?,
        })
    }
}

/// `getheaders` / `getblocks` share a body: a locator walking back from
/// the tip with exponentially growing gaps, plus a stop hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<Sha256dHash>,
    pub hash_stop: Sha256dHash,
}

impl GetHeadersMessage {
    pub fn new(locator: Vec<Sha256dHash>) -> Self {
        GetHeadersMessage {
            version: PROTOCOL_VERSION as u32,
            locator,
            hash_stop: Sha256dHash::zero(),
        }
    }
}

impl Encodable for GetHeadersMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.version.encode(w)?;
        n += write_list(w, &self.locator)?;
        n += self.hash_stop.encode(w)?;
        Ok(n)
    }
}

impl Decodable for GetHeadersMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(GetHeadersMessage {
            version: u32::decode(r)?,
            locator: read_list(r, 2_000)?,
            hash_stop: Sha256dHash::decode(r)?,
        })
    }
}

/// A `headers` entry is a header followed by a (always zero) tx count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersEntry(pub BlockHeader);

impl Encodable for HeadersEntry {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.0.encode(w)?;
        n += VarInt(0).encode(w)?;
        Ok(n)
    }
}

impl Decodable for HeadersEntry {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let header = BlockHeader::decode(r)?;
        let _txn_count = VarInt::decode(r)?;
        Ok(HeadersEntry(header))
    }
}

/// BIP37 `filterload` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl Encodable for FilterLoadMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = write_bytes(w, &self.filter)?;
        n += self.hash_funcs.encode(w)?;
        n += self.tweak.encode(w)?;
        n += self.flags.encode(w)?;
        Ok(n)
    }
}

impl Decodable for FilterLoadMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(FilterLoadMessage {
            filter: read_bytes(r)?,
            hash_funcs: u32::decode(r)?,
            tweak: u32::decode(r)?,
            flags: u8::decode(r)?,
        })
    }
}

/// `merkleblock`: header plus partial merkle tree of matched txs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

impl Encodable for MerkleBlockMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = self.header.encode(w)?;
        n += self.tree.encode(w)?;
        Ok(n)
    }
}

impl Decodable for MerkleBlockMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(MerkleBlockMessage {
            header: BlockHeader::decode(r)?,
            tree: PartialMerkleTree::decode(r)?,
        })
    }
}

/// `reject`: why a peer refused something we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// For tx/block rejections, the hash being rejected.
    pub data: Option<Sha256dHash>,
}

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_INSUFFICIENT_FEE: u8 = 0x42;

impl Encodable for RejectMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        let mut n = write_string(w, &self.message)?;
        n += self.code.encode(w)?;
        n += write_string(w, &self.reason)?;
        if let Some(hash) = &self.data {
            n += hash.encode(w)?;
        }
        Ok(n)
    }
}

impl Decodable for RejectMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, ProtocolError> {
        let message = read_string(r)?;
        let code = u8::decode(r)?;
        let reason = read_string(r)?;
        let data = match Sha256dHash::decode(r) {
            Ok(h) => Some(h),
            Err(ref e) if e.is_eof() => None,
            Err(e) => return Err(e),
        };
        Ok(RejectMessage {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Every message we understand, plus `Unknown` so unrecognized commands
/// are skipped rather than fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddr>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetHeaders(GetHeadersMessage),
    GetBlocks(GetHeadersMessage),
    Headers(Vec<HeadersEntry>),
    Block(Block),
    Tx(Transaction),
    FilterLoad(FilterLoadMessage),
    FilterAdd(Vec<u8>),
    FilterClear,
    MerkleBlock(MerkleBlockMessage),
    Reject(RejectMessage),
    /// Deprecated network alerts; content is deliberately ignored.
    Alert,
    Mempool,
    Unknown { command: String },
}

impl NetworkMessage {
    /// The 12-byte envelope command for this message.
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::FilterLoad(_) => "filterload",
            NetworkMessage::FilterAdd(_) => "filteradd",
            NetworkMessage::FilterClear => "filterclear",
            NetworkMessage::MerkleBlock(_) => "merkleblock",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::Alert => "alert",
            NetworkMessage::Mempool => "mempool",
            NetworkMessage::Unknown { .. } => "unknown",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.encode_payload(&mut v)
            .expect("in-memory encode cannot fail");
        v
    }

    fn encode_payload<W: Write>(&self, w: &mut W) -> Result<usize, ProtocolError> {
        match self {
            NetworkMessage::Version(m) => m.encode(w),
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => nonce.encode(w),
            NetworkMessage::Addr(list) => write_list(w, list),
            NetworkMessage::Inv(items)
            | NetworkMessage::GetData(items)
            | NetworkMessage::NotFound(items) => write_list(w, items),
            NetworkMessage::GetHeaders(m) | NetworkMessage::GetBlocks(m) => m.encode(w),
            NetworkMessage::Headers(entries) => write_list(w, entries),
            NetworkMessage::Block(b) => b.encode(w),
            NetworkMessage::Tx(tx) => tx.encode(w),
            NetworkMessage::FilterLoad(m) => m.encode(w),
            NetworkMessage::FilterAdd(data) => write_bytes(w, data),
            NetworkMessage::MerkleBlock(m) => m.encode(w),
            NetworkMessage::Reject(m) => m.encode(w),
            NetworkMessage::Verack
            | NetworkMessage::GetAddr
            | NetworkMessage::FilterClear
            | NetworkMessage::Alert
            | NetworkMessage::Mempool
            | NetworkMessage::Unknown { .. } => Ok(0),
        }
    }

    /// Decode a payload for `command`. Unknown commands succeed as
    /// `Unknown`, matching the tolerant-reader rule of the protocol.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match command {
            "version" => NetworkMessage::Version(VersionMessage::decode_all(payload)?),
            "verack" => NetworkMessage::Verack,
            "ping" => NetworkMessage::Ping(u64::decode_all(payload)?),
            "pong" => NetworkMessage::Pong(u64::decode_all(payload)?),
            "getaddr" => NetworkMessage::GetAddr,
            "addr" => {
                let mut cur = std::io::Cursor::new(payload);
                NetworkMessage::Addr(read_list(&mut cur, 1_000)?)
            }
            "inv" => NetworkMessage::Inv(Self::decode_inv(payload)?),
            "getdata" => NetworkMessage::GetData(Self::decode_inv(payload)?),
            "notfound" => NetworkMessage::NotFound(Self::decode_inv(payload)?),
            "getheaders" => NetworkMessage::GetHeaders(GetHeadersMessage::decode_all(payload)?),
            "getblocks" => NetworkMessage::GetBlocks(GetHeadersMessage::decode_all(payload)?),
            "headers" => {
                let mut cur = std::io::Cursor::new(payload);
                NetworkMessage::Headers(read_list(&mut cur, 2_000)?)
            }
            "block" => NetworkMessage::Block(Block::decode_all(payload)?),
            "tx" => NetworkMessage::Tx(Transaction::decode_all(payload)?),
            "filterload" => NetworkMessage::FilterLoad(FilterLoadMessage::decode_all(payload)?),
            "filteradd" => {
                let mut cur = std::io::Cursor::new(payload);
                NetworkMessage::FilterAdd(read_bytes(&mut cur)?)
            }
            "filterclear" => NetworkMessage::FilterClear,
            "merkleblock" => NetworkMessage::MerkleBlock(MerkleBlockMessage::decode_all(payload)?),
            "reject" => NetworkMessage::Reject(RejectMessage::decode_all(payload)?),
            "alert" => NetworkMessage::Alert,
            "mempool" => NetworkMessage::Mempool,
            other => NetworkMessage::Unknown {
                command: other.to_string(),
            },
        })
    }

    fn decode_inv(payload: &[u8]) -> Result<Vec<InvItem>, ProtocolError> {
        let mut cur = std::io::Cursor::new(payload);
        let items = read_list(&mut cur, 50_000)?;
        if cur.position() as usize != payload.len() {
            return Err(ProtocolError::Malformed("trailing bytes after inv list"));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::NetworkParameters;

    fn version_message() -> VersionMessage {
        let addr = NetAddr {
            services: NODE_NETWORK,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8333,
        };
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: 1_700_000_000,
            receiver: addr,
            sender: addr,
            nonce: 42,
            user_agent: "/kestrel:0.1.0/".to_string(),
            start_height: 0,
            relay: false,
        }
    }

    #[test]
    fn version_roundtrip() {
        let msg = NetworkMessage::Version(version_message());
        let payload = msg.payload();
        let restored = NetworkMessage::decode_payload("version", &payload).unwrap();
        assert_eq!(msg, restored);
    }

    #[test]
    fn version_without_relay_flag_tolerated() {
        let msg = version_message();
        let mut payload = msg.encode_to_vec();
        payload.pop();
        let restored = VersionMessage::decode_all(&payload).unwrap();
        assert!(restored.relay);
        assert_eq!(restored.nonce, msg.nonce);
    }

    #[test]
    fn netaddr_ipv4_is_v4_mapped() {
        let addr = NetAddr {
            services: NODE_NETWORK,
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 8333,
        };
        let bytes = addr.encode_to_vec();
        assert_eq!(bytes.len(), 26);
        // ::ffff: prefix at offset 8 + 10.
        assert_eq!(&bytes[18..20], &[0xFF, 0xFF]);
        // Big-endian port on the wire.
        assert_eq!(&bytes[24..26], &8333u16.to_be_bytes());
        assert_eq!(NetAddr::decode_all(&bytes).unwrap(), addr);
    }

    #[test]
    fn inv_roundtrip_and_kinds() {
        let items = vec![
            InvItem::tx(Sha256dHash::digest(b"t")),
            InvItem::block(Sha256dHash::digest(b"b")),
            InvItem::filtered_block(Sha256dHash::digest(b"f")),
        ];
        let msg = NetworkMessage::Inv(items.clone());
        let decoded = NetworkMessage::decode_payload("inv", &msg.payload()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(items[2].kind, INV_FILTERED_BLOCK);
    }

    #[test]
    fn headers_entries_carry_zero_txcount() {
        let params = NetworkParameters::mainnet();
        let msg = NetworkMessage::Headers(vec![HeadersEntry(params.genesis)]);
        let payload = msg.payload();
        // varint(1) + 80-byte header + varint(0)
        assert_eq!(payload.len(), 1 + 80 + 1);
        assert_eq!(NetworkMessage::decode_payload("headers", &payload).unwrap(), msg);
    }

    #[test]
    fn reject_with_and_without_hash() {
        let with = RejectMessage {
            message: "tx".into(),
            code: REJECT_INSUFFICIENT_FEE,
            reason: "insufficient fee".into(),
            data: Some(Sha256dHash::digest(b"x")),
        };
        let bytes = with.encode_to_vec();
        assert_eq!(RejectMessage::decode_all(&bytes).unwrap(), with);

        let without = RejectMessage {
            data: None,
            ..with.clone()
        };
        let bytes = without.encode_to_vec();
        assert_eq!(RejectMessage::decode_all(&bytes).unwrap(), without);
    }

    #[test]
    fn unknown_command_is_not_fatal() {
        let msg = NetworkMessage::decode_payload("sendcmpct", &[0x00, 0x01]).unwrap();
        assert_eq!(
            msg,
            NetworkMessage::Unknown {
                command: "sendcmpct".into()
            }
        );
    }
}
