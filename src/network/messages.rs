//! Concrete P2P message bodies and their bit-exact wire encodings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::chain::header::{BlockHeader, Hash256, Transaction};
use crate::chain::merkle::PartialMerkleTree;
use crate::network::wire::{
    write_hash256, write_var_bytes, write_var_str, write_varint, Reader, Result, WireError,
};

pub const PROTOCOL_VERSION: u32 = 70015;
pub const NODE_NETWORK: u64 = 1;
pub const NODE_BLOOM: u64 = 1 << 2;

/// A message body that knows its command name and how to encode/decode
/// itself against the shared `Reader`/`Vec<u8>` wire primitives.
pub trait WireMessage: Sized {
    const COMMAND: &'static str;
    fn encode_body(&self, out: &mut Vec<u8>);
    fn decode_body(r: &mut Reader) -> Result<Self>;
}

fn write_net_addr(out: &mut Vec<u8>, services: u64, addr: SocketAddr) {
    out.extend_from_slice(&services.to_le_bytes());
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&[0u8; 10]);
            out.extend_from_slice(&[0xff, 0xff]);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn read_net_addr(r: &mut Reader) -> Result<(u64, SocketAddr)> {
    let services = r.read_u64()?;
    let mut ip_bytes = [0u8; 16];
    for b in ip_bytes.iter_mut() {
        *b = r.read_u8()?;
    }
    let port = u16::from_be_bytes([r.read_u8()?, r.read_u8()?]);
    let ip = if ip_bytes[0..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff] {
        IpAddr::V4(Ipv4Addr::new(ip_bytes[12], ip_bytes[13], ip_bytes[14], ip_bytes[15]))
    } else {
        IpAddr::V6(ip_bytes.into())
    };
    Ok((services, SocketAddr::new(ip, port)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver_addr: SocketAddr,
    pub sender_addr: SocketAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl WireMessage for VersionMessage {
    const COMMAND: &'static str = "version";

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        write_net_addr(out, NODE_NETWORK, self.receiver_addr);
        write_net_addr(out, self.services, self.sender_addr);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_var_str(out, &self.user_agent);
        out.extend_from_slice(&self.start_height.to_le_bytes());
        out.push(self.relay as u8);
    }

    fn decode_body(r: &mut Reader) -> Result<Self> {
        let version = r.read_u32()?;
        let services = r.read_u64()?;
        let timestamp = r.read_i64()?;
        let (_, receiver_addr) = read_net_addr(r)?;
        let (_, sender_addr) = read_net_addr(r)?;
        let nonce = r.read_u64()?;
        let user_agent = r.read_var_str()?;
        let start_height = r.read_i32()?;
        // Pre-70001 peers omit the relay flag; treat EOF here as `true`.
        let relay = r.read_bool().unwrap_or(true);
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            receiver_addr,
            sender_addr,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerackMessage;

impl WireMessage for VerackMessage {
    const COMMAND: &'static str = "verack";
    fn encode_body(&self, _out: &mut Vec<u8>) {}
    fn decode_body(_r: &mut Reader) -> Result<Self> {
        Ok(VerackMessage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub nonce: u64,
}

impl WireMessage for PingMessage {
    const COMMAND: &'static str = "ping";
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(PingMessage { nonce: r.read_u64()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {
    pub nonce: u64,
}

impl WireMessage for PongMessage {
    const COMMAND: &'static str = "pong";
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(PongMessage { nonce: r.read_u64()? })
    }
}

/// The kind carried by an `InvEntry` / requested via `GetData`. Witness
/// variants are plain variants (not a type|flag bitmask) carried over the
/// wire as the BIP144 type codes for compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryKind {
    Tx,
    Block,
    FilteredBlock,
    WitnessTx,
    WitnessBlock,
}

impl InventoryKind {
    fn to_code(self) -> u32 {
        match self {
            InventoryKind::Tx => 1,
            InventoryKind::Block => 2,
            InventoryKind::FilteredBlock => 3,
            InventoryKind::WitnessTx => 0x4000_0001,
            InventoryKind::WitnessBlock => 0x4000_0002,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => InventoryKind::Tx,
            2 => InventoryKind::Block,
            3 => InventoryKind::FilteredBlock,
            0x4000_0001 => InventoryKind::WitnessTx,
            0x4000_0002 => InventoryKind::WitnessBlock,
            other => return Err(WireError::UnknownInventoryKind(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash256,
}

fn write_inv_items(out: &mut Vec<u8>, items: &[InventoryItem]) {
    write_varint(out, items.len() as u64);
    for item in items {
        out.extend_from_slice(&item.kind.to_code().to_le_bytes());
        write_hash256(out, &item.hash);
    }
}

fn read_inv_items(r: &mut Reader) -> Result<Vec<InventoryItem>> {
    let count = r.read_varint()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = InventoryKind::from_code(r.read_u32()?)?;
        let hash = r.read_hash256()?;
        items.push(InventoryItem { kind, hash });
    }
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvMessage {
    pub items: Vec<InventoryItem>,
}

impl WireMessage for InvMessage {
    const COMMAND: &'static str = "inv";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_inv_items(out, &self.items);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(InvMessage { items: read_inv_items(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataMessage {
    pub items: Vec<InventoryItem>,
}

impl WireMessage for GetDataMessage {
    const COMMAND: &'static str = "getdata";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_inv_items(out, &self.items);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(GetDataMessage { items: read_inv_items(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFoundMessage {
    pub items: Vec<InventoryItem>,
}

impl WireMessage for NotFoundMessage {
    const COMMAND: &'static str = "notfound";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_inv_items(out, &self.items);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(NotFoundMessage { items: read_inv_items(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator_hashes: Vec<Hash256>,
    pub stop_hash: Hash256,
}

impl WireMessage for GetBlocksMessage {
    const COMMAND: &'static str = "getblocks";
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(out, self.locator_hashes.len() as u64);
        for h in &self.locator_hashes {
            write_hash256(out, h);
        }
        write_hash256(out, &self.stop_hash);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        let version = r.read_u32()?;
        let count = r.read_varint()?;
        let mut locator_hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator_hashes.push(r.read_hash256()?);
        }
        let stop_hash = r.read_hash256()?;
        Ok(GetBlocksMessage {
            version,
            locator_hashes,
            stop_hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator_hashes: Vec<Hash256>,
    pub stop_hash: Hash256,
}

impl WireMessage for GetHeadersMessage {
    const COMMAND: &'static str = "getheaders";
    fn encode_body(&self, out: &mut Vec<u8>) {
        GetBlocksMessage {
            version: self.version,
            locator_hashes: self.locator_hashes.clone(),
            stop_hash: self.stop_hash,
        }
        .encode_body(out)
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        let inner = GetBlocksMessage::decode_body(r)?;
        Ok(GetHeadersMessage {
            version: inner.version,
            locator_hashes: inner.locator_hashes,
            stop_hash: inner.stop_hash,
        })
    }
}

fn write_header(out: &mut Vec<u8>, header: &BlockHeader) {
    out.extend_from_slice(&header.to_bytes());
}

fn read_header(r: &mut Reader) -> Result<BlockHeader> {
    let mut buf = [0u8; 80];
    for b in buf.iter_mut() {
        *b = r.read_u8()?;
    }
    Ok(BlockHeader::from_bytes(&buf))
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

impl WireMessage for HeadersMessage {
    const COMMAND: &'static str = "headers";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_varint(out, self.headers.len() as u64);
        for h in &self.headers {
            write_header(out, h);
            write_varint(out, 0); // tx_count, always 0 on the headers-only wire
        }
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        let count = r.read_varint()?;
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            headers.push(read_header(r)?);
            let _tx_count = r.read_varint()?;
        }
        Ok(HeadersMessage { headers })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxMessage {
    pub tx: Transaction,
}

impl WireMessage for TxMessage {
    const COMMAND: &'static str = "tx";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, &self.tx.payload);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(TxMessage {
            tx: Transaction {
                payload: r.read_var_bytes()?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMessage {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl WireMessage for BlockMessage {
    const COMMAND: &'static str = "block";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_header(out, &self.header);
        write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            write_var_bytes(out, &tx.payload);
        }
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        let header = read_header(r)?;
        let count = r.read_varint()?;
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction {
                payload: r.read_var_bytes()?,
            });
        }
        Ok(BlockMessage { header, transactions })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub partial_tree: PartialMerkleTree,
}

impl WireMessage for MerkleBlockMessage {
    const COMMAND: &'static str = "merkleblock";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_header(out, &self.header);
        out.extend_from_slice(&self.partial_tree.tx_count.to_le_bytes());
        write_varint(out, self.partial_tree.hashes.len() as u64);
        for h in &self.partial_tree.hashes {
            write_hash256(out, h);
        }
        write_var_bytes(out, &self.partial_tree.flags);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        let header = read_header(r)?;
        let tx_count = r.read_u32()?;
        let hash_count = r.read_varint()?;
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            hashes.push(r.read_hash256()?);
        }
        let flags = r.read_var_bytes()?;
        Ok(MerkleBlockMessage {
            header,
            partial_tree: PartialMerkleTree::new(tx_count, hashes, flags),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl WireMessage for FilterLoadMessage {
    const COMMAND: &'static str = "filterload";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, &self.filter);
        out.extend_from_slice(&self.hash_funcs.to_le_bytes());
        out.extend_from_slice(&self.tweak.to_le_bytes());
        out.push(self.flags);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(FilterLoadMessage {
            filter: r.read_var_bytes()?,
            hash_funcs: r.read_u32()?,
            tweak: r.read_u32()?,
            flags: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterAddMessage {
    pub data: Vec<u8>,
}

impl WireMessage for FilterAddMessage {
    const COMMAND: &'static str = "filteradd";
    fn encode_body(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, &self.data);
    }
    fn decode_body(r: &mut Reader) -> Result<Self> {
        Ok(FilterAddMessage { data: r.read_var_bytes()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPoolMessage;

impl WireMessage for MemPoolMessage {
    const COMMAND: &'static str = "mempool";
    fn encode_body(&self, _out: &mut Vec<u8>) {}
    fn decode_body(_r: &mut Reader) -> Result<Self> {
        Ok(MemPoolMessage)
    }
}

/// Every message body this node understands, tagged with the command name
/// it arrived/departs under.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack(VerackMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Inv(InvMessage),
    GetData(GetDataMessage),
    NotFound(NotFoundMessage),
    GetBlocks(GetBlocksMessage),
    GetHeaders(GetHeadersMessage),
    Headers(HeadersMessage),
    Tx(TxMessage),
    Block(BlockMessage),
    MerkleBlock(MerkleBlockMessage),
    FilterLoad(FilterLoadMessage),
    FilterAdd(FilterAddMessage),
    MemPool(MemPoolMessage),
}

impl NetworkMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => VersionMessage::COMMAND,
            NetworkMessage::Verack(_) => VerackMessage::COMMAND,
            NetworkMessage::Ping(_) => PingMessage::COMMAND,
            NetworkMessage::Pong(_) => PongMessage::COMMAND,
            NetworkMessage::Inv(_) => InvMessage::COMMAND,
            NetworkMessage::GetData(_) => GetDataMessage::COMMAND,
            NetworkMessage::NotFound(_) => NotFoundMessage::COMMAND,
            NetworkMessage::GetBlocks(_) => GetBlocksMessage::COMMAND,
            NetworkMessage::GetHeaders(_) => GetHeadersMessage::COMMAND,
            NetworkMessage::Headers(_) => HeadersMessage::COMMAND,
            NetworkMessage::Tx(_) => TxMessage::COMMAND,
            NetworkMessage::Block(_) => BlockMessage::COMMAND,
            NetworkMessage::MerkleBlock(_) => MerkleBlockMessage::COMMAND,
            NetworkMessage::FilterLoad(_) => FilterLoadMessage::COMMAND,
            NetworkMessage::FilterAdd(_) => FilterAddMessage::COMMAND,
            NetworkMessage::MemPool(_) => MemPoolMessage::COMMAND,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            NetworkMessage::Version(m) => m.encode_body(&mut out),
            NetworkMessage::Verack(m) => m.encode_body(&mut out),
            NetworkMessage::Ping(m) => m.encode_body(&mut out),
            NetworkMessage::Pong(m) => m.encode_body(&mut out),
            NetworkMessage::Inv(m) => m.encode_body(&mut out),
            NetworkMessage::GetData(m) => m.encode_body(&mut out),
            NetworkMessage::NotFound(m) => m.encode_body(&mut out),
            NetworkMessage::GetBlocks(m) => m.encode_body(&mut out),
            NetworkMessage::GetHeaders(m) => m.encode_body(&mut out),
            NetworkMessage::Headers(m) => m.encode_body(&mut out),
            NetworkMessage::Tx(m) => m.encode_body(&mut out),
            NetworkMessage::Block(m) => m.encode_body(&mut out),
            NetworkMessage::MerkleBlock(m) => m.encode_body(&mut out),
            NetworkMessage::FilterLoad(m) => m.encode_body(&mut out),
            NetworkMessage::FilterAdd(m) => m.encode_body(&mut out),
            NetworkMessage::MemPool(m) => m.encode_body(&mut out),
        }
        out
    }

    /// Decode a payload given the command name read off the wire. Unknown
    /// commands are the caller's responsibility to ignore (forward
    /// compatibility, per the error-handling design); this returns `None`
    /// rather than an error for them.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(payload);
        let msg = match command {
            "version" => NetworkMessage::Version(VersionMessage::decode_body(&mut r)?),
            "verack" => NetworkMessage::Verack(VerackMessage::decode_body(&mut r)?),
            "ping" => NetworkMessage::Ping(PingMessage::decode_body(&mut r)?),
            "pong" => NetworkMessage::Pong(PongMessage::decode_body(&mut r)?),
            "inv" => NetworkMessage::Inv(InvMessage::decode_body(&mut r)?),
            "getdata" => NetworkMessage::GetData(GetDataMessage::decode_body(&mut r)?),
            "notfound" => NetworkMessage::NotFound(NotFoundMessage::decode_body(&mut r)?),
            "getblocks" => NetworkMessage::GetBlocks(GetBlocksMessage::decode_body(&mut r)?),
            "getheaders" => NetworkMessage::GetHeaders(GetHeadersMessage::decode_body(&mut r)?),
            "headers" => NetworkMessage::Headers(HeadersMessage::decode_body(&mut r)?),
            "tx" => NetworkMessage::Tx(TxMessage::decode_body(&mut r)?),
            "block" => NetworkMessage::Block(BlockMessage::decode_body(&mut r)?),
            "merkleblock" => NetworkMessage::MerkleBlock(MerkleBlockMessage::decode_body(&mut r)?),
            "filterload" => NetworkMessage::FilterLoad(FilterLoadMessage::decode_body(&mut r)?),
            "filteradd" => NetworkMessage::FilterAdd(FilterAddMessage::decode_body(&mut r)?),
            "mempool" => NetworkMessage::MemPool(MemPoolMessage::decode_body(&mut r)?),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_round_trip() {
        let ping = NetworkMessage::Ping(PingMessage { nonce: 42 });
        let payload = ping.encode_payload();
        let decoded = NetworkMessage::decode("ping", &payload).unwrap().unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn version_message_round_trips() {
        let msg = VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: 1_700_000_000,
            receiver_addr: "127.0.0.1:8333".parse().unwrap(),
            sender_addr: "127.0.0.1:8334".parse().unwrap(),
            nonce: 0xdead_beef,
            user_agent: "/btpc-header-node:0.1/".to_string(),
            start_height: 1024,
            relay: false,
        };
        let mut out = Vec::new();
        msg.encode_body(&mut out);
        let mut r = Reader::new(&out);
        let decoded = VersionMessage::decode_body(&mut r).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn version_message_decodes_bitcoinj_style_payload() {
        let msg = VersionMessage {
            version: 70001,
            services: NODE_NETWORK,
            timestamp: 1_400_000_000,
            receiver_addr: "127.0.0.1:8333".parse().unwrap(),
            sender_addr: "127.0.0.1:8333".parse().unwrap(),
            nonce: 0x1122_3344_5566_7788,
            user_agent: "/bitcoinj:0.13/".to_string(),
            start_height: 1024,
            relay: false,
        };
        let mut out = Vec::new();
        msg.encode_body(&mut out);
        let decoded = VersionMessage::decode_body(&mut Reader::new(&out)).unwrap();
        assert_eq!(decoded.start_height, 1024);
        assert_eq!(decoded.user_agent, "/bitcoinj:0.13/");
        assert!(!decoded.relay);
    }

    #[test]
    fn version_message_without_relay_byte_defaults_to_true() {
        let msg = VersionMessage {
            version: 60000,
            services: NODE_NETWORK,
            timestamp: 1_400_000_000,
            receiver_addr: "127.0.0.1:8333".parse().unwrap(),
            sender_addr: "127.0.0.1:8333".parse().unwrap(),
            nonce: 1,
            user_agent: "/old-peer:0.1/".to_string(),
            start_height: 0,
            relay: true,
        };
        let mut out = Vec::new();
        msg.encode_body(&mut out);
        out.truncate(out.len() - 1); // drop the trailing relay byte, as pre-70001 peers do
        let decoded = VersionMessage::decode_body(&mut Reader::new(&out)).unwrap();
        assert!(decoded.relay);
    }

    #[test]
    fn unknown_command_decodes_to_none() {
        assert!(NetworkMessage::decode("notacommand", &[]).unwrap().is_none());
    }

    #[test]
    fn inv_message_round_trips_mixed_kinds() {
        let items = vec![
            InventoryItem {
                kind: InventoryKind::Tx,
                hash: Hash256([1u8; 32]),
            },
            InventoryItem {
                kind: InventoryKind::FilteredBlock,
                hash: Hash256([2u8; 32]),
            },
        ];
        let msg = NetworkMessage::Inv(InvMessage { items: items.clone() });
        let payload = msg.encode_payload();
        let decoded = NetworkMessage::decode("inv", &payload).unwrap().unwrap();
        match decoded {
            NetworkMessage::Inv(inv) => assert_eq!(inv.items, items),
            _ => panic!("wrong variant"),
        }
    }
}
