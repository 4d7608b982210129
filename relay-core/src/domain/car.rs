//! CARv1 container decoding.
//!
//! A CAR file is a varint-length-prefixed header block (dag-cbor, naming the
//! root CIDs) followed by varint-length-prefixed `(CID, block bytes)`
//! records. Firehose messages carry repo commits this way; the write path
//! exists for repo export and fixtures.

use crate::foundation::{RelayError, Result};
use ipld_core::cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;

pub const DAG_CBOR_CODEC: u64 = 0x71;
pub const SHA2_256_CODE: u64 = 0x12;

/// CIDv1 (dag-cbor, sha2-256) of a serialized block.
pub fn dag_cbor_cid(data: &[u8]) -> Cid {
    let digest: [u8; 32] = Sha256::digest(data).into();
    let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest).expect("32-byte digest fits");
    Cid::new_v1(DAG_CBOR_CODEC, hash)
}

/// Random-access CID -> bytes map decoded from a CAR (or built up for one).
#[derive(Clone, Debug, Default)]
pub struct BlockMap {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    pub fn insert(&mut self, cid: Cid, data: Vec<u8>) {
        self.blocks.insert(cid, data);
    }

    /// Inserts dag-cbor bytes under their computed CID.
    pub fn insert_dag_cbor(&mut self, data: Vec<u8>) -> Cid {
        let cid = dag_cbor_cid(&data);
        self.blocks.insert(cid, data);
        cid
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &[u8])> {
        self.blocks.iter().map(|(cid, data)| (cid, data.as_slice()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CarHeader {
    roots: Vec<Cid>,
    version: u64,
}

#[derive(Debug)]
pub struct CarFile {
    pub roots: Vec<Cid>,
    pub blocks: BlockMap,
}

impl CarFile {
    /// Decodes a version-1 CAR. Block digests are checked against their CID.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let (header_bytes, mut rest) = take_section(bytes).map_err(|_| bad("truncated header"))?;
        let header: CarHeader =
            serde_ipld_dagcbor::from_slice(header_bytes).map_err(|err| bad(format!("header: {err}")))?;
        if header.version != 1 {
            return Err(bad(format!("unsupported version {}", header.version)));
        }
        if header.roots.is_empty() {
            return Err(bad("no roots"));
        }

        let mut blocks = BlockMap::new();
        while !rest.is_empty() {
            let (section, after) = take_section(rest).map_err(|_| bad("truncated record"))?;
            let mut cursor = Cursor::new(section);
            let cid = Cid::read_bytes(&mut cursor).map_err(|err| bad(format!("record cid: {err}")))?;
            let data = &section[cursor.position() as usize..];
            if cid.hash().code() == SHA2_256_CODE {
                let digest: [u8; 32] = Sha256::digest(data).into();
                if cid.hash().digest() != digest {
                    return Err(bad(format!("digest mismatch for {cid}")));
                }
            }
            blocks.insert(cid, data.to_vec());
            rest = after;
        }
        Ok(Self { roots: header.roots, blocks })
    }

    /// Encodes a single-root CAR.
    pub fn write(root: &Cid, blocks: &BlockMap) -> Result<Vec<u8>> {
        let header = CarHeader { roots: vec![*root], version: 1 };
        let header_bytes = serde_ipld_dagcbor::to_vec(&header)
            .map_err(|err| RelayError::Serialization { format: "dag-cbor".to_string(), details: err.to_string() })?;

        let mut out = Vec::new();
        put_varint(&mut out, header_bytes.len() as u64);
        out.extend_from_slice(&header_bytes);

        let mut ordered: Vec<(&Cid, &[u8])> = blocks.iter().collect();
        ordered.sort_by_key(|(cid, _)| cid.to_bytes());
        for (cid, data) in ordered {
            let cid_bytes = cid.to_bytes();
            put_varint(&mut out, (cid_bytes.len() + data.len()) as u64);
            out.extend_from_slice(&cid_bytes);
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    pub fn root(&self) -> &Cid {
        &self.roots[0]
    }
}

fn take_section(buf: &[u8]) -> std::result::Result<(&[u8], &[u8]), ()> {
    let (len, rest) = unsigned_varint::decode::u64(buf).map_err(|_| ())?;
    let len = usize::try_from(len).map_err(|_| ())?;
    if rest.len() < len {
        return Err(());
    }
    Ok(rest.split_at(len))
}

fn put_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

fn bad(details: impl std::fmt::Display) -> RelayError {
    RelayError::BadCar(details.to_string())
}
