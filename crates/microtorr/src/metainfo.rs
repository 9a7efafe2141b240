//! The `.mtorrent` descriptor of a single shared file.
//!
//! The descriptor is bencoded and holds everything a client needs to join a
//! swarm and verify what it downloads: the tracker address, the file name and
//! length, the piece length, the concatenated SHA-1 digests of every piece and
//! the digest of the whole file, which also identifies the swarm.
use std::{fmt::Display, path::Path};

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};
use sha1_smol::Sha1;
use speedy::{Readable, Writable};

use crate::{
    error::Error,
    tcp_wire::{MAX_MESSAGE_SIZE, PIECE_HEADER_LEN},
};

/// Default piece length, in bytes.
pub const DEFAULT_PIECE_LENGTH: u32 = 16_000;

/// Default tracker address written into new descriptors.
pub const DEFAULT_TRACKER: &str = "http://127.0.0.1:8888";

/// Length of a SHA-1 digest.
pub const HASH_LEN: usize = 20;

/// Largest piece that still fits in one `PIECE` frame.
pub const MAX_PIECE_LENGTH: u32 = (MAX_MESSAGE_SIZE - PIECE_HEADER_LEN) as u32;

fn check_piece_length(piece_length: u32) -> Result<(), Error> {
    if piece_length == 0 {
        return Err(Error::MetaInfoInvalid(
            "piece length must be greater than zero".into(),
        ));
    }
    if piece_length > MAX_PIECE_LENGTH {
        return Err(Error::MetaInfoInvalid(format!(
            "piece length {piece_length} is above the maximum of {MAX_PIECE_LENGTH}"
        )));
    }
    Ok(())
}

/// SHA-1 of the whole shared file. Every peer of a swarm shares this value,
/// it is exchanged in the handshake and announced to the tracker in hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct SwarmId(pub [u8; HASH_LEN]);

impl Display for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<SwarmId> for [u8; HASH_LEN] {
    fn from(value: SwarmId) -> Self {
        value.0
    }
}

/// SHA-1 digest of a buffer.
pub fn sha1(buf: &[u8]) -> [u8; HASH_LEN] {
    Sha1::from(buf).digest().bytes()
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    /// Base URL of the tracker.
    pub announce: String,
    pub info: Info,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Size of the file in bytes.
    pub length: u64,
    pub name: String,
    pub piece_length: u32,
    /// Piece digests, 20 bytes each, back to back in index order.
    pub pieces: Vec<u8>,
    /// SHA1 of the entire file.
    pub file_hash: [u8; HASH_LEN],
}

impl MetaInfo {
    /// Build the descriptor of a file that is already in memory.
    pub fn from_bytes(
        name: impl Into<String>,
        data: &[u8],
        announce: impl Into<String>,
        piece_length: u32,
    ) -> Result<Self, Error> {
        check_piece_length(piece_length)?;
        let mut pieces =
            Vec::with_capacity(data.len().div_ceil(piece_length as usize) * HASH_LEN);

        for piece in data.chunks(piece_length as usize) {
            pieces.extend_from_slice(&sha1(piece));
        }

        Ok(Self {
            announce: announce.into(),
            info: Info {
                length: data.len() as u64,
                name: name.into(),
                piece_length,
                pieces,
                file_hash: sha1(data),
            },
        })
    }

    /// Read a source file and create its descriptor.
    pub async fn create(
        path: impl AsRef<Path>,
        announce: impl Into<String>,
        piece_length: u32,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::MetaInfoInvalid("source has no file name".into()))?;

        Self::from_bytes(name, &data, announce, piece_length)
    }

    /// Load and validate a descriptor from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let buf = tokio::fs::read(path).await?;
        let meta = Self::from_bencode(&buf)?;
        meta.validate()?;
        Ok(meta)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let buf = self.to_bencode()?;
        tokio::fs::write(path, buf).await?;
        Ok(())
    }

    /// The descriptor must carry exactly one digest per piece.
    pub fn validate(&self) -> Result<(), Error> {
        check_piece_length(self.info.piece_length)?;
        if self.info.pieces.len() != self.pieces_count() * HASH_LEN {
            return Err(Error::MetaInfoInvalid(format!(
                "expected {} piece hashes, found {} bytes",
                self.pieces_count(),
                self.info.pieces.len()
            )));
        }
        Ok(())
    }

    pub fn swarm_id(&self) -> SwarmId {
        SwarmId(self.info.file_hash)
    }

    /// ceil(length / piece_length)
    pub fn pieces_count(&self) -> usize {
        if self.info.piece_length == 0 {
            return 0;
        }
        self.info.length.div_ceil(self.info.piece_length as u64) as usize
    }

    /// Length of a piece, the last one may be shorter.
    pub fn piece_len(&self, index: usize) -> u32 {
        let piece_length = self.info.piece_length as u64;
        let begin = index as u64 * piece_length;
        self.info.length.saturating_sub(begin).min(piece_length) as u32
    }

    /// The expected hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<[u8; HASH_LEN]> {
        let begin = index * HASH_LEN;
        let slice = self.info.pieces.get(begin..begin + HASH_LEN)?;
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Every piece hash, in index order.
    pub fn piece_hashes(&self) -> Vec<[u8; HASH_LEN]> {
        (0..self.pieces_count()).filter_map(|i| self.piece_hash(i)).collect()
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;
            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", &self.length)?;
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", &self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))?;
            e.emit_pair(b"sha1", AsString(&self.file_hash[..]))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let announce =
            announce.ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let info = info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut file_hash = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                (b"sha1", value) => {
                    let bytes = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("sha1")?
                        .0;
                    let hash: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
                        decoding::Error::unexpected_token("20 bytes", "digest")
                    })?;
                    file_hash = Some(hash);
                }
                _ => {}
            }
        }

        let length = length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces = pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;
        let file_hash =
            file_hash.ok_or_else(|| decoding::Error::missing_field("sha1"))?;

        Ok(Info { length, name, piece_length, pieces, file_hash })
    }
}
