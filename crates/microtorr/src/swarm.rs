//! State shared by every task of a client: what each connected peer owns and
//! how fast it served us, which pieces we own, and whether we are seeding.
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use hashbrown::HashMap;
use rand::{seq::SliceRandom, Rng};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::{sha1, HASH_LEN},
    peer::PeerId,
};

/// Speed of a peer that never served us. It ranks above every measured speed
/// so new peers get probed first.
pub const SPEED_UNKNOWN: f64 = f64::MAX;

/// Speed of a peer that refused a request.
pub const SPEED_REJECTED: f64 = -1.0;

#[derive(Debug, Default)]
struct PeerTable {
    bitfields: HashMap<PeerId, Bitfield>,
    speeds: HashMap<PeerId, f64>,
}

/// Bitfield and speed of every connected peer.
///
/// Both maps live under the same lock and are only touched through the
/// methods below, so they always hold the same set of peers.
#[derive(Debug)]
pub struct SwarmPeers {
    pieces_count: usize,
    table: RwLock<PeerTable>,
}

impl SwarmPeers {
    pub fn new(pieces_count: usize) -> Self {
        Self { pieces_count, table: RwLock::new(PeerTable::default()) }
    }

    /// Register a peer that owns nothing yet. Returns false if it was
    /// already known, in which case its state is left untouched.
    pub async fn add_peer(&self, id: PeerId) -> bool {
        let mut table = self.table.write().await;
        if table.bitfields.contains_key(&id) {
            return false;
        }
        table.bitfields.insert(id, Bitfield::from_piece(self.pieces_count));
        table.speeds.insert(id, SPEED_UNKNOWN);
        true
    }

    pub async fn delete_peer(&self, id: &PeerId) -> bool {
        let mut table = self.table.write().await;
        table.speeds.remove(id);
        table.bitfields.remove(id).is_some()
    }

    /// Replace the bitfield of a known peer. The bitfield is trimmed or padded
    /// to the number of pieces of the swarm.
    pub async fn set_bitfield(&self, id: &PeerId, bitfield: Bitfield) -> bool {
        let mut table = self.table.write().await;
        let Some(current) = table.bitfields.get_mut(id) else {
            return false;
        };
        *current = Bitfield::from_wire(bitfield.into_vec(), self.pieces_count);
        true
    }

    /// Mark one more piece as owned by a known peer.
    pub async fn add_piece(&self, id: &PeerId, index: usize) -> bool {
        let mut table = self.table.write().await;
        let Some(bitfield) = table.bitfields.get_mut(id) else {
            return false;
        };
        if !bitfield.try_set(index) {
            warn!("{id:?} announced piece {index} which is out of bounds");
            return false;
        }
        true
    }

    pub async fn set_speed(&self, id: &PeerId, speed: f64) -> bool {
        let mut table = self.table.write().await;
        match table.speeds.get_mut(id) {
            Some(s) => {
                *s = speed;
                true
            }
            None => false,
        }
    }

    pub async fn speed(&self, id: &PeerId) -> Option<f64> {
        self.table.read().await.speeds.get(id).copied()
    }

    pub async fn bitfield(&self, id: &PeerId) -> Option<Bitfield> {
        self.table.read().await.bitfields.get(id).cloned()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.table.read().await.bitfields.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.bitfields.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_seeder(&self, id: &PeerId) -> bool {
        self.table.read().await.bitfields.get(id).is_some_and(|b| b.is_full())
    }

    pub async fn num_seeders(&self) -> usize {
        self.table.read().await.bitfields.values().filter(|b| b.is_full()).count()
    }

    pub async fn num_leechers(&self) -> usize {
        self.table.read().await.bitfields.values().filter(|b| !b.is_full()).count()
    }

    /// Number of connected peers owning each piece.
    async fn rarities(&self) -> Vec<usize> {
        let table = self.table.read().await;

        let mut rarities = vec![0usize; self.pieces_count];
        for bitfield in table.bitfields.values() {
            for index in bitfield.iter_ones() {
                rarities[index] += 1;
            }
        }
        rarities
    }

    /// The pieces we don't have that are owned by the fewest peers. Every
    /// returned piece has the same owner count, the minimum among the pieces
    /// missing from `have`. Empty when nothing is missing.
    pub async fn rarest_pieces(&self, have: &Bitfield) -> Vec<usize> {
        let rarities = self.rarities().await;
        rarest_of(
            (0..self.pieces_count).filter(|i| !have.has(*i)),
            &rarities,
        )
    }

    /// Like [`Self::rarest_pieces`], among the missing pieces at least one
    /// connected peer owns. Empty when nobody can serve a missing piece.
    pub async fn rarest_available(&self, have: &Bitfield) -> Vec<usize> {
        let rarities = self.rarities().await;
        rarest_of(
            (0..self.pieces_count).filter(|i| !have.has(*i) && rarities[*i] > 0),
            &rarities,
        )
    }

    /// Peers that own `index`, with their speed.
    pub async fn owners(&self, index: usize) -> Vec<(PeerId, f64)> {
        let table = self.table.read().await;
        table
            .bitfields
            .iter()
            .filter(|(_, b)| b.has(index))
            .map(|(id, _)| (*id, table.speeds.get(id).copied().unwrap_or(SPEED_UNKNOWN)))
            .collect()
    }

    /// Choose who to request `index` from. With probability `opportunism` the
    /// fastest owner is picked, otherwise any owner at random.
    pub async fn pick_peer<R: Rng>(
        &self,
        index: usize,
        opportunism: f64,
        rng: &mut R,
    ) -> Option<PeerId> {
        let mut owners = self.owners(index).await;
        // hash map order is random, sort so a seeded rng is reproducible
        owners.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        pick_owner(&owners, opportunism, rng)
    }
}

fn rarest_of(candidates: impl Iterator<Item = usize> + Clone, rarities: &[usize]) -> Vec<usize> {
    let Some(min) = candidates.clone().map(|i| rarities[i]).min() else {
        return Vec::new();
    };
    candidates.filter(|i| rarities[*i] == min).collect()
}

/// Peer pick among the owners of a piece. Rejected peers are never the
/// "fastest", if every owner rejected us the choice falls back to random.
pub fn pick_owner<R: Rng>(
    owners: &[(PeerId, f64)],
    opportunism: f64,
    rng: &mut R,
) -> Option<PeerId> {
    if owners.is_empty() {
        return None;
    }

    if rng.gen_bool(opportunism.clamp(0.0, 1.0)) {
        let best = owners
            .iter()
            .map(|(_, s)| *s)
            .filter(|s| *s > SPEED_REJECTED)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

        if let Some(best) = best {
            let fastest: Vec<&PeerId> =
                owners.iter().filter(|(_, s)| *s == best).map(|(id, _)| id).collect();
            return fastest.choose(rng).map(|id| **id);
        }
    }

    owners.choose(rng).map(|(id, _)| *id)
}

#[derive(Debug)]
struct Pieces {
    data: Vec<Option<Bytes>>,
    hashes: Vec<[u8; HASH_LEN]>,
    have: Bitfield,
}

/// The pieces this client owns, their bytes and their expected hashes.
#[derive(Debug)]
pub struct PieceStore {
    pieces: RwLock<Pieces>,
}

/// Check a piece against its expected digest.
pub fn verify_piece(data: &[u8], expected: &[u8; HASH_LEN]) -> bool {
    sha1(data) == *expected
}

impl PieceStore {
    pub fn new(hashes: Vec<[u8; HASH_LEN]>) -> Self {
        let count = hashes.len();
        Self {
            pieces: RwLock::new(Pieces {
                data: vec![None; count],
                have: Bitfield::from_piece(count),
                hashes,
            }),
        }
    }

    /// Verify and store a piece. Returns `Ok(false)` when the piece was
    /// already owned, its stored bytes are then left untouched.
    pub async fn add_piece(&self, index: u32, data: Bytes) -> Result<bool, Error> {
        let i = index as usize;
        let mut pieces = self.pieces.write().await;

        let Some(expected) = pieces.hashes.get(i) else {
            return Err(Error::PieceOutOfBounds(index));
        };
        if pieces.have.has(i) {
            debug!("piece {index} is already owned");
            return Ok(false);
        }
        if !verify_piece(&data, expected) {
            return Err(Error::PieceInvalid(index));
        }

        pieces.data[i] = Some(data);
        pieces.have.set(i, true);
        Ok(true)
    }

    pub async fn get_piece(&self, index: u32) -> Option<Bytes> {
        self.pieces.read().await.data.get(index as usize).cloned().flatten()
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.pieces.read().await.have.has(index)
    }

    /// Snapshot of the pieces we own.
    pub async fn have(&self) -> Bitfield {
        self.pieces.read().await.have.clone()
    }

    pub async fn is_complete(&self) -> bool {
        self.pieces.read().await.have.is_full()
    }

    pub async fn missing(&self) -> usize {
        self.pieces.read().await.have.count_zeros()
    }

    pub async fn pieces_count(&self) -> usize {
        self.pieces.read().await.hashes.len()
    }

    /// Every piece concatenated in index order, or `None` while any piece is
    /// missing.
    pub async fn assemble(&self) -> Option<Vec<u8>> {
        let pieces = self.pieces.read().await;
        let len = pieces.data.iter().flatten().map(|p| p.len()).sum();
        let mut buf = Vec::with_capacity(len);

        for piece in pieces.data.iter() {
            buf.extend_from_slice(piece.as_ref()?);
        }
        Some(buf)
    }

    /// Load the complete file from disk, for seeding. Every piece is checked
    /// against the descriptor before being served.
    pub async fn load_seed(
        &self,
        path: impl AsRef<Path>,
        piece_length: u32,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        debug!("loading seed file {path:?}");

        let buf = Bytes::from(tokio::fs::read(path).await?);
        let count = self.pieces_count().await;

        if piece_length == 0 || buf.len().div_ceil(piece_length as usize) != count {
            return Err(Error::SeedFileInvalid);
        }

        for (index, begin) in (0..buf.len()).step_by(piece_length as usize).enumerate()
        {
            let end = (begin + piece_length as usize).min(buf.len());
            match self.add_piece(index as u32, buf.slice(begin..end)).await {
                Ok(_) => {}
                Err(Error::PieceInvalid(_)) => return Err(Error::SeedFileInvalid),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Whether this client serves a complete file instead of downloading it.
#[derive(Debug)]
pub struct SeedState {
    active: AtomicBool,
    auto_continue: bool,
    source: RwLock<Option<PathBuf>>,
}

impl SeedState {
    pub fn new(source: Option<PathBuf>, auto_continue: bool) -> Self {
        Self {
            active: AtomicBool::new(source.is_some()),
            auto_continue,
            source: RwLock::new(source),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether to keep seeding once a download completes.
    pub fn auto_continue(&self) -> bool {
        self.auto_continue
    }

    pub async fn source(&self) -> Option<PathBuf> {
        self.source.read().await.clone()
    }

    /// Start seeding the freshly written file.
    pub async fn activate(&self, source: PathBuf) {
        *self.source.write().await = Some(source);
        self.active.store(true, Ordering::Release);
    }
}

/// Everything the router, the scheduler and the uploader share.
#[derive(Debug)]
pub struct SwarmCtx {
    pub peers: SwarmPeers,
    pub store: PieceStore,
    pub seed: SeedState,
}

impl SwarmCtx {
    pub fn new(hashes: Vec<[u8; HASH_LEN]>, seed: SeedState) -> Self {
        Self { peers: SwarmPeers::new(hashes.len()), store: PieceStore::new(hashes), seed }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn peer(c: u8) -> PeerId {
        PeerId::from([c; 20])
    }

    fn bitfield(bits: &[u8]) -> Bitfield {
        let mut b = Bitfield::from_piece(bits.len());
        for (i, bit) in bits.iter().enumerate() {
            b.set(i, *bit == 1);
        }
        b
    }

    #[tokio::test]
    async fn peers_share_keys() {
        let peers = SwarmPeers::new(4);
        assert!(peers.add_peer(peer(b'a')).await);
        assert!(!peers.add_peer(peer(b'a')).await);

        assert_eq!(peers.speed(&peer(b'a')).await, Some(SPEED_UNKNOWN));
        assert_eq!(peers.bitfield(&peer(b'a')).await.unwrap().count_ones(), 0);

        assert!(peers.delete_peer(&peer(b'a')).await);
        assert_eq!(peers.speed(&peer(b'a')).await, None);
        assert_eq!(peers.bitfield(&peer(b'a')).await, None);
        assert!(peers.is_empty().await);

        // updates for unknown peers create nothing
        assert!(!peers.set_speed(&peer(b'b'), 10.0).await);
        assert!(!peers.add_piece(&peer(b'b'), 1).await);
        assert!(!peers.set_bitfield(&peer(b'b'), bitfield(&[1, 1, 1, 1])).await);
        assert!(peers.is_empty().await);
        assert_eq!(peers.speed(&peer(b'b')).await, None);
    }

    #[tokio::test]
    async fn seeders_and_leechers() {
        let peers = SwarmPeers::new(3);
        peers.add_peer(peer(b'a')).await;
        peers.add_peer(peer(b'b')).await;

        // a longer bitfield from the wire is trimmed to the piece count
        peers.set_bitfield(&peer(b'a'), bitfield(&[1, 1, 1, 0, 0, 0, 0, 0])).await;
        assert!(peers.is_seeder(&peer(b'a')).await);
        assert_eq!(peers.bitfield(&peer(b'a')).await.unwrap().len(), 3);

        peers.add_piece(&peer(b'b'), 0).await;
        peers.add_piece(&peer(b'b'), 1).await;
        assert!(!peers.add_piece(&peer(b'b'), 3).await);

        assert_eq!(peers.num_seeders().await, 1);
        assert_eq!(peers.num_leechers().await, 1);

        peers.add_piece(&peer(b'b'), 2).await;
        assert_eq!(peers.num_seeders().await, 2);
        assert_eq!(peers.num_leechers().await, 0);
    }

    #[tokio::test]
    async fn rarest_pieces() {
        let peers = SwarmPeers::new(5);
        for (id, bits) in [
            (b'a', [1, 1, 1, 1, 0]),
            (b'b', [1, 1, 0, 1, 0]),
            (b'c', [1, 0, 0, 1, 1]),
        ] {
            peers.add_peer(peer(id)).await;
            peers.set_bitfield(&peer(id), bitfield(&bits)).await;
        }

        // counts: [3, 2, 1, 3, 1]
        let have = bitfield(&[0, 0, 0, 0, 0]);
        assert_eq!(peers.rarest_pieces(&have).await, vec![2, 4]);

        // owned pieces are excluded even when they are the rarest
        let have = bitfield(&[0, 0, 1, 0, 1]);
        assert_eq!(peers.rarest_pieces(&have).await, vec![1]);

        let have = bitfield(&[1, 1, 1, 1, 1]);
        assert!(peers.rarest_pieces(&have).await.is_empty());
    }

    #[tokio::test]
    async fn rarest_available_skips_unowned_pieces() {
        let peers = SwarmPeers::new(4);
        for (id, bits) in [(b'a', [0, 1, 1, 0]), (b'b', [0, 0, 1, 0])] {
            peers.add_peer(peer(id)).await;
            peers.set_bitfield(&peer(id), bitfield(&bits)).await;
        }

        let have = bitfield(&[0, 0, 0, 0]);
        assert_eq!(peers.rarest_pieces(&have).await, vec![0, 3]);
        assert_eq!(peers.rarest_available(&have).await, vec![1]);

        let have = bitfield(&[0, 1, 1, 0]);
        assert!(peers.rarest_available(&have).await.is_empty());
        assert_eq!(peers.rarest_pieces(&have).await, vec![0, 3]);
    }

    #[tokio::test]
    async fn rarest_pieces_are_tied_at_the_minimum() {
        let mut rng = StdRng::seed_from_u64(7);
        let count = 16;

        for _ in 0..50 {
            let peers = SwarmPeers::new(count);
            for id in b'a'..b'f' {
                let bits: Vec<u8> = (0..count).map(|_| rng.gen_range(0..2)).collect();
                peers.add_peer(peer(id)).await;
                peers.set_bitfield(&peer(id), bitfield(&bits)).await;
            }
            let have: Vec<u8> = (0..count).map(|_| rng.gen_range(0..2)).collect();
            let have = bitfield(&have);

            let rarest = peers.rarest_pieces(&have).await;
            let owners = |i: usize| {
                let peers = &peers;
                async move { peers.owners(i).await.len() }
            };

            let mut min = usize::MAX;
            for i in (0..count).filter(|i| !have.has(*i)) {
                min = min.min(owners(i).await);
            }
            for i in &rarest {
                assert!(!have.has(*i));
                assert_eq!(owners(*i).await, min);
            }
            for i in (0..count).filter(|i| !have.has(*i)) {
                if owners(i).await == min {
                    assert!(rarest.contains(&i));
                }
            }
        }
    }

    #[test]
    fn pick_owner_prefers_the_fastest() {
        let mut rng = StdRng::seed_from_u64(42);
        let owners = vec![
            (peer(b'a'), 100.0),
            (peer(b'b'), 5_000.0),
            (peer(b'c'), 300.0),
            (peer(b'd'), SPEED_REJECTED),
        ];
        let p = 0.85;
        let trials = 20_000;

        let picked = (0..trials)
            .filter(|_| pick_owner(&owners, p, &mut rng) == Some(peer(b'b')))
            .count();

        let expected = p + (1.0 - p) / owners.len() as f64;
        let freq = picked as f64 / trials as f64;
        assert!((freq - expected).abs() < 0.02, "{freq} vs {expected}");
    }

    #[test]
    fn pick_owner_skips_rejected_peers() {
        let mut rng = StdRng::seed_from_u64(1);
        let owners = vec![(peer(b'a'), SPEED_REJECTED), (peer(b'b'), 1.0)];
        for _ in 0..100 {
            assert_eq!(pick_owner(&owners, 1.0, &mut rng), Some(peer(b'b')));
        }

        // everyone rejected us, fall back to random
        let owners = vec![(peer(b'a'), SPEED_REJECTED), (peer(b'b'), SPEED_REJECTED)];
        let picked_a =
            (0..1000).filter(|_| pick_owner(&owners, 1.0, &mut rng) == Some(peer(b'a'))).count();
        assert!(picked_a > 350 && picked_a < 650);

        assert_eq!(pick_owner(&[], 0.85, &mut rng), None);
    }

    #[test]
    fn pick_owner_probes_unknown_peers_first() {
        let mut rng = StdRng::seed_from_u64(3);
        let owners = vec![(peer(b'a'), 10_000.0), (peer(b'b'), SPEED_UNKNOWN)];
        for _ in 0..100 {
            assert_eq!(pick_owner(&owners, 1.0, &mut rng), Some(peer(b'b')));
        }
    }

    #[tokio::test]
    async fn piece_store() {
        let data: Vec<u8> = (0..100u8).collect();
        let pieces = [&data[..40], &data[40..80], &data[80..]];
        let store = PieceStore::new(pieces.iter().map(|p| sha1(p)).collect());

        assert!(!store.is_complete().await);
        assert_eq!(store.missing().await, 3);
        assert_eq!(store.assemble().await, None);

        assert!(store.add_piece(1, Bytes::copy_from_slice(pieces[1])).await.unwrap());
        assert!(store.has_piece(1).await);
        assert_eq!(store.get_piece(1).await.unwrap(), pieces[1]);
        assert_eq!(store.get_piece(0).await, None);
        assert_eq!(store.get_piece(7).await, None);

        // re-receiving an owned piece changes nothing
        assert!(!store.add_piece(1, Bytes::from_static(b"garbage")).await.unwrap());
        assert_eq!(store.get_piece(1).await.unwrap(), pieces[1]);
        assert!(store.has_piece(1).await);

        // bad bytes are refused and never stored
        let err = store.add_piece(0, Bytes::from_static(b"garbage")).await.unwrap_err();
        assert!(matches!(err, Error::PieceInvalid(0)));
        assert!(!store.has_piece(0).await);
        assert!(matches!(
            store.add_piece(3, Bytes::new()).await,
            Err(Error::PieceOutOfBounds(3))
        ));

        store.add_piece(0, Bytes::copy_from_slice(pieces[0])).await.unwrap();
        store.add_piece(2, Bytes::copy_from_slice(pieces[2])).await.unwrap();
        assert!(store.is_complete().await);
        assert_eq!(store.assemble().await.unwrap(), data);
    }

    #[test]
    fn single_byte_flip_fails_only_its_piece() {
        let data: Vec<u8> = (0..250u32).map(|i| (i * 7 % 256) as u8).collect();
        let pieces: Vec<&[u8]> = data.chunks(32).collect();
        let hashes: Vec<[u8; HASH_LEN]> = pieces.iter().map(|p| sha1(p)).collect();

        for (i, piece) in pieces.iter().enumerate() {
            assert!(verify_piece(piece, &hashes[i]));
        }

        for target in 0..pieces.len() {
            let mut corrupt = pieces[target].to_vec();
            corrupt[3] ^= 0x01;
            for (i, piece) in pieces.iter().enumerate() {
                let candidate: &[u8] = if i == target { &corrupt } else { piece };
                assert_eq!(verify_piece(candidate, &hashes[i]), i != target);
            }
        }
    }

    #[tokio::test]
    async fn seed_state() {
        let seed = SeedState::new(None, true);
        assert!(!seed.is_active());
        assert!(seed.auto_continue());

        seed.activate("out.bin".into()).await;
        assert!(seed.is_active());
        assert_eq!(seed.source().await, Some(PathBuf::from("out.bin")));

        assert!(SeedState::new(Some("a".into()), false).is_active());
    }
}
