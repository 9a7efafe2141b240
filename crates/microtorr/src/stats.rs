//! Per-piece download records, reported once the file is complete.
use std::fmt::Display;

use hashbrown::HashMap;

use crate::{
    peer::PeerId,
    utils::{median, to_human_readable},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PieceRecord {
    pub index: u32,
    /// Bytes per second.
    pub speed: f64,
    pub peer: PeerId,
    /// Whether the peer owned the whole file when it served us.
    pub from_seeder: bool,
}

#[derive(Debug, Default, Clone)]
pub struct DownloadStats {
    records: Vec<PieceRecord>,
    downloaded: u64,
}

impl DownloadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, index: u32, len: usize, speed: f64, peer: PeerId, from_seeder: bool) {
        self.downloaded += len as u64;
        self.records.push(PieceRecord { index, speed, peer, from_seeder });
    }

    pub fn records(&self) -> &[PieceRecord] {
        &self.records
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn median_speed(&self) -> f64 {
        let speeds: Vec<f64> = self.records.iter().map(|r| r.speed).collect();
        median(&speeds)
    }

    /// Fraction of the pieces served by `peer`, in [0, 1].
    pub fn share(&self, peer: &PeerId) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let n = self.records.iter().filter(|r| r.peer == *peer).count();
        n as f64 / self.records.len() as f64
    }

    /// Fraction of the pieces served by seeders, in [0, 1].
    pub fn seeder_share(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let n = self.records.iter().filter(|r| r.from_seeder).count();
        n as f64 / self.records.len() as f64
    }

    /// Pieces served per peer, most generous first.
    fn pieces_per_peer(&self) -> Vec<(PeerId, usize)> {
        let mut per_peer: HashMap<PeerId, usize> = HashMap::new();
        for r in &self.records {
            *per_peer.entry(r.peer).or_default() += 1;
        }
        let mut per_peer: Vec<(PeerId, usize)> = per_peer.into_iter().collect();
        per_peer.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.as_bytes().cmp(b.0.as_bytes())));
        per_peer
    }
}

impl Display for DownloadStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "downloaded {} in {} pieces, median speed {}/s",
            to_human_readable(self.downloaded as f64),
            self.records.len(),
            to_human_readable(self.median_speed()),
        )?;

        let total = self.records.len().max(1) as f64;
        for (peer, n) in self.pieces_per_peer() {
            writeln!(f, "  {:>6.2}% from {}", n as f64 * 100.0 / total, peer.short())?;
        }

        write!(f, "  {:.2}% from seeders", self.seeder_share() * 100.0)
    }
}
