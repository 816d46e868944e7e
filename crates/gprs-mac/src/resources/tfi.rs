use gprs_core::{Direction, Tfi};

use crate::arena::TbfId;

pub const TFI_COUNT: usize = 32;

/// One pool of TFIs per direction, shared by all channels on the ARFCN.
/// Sharing across channels keeps a multislot TBF's TFI unique in every
/// slot it touches. A TFI is held by at most one TBF per direction.
pub struct TfiTable {
    tfis: [[Option<TbfId>; TFI_COUNT]; 2],
    /// Round-robin cursor, so a just-released TFI is not immediately
    /// reissued while the old session's peer may still react to it.
    last: [usize; 2],
}

impl Default for TfiTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TfiTable {
    pub fn new() -> TfiTable {
        TfiTable {
            tfis: [[None; TFI_COUNT]; 2],
            last: [0; 2],
        }
    }

    pub fn get(&self, dir: Direction, tfi: Tfi) -> Option<TbfId> {
        self.tfis[dir.index()].get(tfi as usize).copied().flatten()
    }

    pub fn set(&mut self, dir: Direction, tfi: Tfi, tbf: TbfId) {
        self.tfis[dir.index()][tfi as usize] = Some(tbf);
    }

    pub fn clear(&mut self, dir: Direction, tfi: Tfi) {
        self.tfis[dir.index()][tfi as usize] = None;
    }

    /// Round-robin scan for a free TFI. None on exhaustion.
    pub fn find_free(&mut self, dir: Direction) -> Option<Tfi> {
        let d = dir.index();
        for _ in 0..TFI_COUNT {
            self.last[d] = (self.last[d] + 1) % TFI_COUNT;
            if self.tfis[d][self.last[d]].is_none() {
                return Some(self.last[d] as Tfi);
            }
        }
        None
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        for dir in [Direction::Up, Direction::Down] {
            let _ = write!(out, "TFI=({}:", dir);
            for (tfi, tbf) in self.tfis[dir.index()].iter().enumerate() {
                if let Some(tbf) = tbf {
                    let _ = write!(out, " {}=>{}", tfi, tbf);
                }
            }
            let _ = writeln!(out, ")");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Handles are opaque; mint them through a real arena of Tbfs.
    fn handle_fixture(n: usize) -> Vec<TbfId> {
        crate::tbf::tests_support::dummy_tbf_ids(n)
    }

    #[test]
    fn test_round_robin_and_exhaustion() {
        let mut t = TfiTable::new();
        let ids = handle_fixture(33);

        let mut seen = Vec::new();
        for tbf in ids.iter().take(32) {
            let tfi = t.find_free(Direction::Up).unwrap();
            assert!(!seen.contains(&tfi));
            seen.push(tfi);
            t.set(Direction::Up, tfi, *tbf);
        }
        assert_eq!(t.find_free(Direction::Up), None);
        // The downlink space is independent
        assert!(t.find_free(Direction::Down).is_some());

        // Freeing one uplink TFI makes exactly that one available again
        t.clear(Direction::Up, seen[5]);
        assert_eq!(t.find_free(Direction::Up), Some(seen[5]));
    }

    #[test]
    fn test_released_tfi_not_immediately_reissued() {
        let mut t = TfiTable::new();
        let ids = handle_fixture(2);
        let tfi = t.find_free(Direction::Down).unwrap();
        t.set(Direction::Down, tfi, ids[0]);
        t.clear(Direction::Down, tfi);
        // Round-robin moves past the just-released slot
        let next = t.find_free(Direction::Down).unwrap();
        assert_ne!(next, tfi);
    }
}
