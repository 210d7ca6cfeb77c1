//! Free-space map and cluster allocation policy.
//!
//! The map is an ordered list of contiguous free-cluster regions, built by
//! one linear scan of the FAT at mount time. Two allocation policies sit on
//! top of it: new files take the midpoint of the largest region, leaving the
//! most room to grow in both directions; extensions take the closest free
//! cluster to the chain's tail, keeping files contiguous for as long as the
//! volume allows.
//!
//! List invariants, maintained by every mutation: regions are sorted by
//! start, strictly separated (never adjacent), and never empty.

use crate::consts::*;
use crate::dev::BlockDev;
use crate::error::{FsError, FsResult};
use crate::layout::read_u32;
use crate::table::{is_free_cluster, FatCache};
use crate::volume::Volume;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u32,
    pub length: u32,
}

impl FreeRegion {
    /// One past the last cluster of the region.
    fn end(&self) -> u32 {
        self.start + self.length
    }
}

pub struct FreeMap {
    regions: Vec<FreeRegion>,
    free: u32,
    used: u32,
}

impl FreeMap {
    /// Scan the FAT sector by sector and record every run of free clusters.
    /// Also establishes the used/free counters the statfs path reports.
    pub fn build<D: BlockDev>(dev: &mut D, vol: &Volume) -> FsResult<Self> {
        let sector_size = vol.sector_size() as usize;
        let entries_per_sector = sector_size / FAT_ENT_SIZE;
        let limit = vol.cluster_limit();

        let mut map = Self {
            regions: Vec::new(),
            free: 0,
            used: 0,
        };
        let mut prev_alloced = true;
        let mut buffer = vec![0u8; sector_size];

        for sector in 0..vol.fat_sectors() {
            let offset =
                (vol.fat_start_sector() as u64 + sector as u64) * vol.sector_size() as u64;
            dev.read_at(offset, &mut buffer)?;

            for i in 0..entries_per_sector {
                let cluster = sector * entries_per_sector as u32 + i as u32;
                if cluster < FIRST_DATA_CLUSTER || cluster >= limit {
                    continue;
                }
                let cell = read_u32(&buffer, i * FAT_ENT_SIZE);
                if is_free_cluster(cell) {
                    map.free += 1;
                    if prev_alloced {
                        // a free cluster right after an allocated one opens
                        // a new region.
                        map.regions.push(FreeRegion {
                            start: cluster,
                            length: 1,
                        });
                        prev_alloced = false;
                    } else {
                        map.regions
                            .last_mut()
                            .expect("a region is open when prev_alloced is false")
                            .length += 1;
                    }
                } else {
                    map.used += 1;
                    prev_alloced = true;
                }
            }
        }
        Ok(map)
    }

    #[cfg(test)]
    pub fn from_regions(regions: Vec<FreeRegion>, used: u32) -> Self {
        let free = regions.iter().map(|r| r.length).sum();
        Self {
            regions,
            free,
            used,
        }
    }

    pub fn free_clusters(&self) -> u32 {
        self.free
    }

    pub fn used_clusters(&self) -> u32 {
        self.used
    }

    pub fn regions(&self) -> &[FreeRegion] {
        &self.regions
    }

    /// Claim the midpoint of the largest free region for a new file,
    /// splitting the region around it. Ties go to the earlier region.
    pub fn take_node(&mut self) -> Option<u32> {
        let pos = self
            .regions
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.length.cmp(&b.length).then(ib.cmp(ia)))
            .map(|(i, _)| i)?;

        let region = self.regions[pos];
        let cluster = region.start + region.length / 2;

        let left = FreeRegion {
            start: region.start,
            length: cluster - region.start,
        };
        let right = FreeRegion {
            start: cluster + 1,
            length: region.end() - (cluster + 1),
        };

        let mut replace = Vec::with_capacity(2);
        if left.length > 0 {
            replace.push(left);
        }
        if right.length > 0 {
            replace.push(right);
        }
        self.regions.splice(pos..pos + 1, replace);

        self.free -= 1;
        self.used += 1;
        Some(cluster)
    }

    /// Claim the free cluster closest to `near`, taking it from whichever
    /// end of the winning region faces `near`. Distance ties keep the
    /// earlier region.
    pub fn take_near(&mut self, near: u32) -> Option<u32> {
        let mut best: Option<(u32, usize)> = None;
        for (i, region) in self.regions.iter().enumerate() {
            let distance = if near < region.start {
                region.start - near
            } else if near >= region.end() {
                near - region.end()
            } else {
                // `near` is an allocated cluster, so it cannot lie inside a
                // free region; treat overlap defensively as distance zero.
                0
            };
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, i));
            }
        }
        let (_, pos) = best?;

        let region = &mut self.regions[pos];
        let cluster = if near < region.start {
            let c = region.start;
            region.start += 1;
            region.length -= 1;
            c
        } else {
            region.length -= 1;
            region.start + region.length
        };
        if region.length == 0 {
            self.regions.remove(pos);
        }

        self.free -= 1;
        self.used += 1;
        Some(cluster)
    }

    /// Return a cluster to the free pool, merging it with its neighbours so
    /// the list never holds two adjacent regions.
    pub fn release(&mut self, cluster: u32) {
        let pos = self.regions.partition_point(|r| r.start < cluster);
        let touches_left = pos > 0 && self.regions[pos - 1].end() == cluster;
        let touches_right = pos < self.regions.len() && self.regions[pos].start == cluster + 1;

        match (touches_left, touches_right) {
            (true, true) => {
                let right = self.regions.remove(pos);
                let left = &mut self.regions[pos - 1];
                left.length += 1 + right.length;
            }
            (true, false) => self.regions[pos - 1].length += 1,
            (false, true) => {
                let right = &mut self.regions[pos];
                right.start -= 1;
                right.length += 1;
            }
            (false, false) => self.regions.insert(
                pos,
                FreeRegion {
                    start: cluster,
                    length: 1,
                },
            ),
        }

        self.free += 1;
        self.used -= 1;
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for window in self.regions.windows(2) {
            assert!(
                window[0].end() < window[1].start,
                "regions must stay strictly separated: {:?}",
                self.regions
            );
        }
        for r in &self.regions {
            assert!(r.length > 0, "empty region retained: {:?}", self.regions);
        }
        assert_eq!(
            self.free,
            self.regions.iter().map(|r| r.length).sum::<u32>(),
            "free counter out of sync"
        );
    }
}

// ─── Allocation policy over the FAT ────────────────────────────────────────────

/// Allocate the initial cluster of a new file: midpoint of the largest
/// region, marked end-of-chain and zero-filled.
pub fn alloc_node<D: BlockDev>(
    dev: &mut D,
    vol: &Volume,
    fat: &mut FatCache,
    map: &mut FreeMap,
) -> FsResult<u32> {
    let cluster = map.take_node().ok_or(FsError::NoSpace)?;
    fat.put(dev, vol, cluster, END_CLUSTER_WRITE)?;
    zero_cluster(dev, vol, cluster)?;
    log::debug!("alloc node cluster {cluster}");
    Ok(cluster)
}

/// Allocate a cluster adjacent (or as close as the volume allows) to
/// `tail`, link it onto the chain and zero it.
pub fn alloc_near<D: BlockDev>(
    dev: &mut D,
    vol: &Volume,
    fat: &mut FatCache,
    map: &mut FreeMap,
    tail: u32,
) -> FsResult<u32> {
    let cluster = map.take_near(tail).ok_or(FsError::NoSpace)?;
    fat.put(dev, vol, cluster, END_CLUSTER_WRITE)?;
    fat.put(dev, vol, tail, cluster)?;
    zero_cluster(dev, vol, cluster)?;
    log::debug!("alloc cluster {cluster} near {tail}");
    Ok(cluster)
}

/// Give a cluster back: merge it into the free list, then clear its cell.
pub fn release_cluster<D: BlockDev>(
    dev: &mut D,
    vol: &Volume,
    fat: &mut FatCache,
    map: &mut FreeMap,
    cluster: u32,
) -> FsResult<()> {
    map.release(cluster);
    fat.put(dev, vol, cluster, FREE_CLUSTER)?;
    Ok(())
}

fn zero_cluster<D: BlockDev>(dev: &mut D, vol: &Volume, cluster: u32) -> FsResult<()> {
    let zeros = vec![0u8; vol.cluster_size() as usize];
    dev.write_at(vol.cluster_offset(cluster), &zeros)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(regions: &[(u32, u32)]) -> FreeMap {
        FreeMap::from_regions(
            regions
                .iter()
                .map(|&(start, length)| FreeRegion { start, length })
                .collect(),
            10,
        )
    }

    // ── take_node ────────────────────────────────────────────────────────────

    #[test]
    fn node_takes_midpoint_of_largest() {
        let mut m = map(&[(2, 3), (10, 9), (30, 4)]);
        assert_eq!(m.take_node(), Some(14)); // 10 + 9/2
        assert_eq!(
            m.regions(),
            &[
                FreeRegion { start: 2, length: 3 },
                FreeRegion { start: 10, length: 4 },
                FreeRegion { start: 15, length: 4 },
                FreeRegion { start: 30, length: 4 },
            ]
        );
        m.check_invariants();
    }

    #[test]
    fn node_tie_prefers_first_region() {
        let mut m = map(&[(2, 4), (20, 4)]);
        assert_eq!(m.take_node(), Some(4));
        m.check_invariants();
    }

    #[test]
    fn node_from_single_cluster_region() {
        let mut m = map(&[(5, 1)]);
        assert_eq!(m.take_node(), Some(5));
        assert!(m.regions().is_empty());
        assert_eq!(m.take_node(), None);
        m.check_invariants();
    }

    #[test]
    fn node_at_region_edge_keeps_one_side() {
        let mut m = map(&[(5, 2)]);
        assert_eq!(m.take_node(), Some(6)); // 5 + 2/2
        assert_eq!(m.regions(), &[FreeRegion { start: 5, length: 1 }]);
        m.check_invariants();
    }

    // ── take_near ────────────────────────────────────────────────────────────

    #[test]
    fn near_takes_adjacent_right() {
        // tail at 9, free region starts at 10: take 10.
        let mut m = map(&[(10, 3), (40, 3)]);
        assert_eq!(m.take_near(9), Some(10));
        assert_eq!(m.regions()[0], FreeRegion { start: 11, length: 2 });
        m.check_invariants();
    }

    #[test]
    fn near_takes_adjacent_left() {
        // tail at 20, free region 10..13 lies to its left: take 12.
        let mut m = map(&[(10, 3), (40, 3)]);
        assert_eq!(m.take_near(20), Some(12));
        assert_eq!(m.regions()[0], FreeRegion { start: 10, length: 2 });
        m.check_invariants();
    }

    #[test]
    fn near_tie_keeps_list_order() {
        // tail at 20 is 5 away from both regions; the first wins.
        let mut m = map(&[(10, 5), (26, 5)]);
        assert_eq!(m.take_near(20), Some(14));
        m.check_invariants();
    }

    #[test]
    fn near_drops_emptied_region() {
        let mut m = map(&[(10, 1), (40, 2)]);
        assert_eq!(m.take_near(9), Some(10));
        assert_eq!(m.regions().len(), 1);
        m.check_invariants();
    }

    #[test]
    fn near_exhausted() {
        let mut m = map(&[]);
        assert_eq!(m.take_near(5), None);
    }

    // ── release ──────────────────────────────────────────────────────────────

    #[test]
    fn release_isolated_inserts_in_order() {
        let mut m = map(&[(2, 2), (10, 2)]);
        m.release(6);
        assert_eq!(
            m.regions(),
            &[
                FreeRegion { start: 2, length: 2 },
                FreeRegion { start: 6, length: 1 },
                FreeRegion { start: 10, length: 2 },
            ]
        );
        m.check_invariants();
    }

    #[test]
    fn release_extends_left_neighbour() {
        let mut m = map(&[(2, 2), (10, 2)]);
        m.release(4);
        assert_eq!(m.regions()[0], FreeRegion { start: 2, length: 3 });
        m.check_invariants();
    }

    #[test]
    fn release_extends_right_neighbour() {
        let mut m = map(&[(2, 2), (10, 2)]);
        m.release(9);
        assert_eq!(m.regions()[1], FreeRegion { start: 9, length: 3 });
        m.check_invariants();
    }

    #[test]
    fn release_merges_both_neighbours() {
        let mut m = map(&[(2, 3), (6, 2)]);
        m.release(5);
        assert_eq!(m.regions(), &[FreeRegion { start: 2, length: 6 }]);
        m.check_invariants();
    }

    #[test]
    fn release_into_empty_map() {
        let mut m = map(&[]);
        m.used = 1;
        m.release(7);
        assert_eq!(m.regions(), &[FreeRegion { start: 7, length: 1 }]);
        m.check_invariants();
    }

    #[test]
    fn counters_track_mutations() {
        let mut m = map(&[(2, 8)]);
        let total = m.free_clusters() + m.used_clusters();
        let c = m.take_node().unwrap();
        assert_eq!(m.free_clusters() + m.used_clusters(), total);
        m.release(c);
        assert_eq!(m.free_clusters(), 8);
        assert_eq!(m.free_clusters() + m.used_clusters(), total);
        m.check_invariants();
    }

    #[test]
    fn release_then_near_is_idempotent() {
        // releasing c and immediately allocating near c-1 hands back c.
        let mut m = map(&[(20, 4)]);
        m.used += 1;
        m.release(10);
        let c = m.take_near(9).unwrap();
        assert_eq!(c, 10);
        m.check_invariants();
    }
}
