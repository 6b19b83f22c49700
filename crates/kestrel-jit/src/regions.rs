//! Protected-region table
//!
//! One entry per `try` part, keyed by [`RegionId`]. Ranges are half-open
//! spans of source block ids in allocation order, so a region covers exactly
//! the blocks lowered while it was on the handler stack.

use kestrel_ir::{RegionId, RegionKind, Slot};
use serde::Serialize;

use crate::error::{LoweringError, LoweringResult};
use crate::graph::BlockId;

/// A lexical span covered by a `try` part
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedRegion {
    /// Region id shared with the baseline tier
    pub id: RegionId,
    /// Catch or finally
    pub kind: RegionKind,
    /// First covered block
    pub start: BlockId,
    /// One past the last covered block
    pub end: BlockId,
    /// First block of the catch body or the finally template
    pub handler_entry: BlockId,
    /// Catch binding, for catch regions
    pub binding: Option<Slot>,
    /// Innermost region enclosing this one
    pub parent: Option<RegionId>,
    /// Regions enclosing this one
    pub handler_depth: u32,
    /// Finally bodies enclosing this region's `try` statement
    pub finally_depth: u32,
}

impl ProtectedRegion {
    /// Whether `block` lies in the covered range
    #[inline]
    pub fn covers(&self, block: BlockId) -> bool {
        self.start <= block && block < self.end
    }

    fn contains(&self, other: &ProtectedRegion) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    fn overlaps(&self, other: &ProtectedRegion) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Immutable table of every region in a function
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegionTable {
    regions: Vec<ProtectedRegion>,
}

impl RegionTable {
    /// Build from entries indexed by region id, checking the nesting discipline
    pub fn new(entries: Vec<Option<ProtectedRegion>>) -> LoweringResult<Self> {
        let regions = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                Some(region) if region.id.index() == i => Ok(region),
                _ => Err(LoweringError::UnknownRegion(RegionId(i as u32))),
            })
            .collect::<LoweringResult<Vec<_>>>()?;
        let table = Self { regions };
        table.validate()?;
        Ok(table)
    }

    /// Look up a region
    pub fn get(&self, id: RegionId) -> Option<&ProtectedRegion> {
        self.regions.get(id.index())
    }

    /// Number of regions
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the function has no `try`
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// All regions in id order
    pub fn iter(&self) -> impl Iterator<Item = &ProtectedRegion> {
        self.regions.iter()
    }

    /// Regions covering `block`, outermost first
    pub fn enclosing(&self, block: BlockId) -> Vec<RegionId> {
        let mut covering: Vec<&ProtectedRegion> =
            self.regions.iter().filter(|r| r.covers(block)).collect();
        covering.sort_by_key(|r| r.handler_depth);
        covering.into_iter().map(|r| r.id).collect()
    }

    /// Check that regions are properly nested and agree with their parents
    pub fn validate(&self) -> LoweringResult<()> {
        for region in &self.regions {
            if region.start >= region.end {
                return Err(LoweringError::ImproperNesting {
                    inner: region.id,
                    outer: region.id,
                });
            }
            let depth = match region.parent {
                Some(parent_id) => {
                    let parent = self
                        .get(parent_id)
                        .ok_or(LoweringError::UnknownRegion(parent_id))?;
                    if !parent.contains(region) || parent.handler_depth + 1 != region.handler_depth {
                        return Err(LoweringError::ImproperNesting {
                            inner: region.id,
                            outer: parent_id,
                        });
                    }
                    parent.handler_depth + 1
                }
                None => 0,
            };
            if depth != region.handler_depth {
                return Err(LoweringError::ImproperNesting {
                    inner: region.id,
                    outer: region.parent.unwrap_or(region.id),
                });
            }
        }

        for (i, a) in self.regions.iter().enumerate() {
            for b in &self.regions[i + 1..] {
                if !a.overlaps(b) {
                    continue;
                }
                let same_range = a.start == b.start && a.end == b.end;
                let (inner, outer) = if a.contains(b) { (b, a) } else { (a, b) };
                if same_range || !outer.contains(inner) {
                    return Err(LoweringError::ImproperNesting {
                        inner: inner.id,
                        outer: outer.id,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u32, start: u32, end: u32, parent: Option<u32>, depth: u32) -> Option<ProtectedRegion> {
        Some(ProtectedRegion {
            id: RegionId(id),
            kind: RegionKind::Finally,
            start: BlockId(start),
            end: BlockId(end),
            handler_entry: BlockId(end),
            binding: None,
            parent: parent.map(RegionId),
            handler_depth: depth,
            finally_depth: 0,
        })
    }

    #[test]
    fn test_nested_regions_accepted() {
        let table = RegionTable::new(vec![region(0, 2, 10, None, 0), region(1, 3, 6, Some(0), 1)]).unwrap();
        assert_eq!(table.enclosing(BlockId(4)), vec![RegionId(0), RegionId(1)]);
        assert_eq!(table.enclosing(BlockId(7)), vec![RegionId(0)]);
        assert!(table.enclosing(BlockId(10)).is_empty());
    }

    #[test]
    fn test_partial_overlap_rejected() {
        let err = RegionTable::new(vec![region(0, 2, 6, None, 0), region(1, 4, 9, None, 0)]).unwrap_err();
        assert!(matches!(err, LoweringError::ImproperNesting { .. }));
    }

    #[test]
    fn test_identical_ranges_rejected() {
        let err = RegionTable::new(vec![region(0, 2, 6, None, 0), region(1, 2, 6, Some(0), 1)]).unwrap_err();
        assert!(matches!(err, LoweringError::ImproperNesting { .. }));
    }

    #[test]
    fn test_missing_region_rejected() {
        let err = RegionTable::new(vec![region(0, 2, 6, None, 0), None]).unwrap_err();
        assert_eq!(err, LoweringError::UnknownRegion(RegionId(1)));
    }
}
