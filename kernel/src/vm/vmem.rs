// SPDX-License-Identifier: MPL-2.0

//! VMem resource arenas, after Bonwick and Adams.
//!
//! An arena hands out integer segments from its spans: instant fit from
//! power-of-two freelists, falling back to a best-fit scan when the
//! allocation carries constraints. Segments live in an arena-owned slot
//! pool kept in address order by index links; busy segments are findable by
//! base address through a hash table. An arena may import spans from a
//! source on demand.

use hashbrown::HashMap;

use crate::prelude::*;

use super::pfndb::PfnDb;
use crate::util::AlignExt;

const NO_SEG: u32 = u32::MAX;
const FREELIST_COUNT: usize = usize::BITS as usize;

/// How an arena refills itself when empty.
pub trait SpanSource: Send + Sync {
    /// Produces a new span of at least `size` bytes; returns (base, size).
    fn import(&self, size: usize, db: &mut PfnDb) -> Result<(usize, usize)>;

    /// Releases an imported span.
    fn release(&self, base: usize, size: usize, db: &mut PfnDb);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegKind {
    /// Marks the start of a span; never allocated.
    Span,
    Free,
    Busy,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    base: usize,
    size: usize,
    kind: SegKind,
    /// Address-ordered neighbour links.
    prev: u32,
    next: u32,
    /// Freelist link (free segments only).
    free_next: u32,
}

/// Constraints accepted by [`Vmem::xalloc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocConstraints {
    pub align: usize,
    pub phase: usize,
    pub nocross: usize,
    pub min: usize,
    pub max: usize,
}

pub struct Vmem {
    name: &'static str,
    quantum: usize,
    segments: Vec<Segment>,
    free_slots: Vec<u32>,
    addr_head: u32,
    freelists: [u32; FREELIST_COUNT],
    busy: HashMap<usize, u32>,
    source: Option<Box<dyn SpanSource>>,
    import_quantum: usize,
}

impl Vmem {
    pub fn new(name: &'static str, base: usize, size: usize, quantum: usize) -> Vmem {
        let mut vmem = Vmem {
            name,
            quantum,
            segments: Vec::new(),
            free_slots: Vec::new(),
            addr_head: NO_SEG,
            freelists: [NO_SEG; FREELIST_COUNT],
            busy: HashMap::new(),
            source: None,
            import_quantum: 0,
        };
        if size != 0 {
            vmem.add_span(base, size);
        }
        vmem
    }

    /// An empty arena importing spans of at least `import_quantum` from
    /// `source`.
    pub fn new_imported(
        name: &'static str,
        quantum: usize,
        source: Box<dyn SpanSource>,
        import_quantum: usize,
    ) -> Vmem {
        Vmem {
            name,
            quantum,
            segments: Vec::new(),
            free_slots: Vec::new(),
            addr_head: NO_SEG,
            freelists: [NO_SEG; FREELIST_COUNT],
            busy: HashMap::new(),
            source: Some(source),
            import_quantum,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Keeps a reserve of segment slots so no operation allocates mid-way.
    fn reserve_slots(&mut self) {
        while self.free_slots.len() < 8 {
            let id = self.segments.len() as u32;
            self.segments.push(Segment {
                base: 0,
                size: 0,
                kind: SegKind::Free,
                prev: NO_SEG,
                next: NO_SEG,
                free_next: NO_SEG,
            });
            self.free_slots.push(id);
        }
    }

    fn take_slot(&mut self) -> u32 {
        self.free_slots.pop().expect("segment reserve exhausted")
    }

    fn put_slot(&mut self, id: u32) {
        self.free_slots.push(id);
    }

    fn freelist_index(size: usize) -> usize {
        (usize::BITS - 1 - size.leading_zeros()) as usize
    }

    fn freelist_push(&mut self, id: u32) {
        let index = Self::freelist_index(self.segments[id as usize].size);
        self.segments[id as usize].free_next = self.freelists[index];
        self.freelists[index] = id;
    }

    fn freelist_remove(&mut self, id: u32) {
        let index = Self::freelist_index(self.segments[id as usize].size);
        let mut cur = self.freelists[index];
        if cur == id {
            self.freelists[index] = self.segments[id as usize].free_next;
            return;
        }
        while cur != NO_SEG {
            let next = self.segments[cur as usize].free_next;
            if next == id {
                self.segments[cur as usize].free_next = self.segments[id as usize].free_next;
                return;
            }
            cur = next;
        }
        panic!("vmem {}: segment not on its freelist", self.name);
    }

    /// Adds `[base, base + size)` as a span of this arena.
    pub fn add_span(&mut self, base: usize, size: usize) {
        assert!(size > 0 && base.is_aligned_to(self.quantum));
        self.reserve_slots();

        let span = self.take_slot();
        let free = self.take_slot();
        self.segments[span as usize] = Segment {
            base,
            size,
            kind: SegKind::Span,
            prev: NO_SEG,
            next: free,
            free_next: NO_SEG,
        };
        self.segments[free as usize] = Segment {
            base,
            size,
            kind: SegKind::Free,
            prev: span,
            next: NO_SEG,
            free_next: NO_SEG,
        };

        // Address-ordered insert of the span pair.
        let mut prev = NO_SEG;
        let mut cur = self.addr_head;
        while cur != NO_SEG && self.segments[cur as usize].base < base {
            prev = cur;
            cur = self.segments[cur as usize].next;
        }
        self.segments[free as usize].next = cur;
        if cur != NO_SEG {
            self.segments[cur as usize].prev = free;
        }
        if prev == NO_SEG {
            self.addr_head = span;
            self.segments[span as usize].prev = NO_SEG;
        } else {
            self.segments[prev as usize].next = span;
            self.segments[span as usize].prev = prev;
        }

        self.freelist_push(free);
    }

    /// The first fitting offset inside `seg` under `c`, if any.
    fn fit_in(&self, id: u32, size: usize, c: &AllocConstraints) -> Option<usize> {
        let seg = &self.segments[id as usize];
        let align = if c.align == 0 { self.quantum } else { c.align };

        let mut start = seg.base.max(c.min);
        start = start.align_up(align) + c.phase;
        if c.nocross != 0 {
            // Entirely within one nocross-aligned block.
            let block_end = start.align_down(c.nocross) + c.nocross;
            if start + size > block_end {
                start = block_end + c.phase;
            }
        }
        let limit = if c.max == 0 {
            seg.base + seg.size
        } else {
            (seg.base + seg.size).min(c.max)
        };
        if start < seg.base || start + size > limit {
            return None;
        }
        Some(start)
    }

    /// Allocates `size` bytes under the given constraints.
    pub fn xalloc(
        &mut self,
        size: usize,
        constraints: AllocConstraints,
        db: Option<&mut PfnDb>,
    ) -> Result<usize> {
        assert!(size > 0 && size.is_aligned_to(self.quantum));
        self.reserve_slots();

        if let Some(found) = self.search(size, &constraints) {
            return Ok(self.claim(found.0, found.1, size));
        }

        // Refill from the source and retry once.
        if let Some(db) = db {
            if self.source.is_some() {
                let want = size.max(self.import_quantum);
                let source = self.source.take().unwrap();
                let imported = source.import(want, db);
                self.source = Some(source);
                let (base, got) = imported?;
                self.add_span(base, got);
                self.reserve_slots();
                if let Some(found) = self.search(size, &constraints) {
                    return Ok(self.claim(found.0, found.1, size));
                }
            }
        }

        return_error_with_message!(ErrorKind::ResourceExhausted, "arena exhausted")
    }

    /// Allocates exactly `[addr, addr + size)`.
    pub fn xalloc_exact(&mut self, addr: usize, size: usize) -> Result<usize> {
        let constraints = AllocConstraints {
            min: addr,
            max: addr + size,
            ..Default::default()
        };
        self.xalloc(size, constraints, None)
    }

    /// Instant fit, then a constrained best-fit sweep.
    fn search(&self, size: usize, c: &AllocConstraints) -> Option<(u32, usize)> {
        let min_index = Self::freelist_index(size.next_power_of_two());
        for index in min_index..FREELIST_COUNT {
            let mut cur = self.freelists[index];
            while cur != NO_SEG {
                if let Some(start) = self.fit_in(cur, size, c) {
                    return Some((cur, start));
                }
                cur = self.segments[cur as usize].free_next;
            }
        }
        // Best fit among smaller-bucket segments that may still hold it.
        if min_index > 0 {
            let mut best: Option<(u32, usize, usize)> = None;
            let mut cur = self.freelists[min_index - 1];
            while cur != NO_SEG {
                if let Some(start) = self.fit_in(cur, size, c) {
                    let waste = self.segments[cur as usize].size - size;
                    if best.map_or(true, |(_, _, w)| waste < w) {
                        best = Some((cur, start, waste));
                    }
                }
                cur = self.segments[cur as usize].free_next;
            }
            if let Some((id, start, _)) = best {
                return Some((id, start));
            }
        }
        None
    }

    /// Splits `id` so `[start, start + size)` becomes a busy segment.
    fn claim(&mut self, id: u32, start: usize, size: usize) -> usize {
        self.freelist_remove(id);
        let (seg_base, seg_size, seg_prev, seg_next) = {
            let seg = &self.segments[id as usize];
            (seg.base, seg.size, seg.prev, seg.next)
        };
        debug_assert!(start >= seg_base && start + size <= seg_base + seg_size);

        // Front remainder.
        let mut prev = seg_prev;
        if start > seg_base {
            let front = self.take_slot();
            self.segments[front as usize] = Segment {
                base: seg_base,
                size: start - seg_base,
                kind: SegKind::Free,
                prev,
                next: id,
                free_next: NO_SEG,
            };
            if prev != NO_SEG {
                self.segments[prev as usize].next = front;
            } else {
                self.addr_head = front;
            }
            prev = front;
            self.freelist_push(front);
        }

        // Tail remainder.
        let mut next = seg_next;
        if start + size < seg_base + seg_size {
            let tail = self.take_slot();
            self.segments[tail as usize] = Segment {
                base: start + size,
                size: seg_base + seg_size - (start + size),
                kind: SegKind::Free,
                prev: id,
                next,
                free_next: NO_SEG,
            };
            if next != NO_SEG {
                self.segments[next as usize].prev = tail;
            }
            next = tail;
            self.freelist_push(tail);
        }

        {
            let seg = &mut self.segments[id as usize];
            seg.base = start;
            seg.size = size;
            seg.kind = SegKind::Busy;
            seg.prev = prev;
            seg.next = next;
            seg.free_next = NO_SEG;
        }
        self.busy.insert(start, id);
        start
    }

    /// Frees `[addr, addr + size)`, coalescing with free neighbours.
    /// Returns the size released.
    pub fn xfree(&mut self, addr: usize, size: usize) -> usize {
        self.reserve_slots();
        let id = match self.busy.remove(&addr) {
            Some(id) => id,
            None => panic!("vmem {}: freeing unallocated {:#x}", self.name, addr),
        };
        let seg_size = self.segments[id as usize].size;
        assert_eq!(seg_size, size, "vmem {}: free size mismatch", self.name);

        self.segments[id as usize].kind = SegKind::Free;

        // Merge with a free successor.
        let next = self.segments[id as usize].next;
        if next != NO_SEG && self.segments[next as usize].kind == SegKind::Free {
            self.freelist_remove(next);
            let (nsize, nnext) = {
                let n = &self.segments[next as usize];
                (n.size, n.next)
            };
            self.segments[id as usize].size += nsize;
            self.segments[id as usize].next = nnext;
            if nnext != NO_SEG {
                self.segments[nnext as usize].prev = id;
            }
            self.put_slot(next);
        }

        // Merge into a free predecessor (spans block the merge).
        let prev = self.segments[id as usize].prev;
        if prev != NO_SEG && self.segments[prev as usize].kind == SegKind::Free {
            self.freelist_remove(prev);
            let (size_here, next_here) = {
                let seg = &self.segments[id as usize];
                (seg.size, seg.next)
            };
            self.segments[prev as usize].size += size_here;
            self.segments[prev as usize].next = next_here;
            if next_here != NO_SEG {
                self.segments[next_here as usize].prev = prev;
            }
            self.put_slot(id);
            self.freelist_push(prev);
        } else {
            self.freelist_push(id);
        }

        seg_size
    }

    /// Total bytes currently allocated.
    pub fn busy_bytes(&self) -> usize {
        self.busy
            .values()
            .map(|id| self.segments[*id as usize].size)
            .sum()
    }

    /// One log line per span, for diagnostics.
    pub fn dump(&self) {
        log::info!(
            "vmem {}: {} busy segments, {} bytes busy",
            self.name,
            self.busy.len(),
            self.busy_bytes()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Vmem {
        crate::arch::hosted::init_kernel();
        Vmem::new("test", 0x1000, 0x100000, 0x1000)
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut vmem = arena();
        let a = vmem.xalloc(0x2000, AllocConstraints::default(), None).unwrap();
        let b = vmem.xalloc(0x1000, AllocConstraints::default(), None).unwrap();
        assert_ne!(a, b);
        assert!(a >= 0x1000 && b >= 0x1000);
        assert_eq!(vmem.busy_bytes(), 0x3000);
        assert_eq!(vmem.xfree(a, 0x2000), 0x2000);
        assert_eq!(vmem.xfree(b, 0x1000), 0x1000);
        assert_eq!(vmem.busy_bytes(), 0);
    }

    #[test]
    fn exact_fit_and_reuse() {
        let mut vmem = arena();
        let addr = vmem.xalloc_exact(0x8000, 0x4000).unwrap();
        assert_eq!(addr, 0x8000);
        // The claimed range is gone.
        assert!(vmem.xalloc_exact(0x9000, 0x1000).is_err());
        vmem.xfree(0x8000, 0x4000);
        assert_eq!(vmem.xalloc_exact(0x9000, 0x1000).unwrap(), 0x9000);
        vmem.xfree(0x9000, 0x1000);
    }

    #[test]
    fn alignment_and_nocross() {
        let mut vmem = arena();
        let a = vmem
            .xalloc(
                0x1000,
                AllocConstraints {
                    align: 0x10000,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(a % 0x10000, 0);

        let b = vmem
            .xalloc(
                0x2000,
                AllocConstraints {
                    nocross: 0x10000,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(b / 0x10000, (b + 0x1fff) / 0x10000);
        vmem.xfree(a, 0x1000);
        vmem.xfree(b, 0x2000);
    }

    #[test]
    fn coalescing_restores_large_fits() {
        let mut vmem = Vmem::new("co", 0x0, 0x4000, 0x1000);
        let a = vmem.xalloc(0x1000, AllocConstraints::default(), None).unwrap();
        let b = vmem.xalloc(0x1000, AllocConstraints::default(), None).unwrap();
        let c = vmem.xalloc(0x2000, AllocConstraints::default(), None).unwrap();
        assert!(vmem.xalloc(0x1000, AllocConstraints::default(), None).is_err());
        vmem.xfree(b, 0x1000);
        vmem.xfree(a, 0x1000);
        vmem.xfree(c, 0x2000);
        // Everything back and merged: a full-size allocation fits again.
        let all = vmem.xalloc(0x4000, AllocConstraints::default(), None).unwrap();
        vmem.xfree(all, 0x4000);
    }
}
