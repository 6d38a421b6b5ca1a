//! Growing and shrinking an inode's pointer tiers.
//!
//! Both directions visit logical indices in tier order (direct, then
//! singly-indirect, then doubly-indirect). Growth reserves every data and
//! index sector it will need before touching the record, so running out of
//! space rolls back cleanly: the sectors taken by this call go back to the
//! allocator and the record is left exactly as it was.

use crate::layout::{BlockSlot, InodeRecord, fits, index_blocks_for, outer_blocks_for};
use crate::tier::{lookup, read_pointer, write_pointer};
use sfs_alloc::SectorAllocator;
use sfs_block::BufferCache;
use sfs_error::{Result, SfsError};
use sfs_types::{DIRECT_POINTERS, MAX_FILE_LEN, POINTERS_PER_SECTOR, SECTOR_SIZE, SectorId};
use tracing::{debug, warn};

pub(crate) struct Resizer<'a> {
    pub cache: &'a BufferCache,
    pub allocator: &'a dyn SectorAllocator,
    pub inode: SectorId,
}

impl Resizer<'_> {
    /// Set `record`'s length to `new_len`, allocating or releasing blocks.
    ///
    /// The caller persists the record afterwards.
    pub fn resize(&self, record: &mut InodeRecord, new_len: u64) -> Result<()> {
        if new_len > MAX_FILE_LEN {
            return Err(SfsError::FileTooLarge);
        }
        let new_len = u32::try_from(new_len).map_err(|_| SfsError::FileTooLarge)?;
        let old_len = record.length;
        let old_blocks = record.block_count();
        let new_blocks = (new_len as usize).div_ceil(SECTOR_SIZE);
        if !fits(new_blocks) {
            return Err(SfsError::FileTooLarge);
        }

        // Bytes past the old end in its last sector may hold stale data
        // from an earlier, longer file. Cleared before any block is wired
        // in, so a failure here leaves the record untouched.
        let tail = old_len as usize % SECTOR_SIZE;
        if new_len > old_len && tail != 0 {
            let last = lookup(self.cache, self.inode, record, old_blocks - 1)?.ok_or_else(
                || SfsError::Corruption {
                    sector: self.inode.0,
                    detail: "last data block missing".to_owned(),
                },
            )?;
            let zeros = [0_u8; SECTOR_SIZE];
            self.cache.write(last, tail, &zeros[tail..])?;
        }

        if new_blocks > old_blocks {
            self.grow(record, old_blocks, new_blocks)?;
        } else if new_blocks < old_blocks {
            self.shrink(record, old_blocks, new_blocks)?;
        }

        record.length = new_len;
        Ok(())
    }

    fn grow(&self, record: &mut InodeRecord, old: usize, new: usize) -> Result<()> {
        let needed = (new - old) + index_blocks_for(new) - index_blocks_for(old);
        let reserved = self.reserve(needed)?;
        let mut spare: Vec<SectorId> = reserved.iter().rev().copied().collect();

        let mut next = record.clone();
        if let Err(err) = self.wire(&mut next, old, new, &mut spare) {
            warn!(inode = %self.inode, error = %err, "growth failed after reservation, rolling back");
            self.unwire(record, old, new);
            self.rollback(&reserved);
            return Err(err);
        }
        if !spare.is_empty() {
            warn!(inode = %self.inode, unused = spare.len(), "returning unused reserved sectors");
            self.rollback(&spare);
        }
        *record = next;
        debug!(
            inode = %self.inode,
            old_blocks = old,
            new_blocks = new,
            allocated = needed,
            "grew inode"
        );
        Ok(())
    }

    /// Take `count` sectors from the allocator, all or nothing.
    fn reserve(&self, count: usize) -> Result<Vec<SectorId>> {
        let mut taken = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocator.allocate(1) {
                Ok(sector) => taken.push(sector),
                Err(err) => {
                    debug!(
                        inode = %self.inode,
                        wanted = count,
                        got = taken.len(),
                        "reservation failed, releasing partial allocation"
                    );
                    self.rollback(&taken);
                    return Err(err);
                }
            }
        }
        Ok(taken)
    }

    /// Return sectors taken by a failed growth, logging anything the
    /// allocator refuses. The growth error is what the caller sees.
    fn rollback(&self, sectors: &[SectorId]) {
        if let Err(err) = self.release_all(sectors) {
            warn!(
                inode = %self.inode,
                sectors = sectors.len(),
                error = %err,
                "rollback left sectors allocated"
            );
        }
    }

    /// Clear pointers a failed `wire` stored in index blocks `record`
    /// already owned, so none of them refers to a released sector.
    ///
    /// Index blocks the failed call added are simply dropped with the
    /// clone that referenced them.
    fn unwire(&self, record: &InodeRecord, old: usize, new: usize) {
        let owned_outer = outer_blocks_for(old);
        let mut cleared_outer = None;
        for index in old..new {
            let cleared = match BlockSlot::locate(index) {
                None | Some(BlockSlot::Direct(_)) => Ok(()),
                Some(BlockSlot::Indirect(i)) => match record.indirect {
                    Some(block) => write_pointer(self.cache, block, i, None),
                    None => Ok(()),
                },
                Some(BlockSlot::DoublyIndirect { outer, inner }) => {
                    match record.doubly_indirect {
                        None => Ok(()),
                        Some(doubly) if outer < owned_outer => read_pointer(self.cache, doubly, outer)
                            .and_then(|block| match block {
                                Some(block) => write_pointer(self.cache, block, inner, None),
                                None => Ok(()),
                            }),
                        Some(_) if cleared_outer == Some(outer) => Ok(()),
                        Some(doubly) => {
                            cleared_outer = Some(outer);
                            write_pointer(self.cache, doubly, outer, None)
                        }
                    }
                }
            };
            if let Err(err) = cleared {
                warn!(inode = %self.inode, index, error = %err, "could not clear pointer after failed growth");
            }
        }
    }

    /// Pop a reserved sector and give it an all-zero payload.
    fn take(&self, spare: &mut Vec<SectorId>) -> Result<SectorId> {
        let sector = spare.pop().ok_or_else(|| SfsError::Corruption {
            sector: self.inode.0,
            detail: "index block accounting does not match file length".to_owned(),
        })?;
        self.cache.zero(sector)?;
        Ok(sector)
    }

    fn wire(
        &self,
        record: &mut InodeRecord,
        old: usize,
        new: usize,
        spare: &mut Vec<SectorId>,
    ) -> Result<()> {
        for index in old..new {
            let data = self.take(spare)?;
            match BlockSlot::locate(index).ok_or(SfsError::FileTooLarge)? {
                BlockSlot::Direct(i) => record.direct[i] = Some(data),
                BlockSlot::Indirect(i) => {
                    let block = match record.indirect {
                        Some(block) => block,
                        None => {
                            let block = self.take(spare)?;
                            record.indirect = Some(block);
                            block
                        }
                    };
                    write_pointer(self.cache, block, i, Some(data))?;
                }
                BlockSlot::DoublyIndirect { outer, inner } => {
                    let doubly = match record.doubly_indirect {
                        Some(block) => block,
                        None => {
                            let block = self.take(spare)?;
                            record.doubly_indirect = Some(block);
                            block
                        }
                    };
                    let block = match read_pointer(self.cache, doubly, outer)? {
                        Some(block) => block,
                        None => {
                            let block = self.take(spare)?;
                            write_pointer(self.cache, doubly, outer, Some(block))?;
                            block
                        }
                    };
                    write_pointer(self.cache, block, inner, Some(data))?;
                }
            }
        }
        Ok(())
    }

    fn shrink(&self, record: &mut InodeRecord, old: usize, new: usize) -> Result<()> {
        let keep_indirect = new > DIRECT_POINTERS;
        let keep_doubly = new > DIRECT_POINTERS + POINTERS_PER_SECTOR;
        let kept_outer = outer_blocks_for(new);
        let missing = |tier: &str| SfsError::Corruption {
            sector: self.inode.0,
            detail: format!("{tier} index block missing below file length"),
        };

        let mut next = record.clone();
        let mut freed = Vec::new();
        for index in new..old {
            match BlockSlot::locate(index) {
                None => break,
                Some(BlockSlot::Direct(i)) => freed.extend(next.direct[i].take()),
                Some(BlockSlot::Indirect(i)) => {
                    let block = next.indirect.ok_or_else(|| missing("indirect"))?;
                    if let Some(data) = read_pointer(self.cache, block, i)? {
                        freed.push(data);
                        if keep_indirect {
                            write_pointer(self.cache, block, i, None)?;
                        }
                    }
                }
                Some(BlockSlot::DoublyIndirect { outer, inner }) => {
                    let doubly = next
                        .doubly_indirect
                        .ok_or_else(|| missing("doubly-indirect"))?;
                    let block =
                        read_pointer(self.cache, doubly, outer)?.ok_or_else(|| missing("second-level"))?;
                    if let Some(data) = read_pointer(self.cache, block, inner)? {
                        freed.push(data);
                        if outer < kept_outer {
                            write_pointer(self.cache, block, inner, None)?;
                        }
                    }
                }
            }
        }

        if !keep_indirect {
            freed.extend(next.indirect.take());
        }
        if let Some(doubly) = next.doubly_indirect {
            for outer in kept_outer..outer_blocks_for(old) {
                if let Some(block) = read_pointer(self.cache, doubly, outer)? {
                    freed.push(block);
                    if keep_doubly {
                        write_pointer(self.cache, doubly, outer, None)?;
                    }
                }
            }
            if !keep_doubly {
                freed.push(doubly);
                next.doubly_indirect = None;
            }
        }

        *record = next;
        debug!(
            inode = %self.inode,
            old_blocks = old,
            new_blocks = new,
            released = freed.len(),
            "shrank inode"
        );
        self.release_all(&freed)
    }

    /// Release every sector, reporting the first failure after trying all.
    fn release_all(&self, sectors: &[SectorId]) -> Result<()> {
        let mut first_err = None;
        for &sector in sectors {
            if let Err(err) = self.allocator.release(sector, 1) {
                warn!(inode = %self.inode, sector = %sector, error = %err, "release failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
