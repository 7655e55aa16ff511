// =============================================================================
// SimOS — Page Tables and Address Translation
// =============================================================================
//
// Every address space owns one linear page table: entry `i` maps virtual
// page `i`. There is no hierarchy and no TLB; the machine translates every
// user access through the table installed for the running process.
//
// ENTRY FLAGS:
//   VALID      the entry maps a frame
//   USE        set on any access through the entry
//   DIRTY      set on a write through the entry
//   READ_ONLY  writes fault with ReadOnlyError
//
// TRANSLATION (`PageTable::translate`):
//   vaddr → (vpn, offset)
//   vpn ≥ table length or entry not valid  → AddressError
//   write to a READ_ONLY entry             → ReadOnlyError
//   frame ≥ physical capacity              → BusError (corrupted entry)
//   otherwise set USE (+ DIRTY on write), return frame * page_size + offset
//
// =============================================================================

use bitflags::bitflags;
use core::fmt;

use crate::memory::address::{PhysAddr, VirtAddr};

bitflags! {
    /// Flags of a translation entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        const VALID     = 1 << 0;
        const USE       = 1 << 1;
        const DIRTY     = 1 << 2;
        const READ_ONLY = 1 << 3;
    }
}

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Unaligned access, or an address beyond the mapping.
    AddressError,
    /// Write to a read-only page.
    ReadOnlyError,
    /// Entry points outside physical memory.
    BusError,
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionType::AddressError => write!(f, "address error"),
            ExceptionType::ReadOnlyError => write!(f, "write to read-only page"),
            ExceptionType::BusError => write!(f, "bus error"),
        }
    }
}

// =============================================================================
// Translation Entry
// =============================================================================

/// One virtual-page-to-frame mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    pub virtual_page: usize,
    pub physical_page: usize,
    pub flags: EntryFlags,
}

impl TranslationEntry {
    /// A valid, writable, unused and clean mapping.
    pub const fn new(virtual_page: usize, physical_page: usize) -> Self {
        Self {
            virtual_page,
            physical_page,
            flags: EntryFlags::VALID,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EntryFlags::READ_ONLY)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags.contains(EntryFlags::USE)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// A linear page table, indexed by virtual page number.
#[derive(Debug, Clone)]
pub struct PageTable {
    entries: Vec<TranslationEntry>,
    page_size: usize,
}

impl PageTable {
    /// An empty table: every address faults.
    pub fn new(page_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Byte size of the mapping.
    pub fn size(&self) -> usize {
        self.entries.len() * self.page_size
    }

    pub fn entry(&self, vpn: usize) -> Option<&TranslationEntry> {
        self.entries.get(vpn)
    }

    pub fn entry_mut(&mut self, vpn: usize) -> Option<&mut TranslationEntry> {
        self.entries.get_mut(vpn)
    }

    /// Append the mapping for the next virtual page.
    pub fn push(&mut self, entry: TranslationEntry) {
        debug_assert_eq!(entry.virtual_page, self.entries.len());
        self.entries.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.entries.iter()
    }

    /// Remove every mapping, returning the frames the valid ones pointed at.
    pub fn take_frames(&mut self) -> Vec<usize> {
        self.entries
            .drain(..)
            .filter(TranslationEntry::is_valid)
            .map(|e| e.physical_page)
            .collect()
    }

    /// Translate `vaddr` for an access of the given kind.
    ///
    /// `num_phys_pages` is the physical capacity the frame number is checked
    /// against. On success the entry's USE bit, and on writes its DIRTY bit,
    /// are set.
    pub fn translate(
        &mut self,
        vaddr: VirtAddr,
        is_write: bool,
        num_phys_pages: usize,
    ) -> Result<PhysAddr, ExceptionType> {
        let vpn = vaddr.page_number(self.page_size);
        let offset = vaddr.page_offset(self.page_size);

        let entry = match self.entries.get_mut(vpn) {
            Some(entry) if entry.is_valid() => entry,
            _ => {
                log::debug!("translate: {} beyond mapping of {} pages", vaddr, self.entries.len());
                return Err(ExceptionType::AddressError);
            }
        };

        if is_write && entry.is_read_only() {
            log::debug!("translate: write to read-only page {}", vpn);
            return Err(ExceptionType::ReadOnlyError);
        }

        if entry.physical_page >= num_phys_pages {
            log::error!(
                "translate: page {} maps frame {}, beyond {} frames",
                vpn,
                entry.physical_page,
                num_phys_pages
            );
            return Err(ExceptionType::BusError);
        }

        entry.flags.insert(EntryFlags::USE);
        if is_write {
            entry.flags.insert(EntryFlags::DIRTY);
        }

        Ok(PhysAddr::from_frame(entry.physical_page, offset, self.page_size))
    }
}
