// =============================================================================
// SimOS — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a user (virtual) address with a main-memory (physical) offset is
// the classic address-space bug: the kernel writes through the wrong one and
// silently corrupts another process.
//
// SOLUTION: Newtype pattern.
//   PhysAddr and VirtAddr are separate types. The only way from one to the
//   other is `PageTable::translate`, which is the single authority for
//   virtual-to-physical translation.
//
// SIMULATED ADDRESS SPACE:
//   - Physical: byte offset into main memory, 0 .. num_phys_pages * page_size
//   - Virtual:  byte offset into one process's address space,
//               0 .. num_pages * page_size
//   Page size is a runtime configuration value, so page arithmetic takes it
//   as a parameter.
//
// =============================================================================

use core::fmt;

// =============================================================================
// PhysAddr — A main-memory address
// =============================================================================

/// A byte offset into the simulated main memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Address of byte `offset` inside `frame`.
    #[inline]
    pub const fn from_frame(frame: usize, offset: usize, page_size: usize) -> Self {
        Self(frame * page_size + offset)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Frame this address falls in.
    #[inline]
    pub const fn frame(self, page_size: usize) -> usize {
        self.0 / page_size
    }
}

/// The `P:` prefix distinguishes it from virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#06X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#06X}", self.0)
    }
}

impl core::ops::Add<usize> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

// =============================================================================
// VirtAddr — A user address
// =============================================================================

/// A byte offset into one process's address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Interpret a register value as a user address.
    ///
    /// Registers are signed; a negative value is an address no mapping can
    /// contain and translates to `AddressError`.
    #[inline]
    pub const fn from_register(value: i32) -> Self {
        Self(value as u32 as usize)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Virtual page number.
    #[inline]
    pub const fn page_number(self, page_size: usize) -> usize {
        self.0 / page_size
    }

    /// Byte offset within the page.
    #[inline]
    pub const fn page_offset(self, page_size: usize) -> usize {
        self.0 % page_size
    }

    /// Returns true if the address is a multiple of `align`.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#06X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#06X}", self.0)
    }
}

impl core::ops::Add<usize> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

/// Round `bytes` up to a whole number of pages.
#[inline]
pub const fn pages_for(bytes: usize, page_size: usize) -> usize {
    bytes.div_ceil(page_size)
}
