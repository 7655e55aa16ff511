//! User programs: address spaces and program loading.

pub mod addrspace;

pub use addrspace::AddrSpace;

use crate::fs::noff::NoffError;

/// Why an image could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No file by that name.
    NotFound(String),
    /// Header truncated, or segments pointing outside the file or the
    /// address space.
    BadHeader,
    /// Not a NOFF image.
    BadMagic(u32),
    /// Needs more pages than physical memory has.
    TooLarge { pages: usize, capacity: usize },
    /// Not enough frames left to reserve.
    OutOfMemory { pages: usize },
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::NotFound(name) => write!(f, "unable to open file '{}'", name),
            LoadError::BadHeader => write!(f, "malformed NOFF header"),
            LoadError::BadMagic(m) => write!(f, "bad NOFF magic {:#010x}", m),
            LoadError::TooLarge { pages, capacity } => {
                write!(f, "program needs {} pages, machine has {}", pages, capacity)
            }
            LoadError::OutOfMemory { pages } => write!(f, "cannot reserve {} pages", pages),
        }
    }
}

impl From<NoffError> for LoadError {
    fn from(e: NoffError) -> Self {
        match e {
            NoffError::TooSmall => LoadError::BadHeader,
            NoffError::BadMagic(m) => LoadError::BadMagic(m),
        }
    }
}
