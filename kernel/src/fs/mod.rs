//! Storage surface used to load executable images.
//!
//! The kernel only needs to open an image by name and read it at an offset.
//! Anything that can do that (a host directory, a disk image, an in-memory
//! table) plugs in through [`FileSystem`].

pub mod noff;
pub mod ramdisk;

pub use ramdisk::RamDisk;

/// A named-file store.
pub trait FileSystem: Send + Sync {
	/// Open `name`, or `None` if it does not exist.
	fn open(&self, name: &str) -> Option<Box<dyn OpenFile>>;
}

/// An open file. Closed when dropped.
pub trait OpenFile: Send {
	/// Read up to `buf.len()` bytes starting at `offset`, returning how many
	/// were read. Reads past the end return 0.
	fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

	/// File length in bytes.
	fn length(&self) -> usize;
}
