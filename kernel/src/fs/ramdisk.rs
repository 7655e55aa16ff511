//! In-memory file store.
//!
//! Holds named byte images, typically NOFF executables. Hosting code fills it
//! before starting the first process; tests build their images on the fly.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::{FileSystem, OpenFile};
use crate::sync::spinlock::SpinLock;

/// A read-only RAM-backed file store.
#[derive(Default)]
pub struct RamDisk {
	files: SpinLock<BTreeMap<String, Arc<[u8]>>>,
}

impl RamDisk {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add (or replace) the file `name`.
	pub fn insert(&self, name: &str, contents: impl Into<Arc<[u8]>>) {
		let contents = contents.into();
		log::debug!("ramdisk: stored '{}' ({} bytes)", name, contents.len());
		self.files.lock().insert(String::from(name), contents);
	}

	/// Builder-style [`RamDisk::insert`].
	pub fn with_file(self, name: &str, contents: impl Into<Arc<[u8]>>) -> Self {
		self.insert(name, contents);
		self
	}

	/// Remove `name`, returning whether it existed.
	pub fn remove(&self, name: &str) -> bool {
		self.files.lock().remove(name).is_some()
	}

	pub fn file_count(&self) -> usize {
		self.files.lock().len()
	}
}

impl FileSystem for RamDisk {
	fn open(&self, name: &str) -> Option<Box<dyn OpenFile>> {
		let data = self.files.lock().get(name).cloned()?;
		Some(Box::new(RamFile { data }))
	}
}

/// An open handle onto one RAM-disk file.
struct RamFile {
	data: Arc<[u8]>,
}

impl OpenFile for RamFile {
	fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
		if offset >= self.data.len() {
			return 0;
		}
		let n = buf.len().min(self.data.len() - offset);
		buf[..n].copy_from_slice(&self.data[offset..offset + n]);
		n
	}

	fn length(&self) -> usize {
		self.data.len()
	}
}
