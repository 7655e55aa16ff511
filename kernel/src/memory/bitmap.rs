//! Fixed-size allocation bitmap.
//!
//! Bit **1** = used, bit **0** = free. Shared by the frame allocator and the
//! pid table; callers provide the locking.

/// A bitmap over `len` slots.
pub struct Bitmap {
	words: Vec<u64>,
	len: usize,
}

impl Bitmap {
	/// Create a bitmap with every slot free.
	pub fn new(len: usize) -> Self {
		Self {
			words: vec![0; len.div_ceil(64)],
			len,
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Is slot `index` in use?
	pub fn test(&self, index: usize) -> bool {
		assert!(index < self.len, "bitmap index {} out of range ({})", index, self.len);
		self.words[index / 64] & (1u64 << (index % 64)) != 0
	}

	/// Mark slot `index` in use.
	pub fn mark(&mut self, index: usize) {
		assert!(index < self.len, "bitmap index {} out of range ({})", index, self.len);
		self.words[index / 64] |= 1u64 << (index % 64);
	}

	/// Mark slot `index` free.
	pub fn clear(&mut self, index: usize) {
		assert!(index < self.len, "bitmap index {} out of range ({})", index, self.len);
		self.words[index / 64] &= !(1u64 << (index % 64));
	}

	/// Find the lowest free slot, mark it used and return it.
	pub fn find_and_set(&mut self) -> Option<usize> {
		for (word_idx, word) in self.words.iter_mut().enumerate() {
			if *word == u64::MAX {
				continue;
			}
			let bit_idx = word.trailing_ones() as usize;
			let index = word_idx * 64 + bit_idx;
			if index >= self.len {
				return None;
			}
			*word |= 1u64 << bit_idx;
			return Some(index);
		}
		None
	}

	/// Number of free slots.
	pub fn num_clear(&self) -> usize {
		let used: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
		self.len - used
	}
}
