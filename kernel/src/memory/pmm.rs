//! Bitmap-based physical frame allocator with two-phase reservation.
//!
//! Tracks main-memory frames with a [`Bitmap`]: bit **1** = used, bit **0** = free.
//! Capacity is handed out in two steps:
//!
//! 1. [`MemoryManager::reserve_pages`] commits to `n` frames up front or fails
//!    without touching anything, so "insufficient memory" is always a clean,
//!    recoverable error.
//! 2. [`MemoryManager::get_page`] then hands out one concrete frame per call.
//!    Running out here means somebody skipped step 1, which is a kernel bug.
//!
//! The in-use counter moves with reservations and frees, not with
//! `get_page`, so it always covers frames that are promised but not yet taken.

use crate::memory::bitmap::Bitmap;
use crate::sync::spinlock::SpinLock;

struct FrameState {
	/// Which frames are actually handed out.
	frames: Bitmap,
	/// Frames reserved or in use.
	used: usize,
}

/// The physical frame allocator.
pub struct MemoryManager {
	state: SpinLock<FrameState>,
	total_frames: usize,
}

impl MemoryManager {
	/// Create an allocator over `total_frames` frames, all free.
	pub fn new(total_frames: usize) -> Self {
		log::info!("frame allocator: {} frames tracked", total_frames);
		Self {
			state: SpinLock::new(FrameState {
				frames: Bitmap::new(total_frames),
				used: 0,
			}),
			total_frames,
		}
	}

	pub fn total_frames(&self) -> usize {
		self.total_frames
	}

	/// Commit to `count` frames. Returns `false`, changing nothing, if fewer
	/// than `count` remain unreserved.
	pub fn reserve_pages(&self, count: usize) -> bool {
		let mut state = self.state.lock();
		if self.total_frames - state.used < count {
			log::warn!(
				"frame allocator: cannot reserve {} frames ({} left)",
				count,
				self.total_frames - state.used
			);
			return false;
		}
		state.used += count;
		log::debug!("frame allocator: reserved {} frames, {} in use", count, state.used);
		true
	}

	/// Take one frame out of a prior reservation.
	///
	/// # Panics
	///
	/// Panics if no frame is free, which only happens when the caller did
	/// not reserve first.
	pub fn get_page(&self) -> usize {
		let mut state = self.state.lock();
		match state.frames.find_and_set() {
			Some(frame) => {
				log::trace!("frame allocator: handing out frame {}", frame);
				frame
			}
			None => panic!("frame allocator: no free frame despite a prior reservation"),
		}
	}

	/// Return `frame` to the pool. Freeing a frame that is already free is a
	/// no-op.
	pub fn clear_page(&self, frame: usize) {
		let mut state = self.state.lock();
		if !state.frames.test(frame) {
			return;
		}
		state.frames.clear(frame);
		state.used -= 1;
		log::trace!("frame allocator: freed frame {}, {} in use", frame, state.used);
	}

	/// Frames not yet reserved. Advisory: may be stale as soon as it returns.
	pub fn free_page_count(&self) -> usize {
		self.total_frames - self.state.lock().used
	}
}

impl core::fmt::Debug for MemoryManager {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("MemoryManager")
			.field("total_frames", &self.total_frames)
			.field("free", &self.free_page_count())
			.finish()
	}
}
