//! NOFF executable header parser.
//!
//! A NOFF image starts with a magic word followed by four segment
//! descriptors, all 32-bit words:
//!
//! ```text
//! magic | code | init_data | readonly_data | uninit_data
//!         each segment = virtual_addr, in_file_addr, size
//! ```
//!
//! Images are produced on machines of either byte order. A header whose
//! magic only matches after a byte swap is swapped word by word.

/// NOFF magic number.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// Header size in bytes: the magic plus four 3-word segments.
pub const NOFF_HEADER_SIZE: usize = 4 + 4 * Segment::SIZE;

/// One segment descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Where the segment starts in the address space.
    pub virtual_addr: u32,
    /// Where its bytes start in the image.
    pub in_file_addr: u32,
    /// Segment size in bytes.
    pub size: u32,
}

impl Segment {
    const SIZE: usize = 12;

    pub const fn new(virtual_addr: u32, in_file_addr: u32, size: u32) -> Self {
        Self { virtual_addr, in_file_addr, size }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn swap(self) -> Self {
        Self {
            virtual_addr: self.virtual_addr.swap_bytes(),
            in_file_addr: self.in_file_addr.swap_bytes(),
            size: self.size.swap_bytes(),
        }
    }
}

/// A parsed NOFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffHeader {
    pub magic: u32,
    pub code: Segment,
    pub init_data: Segment,
    pub readonly_data: Segment,
    pub uninit_data: Segment,
}

/// Errors that can occur during header parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoffError {
    /// Fewer than [`NOFF_HEADER_SIZE`] bytes.
    TooSmall,
    /// Magic word matches in neither byte order.
    BadMagic(u32),
}

impl core::fmt::Display for NoffError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NoffError::TooSmall => write!(f, "image shorter than a NOFF header"),
            NoffError::BadMagic(m) => write!(f, "bad NOFF magic {:#010x}", m),
        }
    }
}

impl NoffHeader {
    /// A header with the given segments and the host-order magic.
    pub fn new(code: Segment, init_data: Segment, readonly_data: Segment, uninit_data: Segment) -> Self {
        Self {
            magic: NOFF_MAGIC,
            code,
            init_data,
            readonly_data,
            uninit_data,
        }
    }

    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NoffError> {
        if data.len() < NOFF_HEADER_SIZE {
            return Err(NoffError::TooSmall);
        }

        let word = |i: usize| u32::from_ne_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]]);
        let segment = |first: usize| Segment::new(word(first), word(first + 1), word(first + 2));

        let header = Self {
            magic: word(0),
            code: segment(1),
            init_data: segment(4),
            readonly_data: segment(7),
            uninit_data: segment(10),
        };

        if header.magic == NOFF_MAGIC {
            Ok(header)
        } else if header.magic.swap_bytes() == NOFF_MAGIC {
            log::debug!("noff: header byte order differs from host, swapping");
            Ok(header.swap())
        } else {
            Err(NoffError::BadMagic(header.magic))
        }
    }

    fn swap(self) -> Self {
        Self {
            magic: self.magic.swap_bytes(),
            code: self.code.swap(),
            init_data: self.init_data.swap(),
            readonly_data: self.readonly_data.swap(),
            uninit_data: self.uninit_data.swap(),
        }
    }

    /// Serialize in host byte order.
    pub fn to_bytes(&self) -> [u8; NOFF_HEADER_SIZE] {
        let mut out = [0u8; NOFF_HEADER_SIZE];
        let words = [
            self.magic,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.readonly_data.virtual_addr,
            self.readonly_data.in_file_addr,
            self.readonly_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_ne_bytes());
        }
        out
    }

    /// Bytes of address space the image needs, not counting the stack.
    pub fn image_size(&self) -> usize {
        [self.code, self.init_data, self.readonly_data, self.uninit_data]
            .iter()
            .map(|s| s.size as usize)
            .sum()
    }

    /// Segments whose bytes come from the image, in load order.
    pub fn loadable_segments(&self) -> [(&'static str, Segment); 3] {
        [
            ("code", self.code),
            ("init data", self.init_data),
            ("read-only data", self.readonly_data),
        ]
    }
}
