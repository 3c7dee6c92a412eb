//! Stream metadata (SRI) descriptors and change tracking.
//!
//! A [`StreamDescriptor`] carries the signal-related information for one
//! logical stream: sample spacing, axis units, frame size, complex mode,
//! the blocking flag, and an ordered keyword map. The stream ID is
//! immutable; every other field change bumps a strictly increasing
//! `version` counter that consumers use purely for change detection.

use crate::types::Value;

/// Bitmask of descriptor fields that differ between two descriptors.
///
/// Returned by [`StreamDescriptor::compare_fields`] and surfaced on the
/// first data block delivered after a metadata change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SriChangeFlags(pub u32);

impl SriChangeFlags {
    pub const NONE: SriChangeFlags = SriChangeFlags(0);
    pub const HVERSION: SriChangeFlags = SriChangeFlags(1 << 0);
    pub const XSTART: SriChangeFlags = SriChangeFlags(1 << 1);
    pub const XDELTA: SriChangeFlags = SriChangeFlags(1 << 2);
    pub const XUNITS: SriChangeFlags = SriChangeFlags(1 << 3);
    pub const SUBSIZE: SriChangeFlags = SriChangeFlags(1 << 4);
    pub const YSTART: SriChangeFlags = SriChangeFlags(1 << 5);
    pub const YDELTA: SriChangeFlags = SriChangeFlags(1 << 6);
    pub const YUNITS: SriChangeFlags = SriChangeFlags(1 << 7);
    pub const MODE: SriChangeFlags = SriChangeFlags(1 << 8);
    pub const STREAMID: SriChangeFlags = SriChangeFlags(1 << 9);
    pub const BLOCKING: SriChangeFlags = SriChangeFlags(1 << 10);
    pub const KEYWORDS: SriChangeFlags = SriChangeFlags(1 << 11);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: SriChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SriChangeFlags {
    type Output = SriChangeFlags;

    fn bitor(self, rhs: SriChangeFlags) -> SriChangeFlags {
        SriChangeFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SriChangeFlags {
    fn bitor_assign(&mut self, rhs: SriChangeFlags) {
        self.0 |= rhs.0;
    }
}

/// Axis units, following the conventional signal axis codes.
pub mod units {
    pub const NONE: i16 = 0;
    pub const TIME: i16 = 1;
    pub const FREQUENCY: i16 = 3;
}

/// Signal-related information for one logical stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    stream_id: String,
    /// Start of the primary axis (typically seconds)
    pub xstart: f64,
    /// Spacing between samples on the primary axis
    pub xdelta: f64,
    /// Units of the primary axis
    pub xunits: i16,
    /// Frame length for two-dimensional data; 0 means one-dimensional
    pub subsize: u32,
    /// Start of the secondary (frame) axis
    pub ystart: f64,
    /// Spacing between frames on the secondary axis
    pub ydelta: f64,
    /// Units of the secondary axis
    pub yunits: i16,
    /// Complex mode: samples are interleaved scalar pairs
    pub complex: bool,
    /// Backpressure the input queue instead of flushing it
    pub blocking: bool,
    /// Ordered keyword map
    pub keywords: Vec<(String, Value)>,
    version: u64,
}

impl StreamDescriptor {
    /// Create a descriptor with default metadata for a new stream ID.
    pub fn new(stream_id: impl Into<String>) -> Self {
        StreamDescriptor {
            stream_id: stream_id.into(),
            xstart: 0.0,
            xdelta: 1.0,
            xunits: units::TIME,
            subsize: 0,
            ystart: 0.0,
            ydelta: 0.0,
            yunits: units::NONE,
            complex: false,
            blocking: false,
            keywords: Vec::new(),
            version: 1,
        }
    }

    /// The immutable stream identifier.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The modification counter. Strictly increases on every effective
    /// metadata change; meaningful only within a single stream.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Scalars per sample under the current mode (2 when complex).
    pub fn scalars_per_sample(&self) -> usize {
        if self.complex { 2 } else { 1 }
    }

    /// Rewrite all metadata fields (except the stream ID) from another
    /// descriptor. No-ops, without bumping the version, when every field
    /// is already equal.
    pub fn update(&mut self, other: &StreamDescriptor) {
        if self.fields_equal(other) {
            return;
        }
        self.xstart = other.xstart;
        self.xdelta = other.xdelta;
        self.xunits = other.xunits;
        self.subsize = other.subsize;
        self.ystart = other.ystart;
        self.ydelta = other.ydelta;
        self.yunits = other.yunits;
        self.complex = other.complex;
        self.blocking = other.blocking;
        self.keywords = other.keywords.clone();
        self.version += 1;
    }

    /// Mutate a single field through a closure, bumping the version only
    /// when the field actually changed.
    pub(crate) fn modify<F: FnOnce(&mut StreamDescriptor)>(&mut self, f: F) {
        let before = self.clone();
        f(self);
        self.version = before.version;
        if !self.fields_equal(&before) {
            self.version += 1;
        }
    }

    /// Append or update a keyword; no-op when the value is unchanged.
    pub fn set_keyword(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.keywords.iter_mut().find(|(k, _)| *k == name) {
            if entry.1 == value {
                return;
            }
            entry.1 = value;
        } else {
            self.keywords.push((name, value));
        }
        self.version += 1;
    }

    /// Remove a keyword; no-op when absent.
    pub fn erase_keyword(&mut self, name: &str) {
        let before = self.keywords.len();
        self.keywords.retain(|(k, _)| k != name);
        if self.keywords.len() != before {
            self.version += 1;
        }
    }

    /// Look up a keyword value by name.
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    fn fields_equal(&self, other: &StreamDescriptor) -> bool {
        Self::compare_fields(self, other).is_empty()
    }

    /// Structural diff: the bitmask of fields that differ between two
    /// descriptors. Versions are not compared.
    pub fn compare_fields(a: &StreamDescriptor, b: &StreamDescriptor) -> SriChangeFlags {
        let mut flags = SriChangeFlags::NONE;
        if a.stream_id != b.stream_id {
            flags |= SriChangeFlags::STREAMID;
        }
        if a.xstart != b.xstart {
            flags |= SriChangeFlags::XSTART;
        }
        if a.xdelta != b.xdelta {
            flags |= SriChangeFlags::XDELTA;
        }
        if a.xunits != b.xunits {
            flags |= SriChangeFlags::XUNITS;
        }
        if a.subsize != b.subsize {
            flags |= SriChangeFlags::SUBSIZE;
        }
        if a.ystart != b.ystart {
            flags |= SriChangeFlags::YSTART;
        }
        if a.ydelta != b.ydelta {
            flags |= SriChangeFlags::YDELTA;
        }
        if a.yunits != b.yunits {
            flags |= SriChangeFlags::YUNITS;
        }
        if a.complex != b.complex {
            flags |= SriChangeFlags::MODE;
        }
        if a.blocking != b.blocking {
            flags |= SriChangeFlags::BLOCKING;
        }
        if a.keywords != b.keywords {
            flags |= SriChangeFlags::KEYWORDS;
        }
        flags
    }
}
