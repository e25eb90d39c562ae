use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Protocol-assigned object handle (a D-Bus object path for PulseAudio).
pub type Handle = Arc<str>;

/// Registry generation counter, bumped on every reconnect.
pub type Generation = u64;

/// Raw property list of a protocol object, decoded to strings
pub type Properties = BTreeMap<String, String>;

/// Identity of an object as handed out to the UI.
///
/// Only meaningful within the generation it was issued in; the same handle
/// may name a different object after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub generation: Generation,
    pub handle: Handle,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.handle, self.generation)
    }
}

/// Object kind (devices sort before streams for display)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// Output device
    Sink,
    /// Application playback stream
    Stream,
}

/// A live audio object as reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct AudioObject {
    pub handle: Handle,
    pub kind: ObjectKind,
    pub properties: Properties,
    /// Raw per-channel volume, in server units
    pub volume: Vec<u32>,
    pub muted: bool,
}

impl AudioObject {
    pub fn new(handle: impl Into<Handle>, kind: ObjectKind) -> Self {
        Self {
            handle: handle.into(),
            kind,
            properties: Properties::new(),
            volume: Vec::new(),
            muted: false,
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_volume(mut self, volume: Vec<u32>) -> Self {
        self.volume = volume;
        self
    }

    /// Mean of all channels.
    pub fn raw_level(&self) -> u32 {
        if self.volume.is_empty() {
            return 0;
        }
        let sum: u64 = self.volume.iter().map(|&v| v as u64).sum();
        (sum / self.volume.len() as u64) as u32
    }
}

/// Partial mutation of an `AudioObject`; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdate {
    pub properties: Option<Properties>,
    pub volume: Option<Vec<u32>>,
    pub muted: Option<bool>,
}

impl ObjectUpdate {
    pub fn volume(volume: Vec<u32>) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn muted(muted: bool) -> Self {
        Self {
            muted: Some(muted),
            ..Default::default()
        }
    }

    pub fn properties(properties: Properties) -> Self {
        Self {
            properties: Some(properties),
            ..Default::default()
        }
    }
}

/// The integer level range the UI works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelScale {
    pub min_level: u32,
    pub max_level: u32,
}

impl LevelScale {
    pub fn new(min_level: u32, max_level: u32) -> Self {
        Self {
            min_level,
            max_level,
        }
    }

    pub fn clamp(&self, level: u32) -> u32 {
        level.clamp(self.min_level, self.max_level)
    }

    /// Absolute level for a fraction of `max_level`, clamped into range.
    pub fn level_at(&self, fraction: f64) -> u32 {
        let level = (fraction.clamp(0.0, 1.0) * self.max_level as f64).round() as u32;
        self.clamp(level)
    }

    /// Position of `level` within `[min_level, max_level]`, as 0.0..=1.0.
    pub fn position(&self, level: u32) -> f64 {
        let span = self.max_level.saturating_sub(self.min_level);
        if span == 0 {
            return 0.0;
        }
        let offset = self.clamp(level) - self.min_level;
        offset as f64 / span as f64
    }

    /// Span of one adjustment step given as a percentage of the range.
    pub fn step(&self, percent: u32) -> u32 {
        let span = self.max_level.saturating_sub(self.min_level) as u64;
        ((span * percent as u64) / 100).max(1) as u32
    }
}

impl Default for LevelScale {
    fn default() -> Self {
        Self::new(0, 1 << 16)
    }
}

/// Display-ready projection of an `AudioObject` with its rule effect applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayItem {
    pub id: ObjectRef,
    pub kind: ObjectKind,
    pub label: String,
    /// Effective level, always within `[floor, ceiling]`
    pub level: u32,
    pub floor: u32,
    pub ceiling: u32,
    pub muted: bool,
    pub hidden: bool,
    /// Level is pinned by a `volume-set` rule
    pub forced: bool,
    /// Index in the visible ordering
    pub position: usize,
}

impl DisplayItem {
    pub fn clamp(&self, level: u32) -> u32 {
        level.clamp(self.floor, self.ceiling)
    }
}

/// Immutable, complete view of one Registry state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub generation: Generation,
    /// Visible items: devices first, then streams, each in first-seen order
    pub items: Vec<DisplayItem>,
    /// Objects tracked but excluded by a `hidden` rule
    pub hidden: usize,
}

impl Snapshot {
    pub fn find(&self, id: &ObjectRef) -> Option<&DisplayItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn index_of(&self, id: &ObjectRef) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }
}
