//! External texture replacement provider interface.
//!
//! Replacement packs substitute decoded guest texture data with externally
//! supplied images, keyed by a stable content hash of the guest pixel region.
//! The provider is consulted per mip level; a pack may replace only some
//! levels of a chain.

/// Stable content key for a texture's pixel region.
pub type ContentKey = [u8; 32];

/// Computes the content key replacement packs are keyed by: a blake3 hash of
/// the raw level-0 guest bytes. Stable across runs and platforms, which is
/// what lets packs ship precomputed keys.
pub fn content_key_for(region: &[u8]) -> ContentKey {
    blake3::hash(region).into()
}

#[derive(Clone, Debug)]
pub struct ReplacementImage {
    /// Tightly packed RGBA8.
    pub rgba: Vec<u8>,
    /// Natural dimensions of the replacement, which may differ from the
    /// guest level's dimensions.
    pub width: u32,
    pub height: u32,
}

pub trait ReplacementProvider {
    fn lookup(&self, key: &ContentKey, level: u32) -> Option<ReplacementImage>;
}

/// Default provider: replaces nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReplacements;

impl ReplacementProvider for NoReplacements {
    fn lookup(&self, _key: &ContentKey, _level: u32) -> Option<ReplacementImage> {
        None
    }
}

/// In-memory provider for tests.
#[derive(Default)]
pub struct TableReplacements {
    entries: Vec<(ContentKey, u32, ReplacementImage)>,
}

impl TableReplacements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ContentKey, level: u32, image: ReplacementImage) {
        self.entries.push((key, level, image));
    }
}

impl ReplacementProvider for TableReplacements {
    fn lookup(&self, key: &ContentKey, level: u32) -> Option<ReplacementImage> {
        self.entries
            .iter()
            .find(|(k, l, _)| k == key && *l == level)
            .map(|(_, _, img)| img.clone())
    }
}
