use std::collections::BTreeMap;
use std::path::PathBuf;

/// Stable identifier of a media asset in the external catalog.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct MediaId(pub String);

impl MediaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Image,
    Audio,
}

impl MediaKind {
    /// Whether the asset contributes pixels to a frame.
    pub fn is_visual(self) -> bool {
        matches!(self, Self::Video | Self::Image)
    }
}

/// Descriptor of a decodable asset, owned by the media catalog.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MediaItem {
    pub id: MediaId,
    pub kind: MediaKind,
    /// Where the loader finds the asset bytes (usually a filesystem path).
    pub locator: PathBuf,
    /// Natural pixel width (0 when unknown).
    #[serde(default)]
    pub width: u32,
    /// Natural pixel height (0 when unknown).
    #[serde(default)]
    pub height: u32,
    /// Natural duration for time-based media.
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, kind: MediaKind, locator: impl Into<PathBuf>) -> Self {
        Self {
            id: MediaId::new(id),
            kind,
            locator: locator.into(),
            width: 0,
            height: 0,
            duration_secs: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Resolves media ids referenced by timeline elements.
pub trait MediaCatalog: Send + Sync {
    fn resolve_media_item(&self, id: &MediaId) -> Option<MediaItem>;
}

/// Catalog backed by a map; used by the CLI bundle format and tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    items: BTreeMap<MediaId, MediaItem>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: MediaItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<MediaItem> for InMemoryCatalog {
    fn from_iter<I: IntoIterator<Item = MediaItem>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for item in iter {
            catalog.insert(item);
        }
        catalog
    }
}

impl MediaCatalog for InMemoryCatalog {
    fn resolve_media_item(&self, id: &MediaId) -> Option<MediaItem> {
        self.items.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_resolves_known_ids_only() {
        let catalog: InMemoryCatalog =
            [MediaItem::new("a", MediaKind::Image, "a.png").with_size(4, 4)]
                .into_iter()
                .collect();
        assert!(catalog.resolve_media_item(&MediaId::new("a")).is_some());
        assert!(catalog.resolve_media_item(&MediaId::new("b")).is_none());
    }

    #[test]
    fn media_id_is_a_plain_json_string() {
        let json = serde_json::to_string(&MediaId::new("clip-1")).unwrap();
        assert_eq!(json, "\"clip-1\"");
    }
}
