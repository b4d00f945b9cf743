//! Layer arena
//!
//! Every image of a dataset (the main image, overviews, masks, subdatasets)
//! is a node owned by the arena and addressed by [`LayerId`]. Links between
//! layers are plain indices, never ownership.

use super::cache::StrileCache;
use crate::tiff::Directory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

impl LayerId {
    pub const MAIN: LayerId = LayerId(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Main,
    Overview { level: usize },
    Mask,
    /// Another full-resolution page, exposed as `GTIFF_DIR:<index>:<file>`
    Subdataset { index: usize, name: String },
}

/// One contiguous multi-band strile held for band-by-band access
pub(crate) struct BlockBuffer {
    pub block: usize,
    pub data: Vec<u8>,
    pub dirty: bool,
}

pub(crate) struct LayerNode {
    pub dir: Directory,
    pub kind: LayerKind,
    /// Full-resolution image this overview belongs to
    pub base: Option<LayerId>,
    /// Imagery this mask applies to
    pub imagery: Option<LayerId>,
    pub mask: Option<LayerId>,
    pub overviews: Vec<LayerId>,
    pub cache: StrileCache,
    pub block_buf: Option<BlockBuffer>,
}

impl LayerNode {
    pub fn new(dir: Directory, kind: LayerKind, cache_size: usize) -> Self {
        Self {
            dir,
            kind,
            base: None,
            imagery: None,
            mask: None,
            overviews: Vec::new(),
            cache: StrileCache::new(cache_size),
            block_buf: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct LayerArena {
    slots: Vec<Option<LayerNode>>,
}

impl LayerArena {
    pub fn insert(&mut self, node: LayerNode) -> LayerId {
        self.slots.push(Some(node));
        LayerId(self.slots.len() - 1)
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerNode> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut LayerNode> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<LayerId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| LayerId(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Link an overview to its base image
    pub fn attach_overview(&mut self, base: LayerId, overview: LayerId) {
        if let Some(node) = self.get_mut(overview) {
            node.base = Some(base);
        }
        if let Some(node) = self.get_mut(base) {
            node.overviews.push(overview);
        }
    }

    /// Link a mask to the imagery it covers
    pub fn attach_mask(&mut self, imagery: LayerId, mask: LayerId) {
        if let Some(node) = self.get_mut(mask) {
            node.imagery = Some(imagery);
        }
        if let Some(node) = self.get_mut(imagery) {
            node.mask = Some(mask);
        }
    }

    /// Drop every link first, then every node
    pub fn teardown(&mut self) {
        for node in self.slots.iter_mut().flatten() {
            node.base = None;
            node.imagery = None;
            node.mask = None;
            node.overviews.clear();
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiff::ifd::{DirectorySpec, PHOTOMETRIC_MINISBLACK, PLANAR_CONTIG};
    use crate::types::DataType;

    fn node(kind: LayerKind, width: u32) -> LayerNode {
        let dir = Directory::new(DirectorySpec {
            subfile_type: 0,
            width,
            height: width,
            data_type: DataType::U8,
            samples_per_pixel: 1,
            compression: 1,
            photometric: PHOTOMETRIC_MINISBLACK,
            planar_config: PLANAR_CONTIG,
            tile_size: None,
            block_height: 8,
        })
        .unwrap();
        LayerNode::new(dir, kind, 4)
    }

    #[test]
    fn test_links_and_teardown() {
        let mut arena = LayerArena::default();
        let main = arena.insert(node(LayerKind::Main, 64));
        assert_eq!(main, LayerId::MAIN);
        let ov = arena.insert(node(LayerKind::Overview { level: 0 }, 32));
        let mask = arena.insert(node(LayerKind::Mask, 64));
        arena.attach_overview(main, ov);
        arena.attach_mask(main, mask);

        assert_eq!(arena.get(ov).unwrap().base, Some(main));
        assert_eq!(arena.get(main).unwrap().overviews, vec![ov]);
        assert_eq!(arena.get(main).unwrap().mask, Some(mask));
        assert_eq!(arena.ids(), vec![main, ov, mask]);

        arena.teardown();
        assert_eq!(arena.len(), 0);
        assert!(arena.get(main).is_none());
    }
}
