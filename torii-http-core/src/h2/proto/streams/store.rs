use fnv::FnvHashMap;
use slab::Slab;

use crate::h2::frame::{StreamDependency, StreamId, DEFAULT_INITIAL_WINDOW_SIZE};

use super::state::State;

/// Default weight for streams that never received a PRIORITY frame
/// (RFC 7540 §5.3.5), stored in the on-wire [0, 255] form.
pub(crate) const DEFAULT_WEIGHT: u8 = 15;

/// One registered stream: FSM state plus its slot in the dependency
/// tree and its send-window credit.
#[derive(Debug)]
pub(crate) struct Stream {
    pub id: StreamId,
    pub state: State,
    /// On-wire weight in [0, 255]; effective weight is this plus one.
    pub weight: u8,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Outbound byte credit; decremented by DATA payload sizes and
    /// never driven below zero.
    pub window: u32,
}

impl Stream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            state: State::default(),
            weight: DEFAULT_WEIGHT,
            parent: None,
            children: Vec::new(),
            window: DEFAULT_INITIAL_WINDOW_SIZE,
        }
    }
}

/// The authoritative stream registry: an arena plus the id map and the
/// parent/child links of the priority tree, all by index.
#[derive(Debug, Default)]
pub(crate) struct Store {
    arena: Slab<Stream>,
    ids: FnvHashMap<StreamId, usize>,
}

impl Store {
    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn key_of(&self, id: StreamId) -> Option<usize> {
        self.ids.get(&id).copied()
    }

    pub(crate) fn get(&self, key: usize) -> &Stream {
        &self.arena[key]
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> &mut Stream {
        &mut self.arena[key]
    }

    pub(crate) fn by_id(&self, id: StreamId) -> Option<&Stream> {
        self.key_of(id).map(|key| self.get(key))
    }

    pub(crate) fn by_id_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.key_of(id).map(move |key| self.get_mut(key))
    }

    /// Returns the stream for `id`, registering an idle one on first
    /// mention.
    pub(crate) fn get_or_create(&mut self, id: StreamId) -> usize {
        if let Some(&key) = self.ids.get(&id) {
            return key;
        }
        let key = self.arena.insert(Stream::new(id));
        self.ids.insert(id, key);
        tracing::trace!(id = u32::from(id), key, "registered stream");
        key
    }

    /// Drops a closed stream, splicing its children up to its parent.
    pub(crate) fn remove(&mut self, key: usize) {
        let (id, parent, children) = {
            let stream = &self.arena[key];
            (stream.id, stream.parent, stream.children.clone())
        };

        for &child in &children {
            self.arena[child].parent = parent;
        }
        if let Some(parent_key) = parent {
            let siblings = &mut self.arena[parent_key].children;
            siblings.retain(|&c| c != key);
            siblings.extend_from_slice(&children);
        }

        self.ids.remove(&id);
        self.arena.remove(key);
        tracing::trace!(id = u32::from(id), "removed stream");
    }

    /// Applies a PRIORITY (or HEADERS-carried) dependency update.
    ///
    /// If the proposed parent is currently a descendant of the child,
    /// the parent's subtree is first moved up to the child's old parent
    /// so the link below cannot form a cycle. The exclusive flag adopts
    /// the parent's remaining children under the child.
    pub(crate) fn set_priority(&mut self, key: usize, dependency: &StreamDependency) {
        self.arena[key].weight = dependency.weight;

        let new_parent = if dependency.dependency_id.is_zero() {
            None
        } else if dependency.dependency_id == self.arena[key].id {
            // Self-dependency is rejected at the frame layer; a stale
            // registry hit here keeps the old placement.
            return;
        } else {
            Some(self.get_or_create(dependency.dependency_id))
        };

        if let Some(parent_key) = new_parent
            && self.is_descendant(key, parent_key)
        {
            // Cycle repair: hoist the proposed parent to our old spot.
            let old_parent = self.arena[key].parent;
            self.unlink(parent_key);
            self.link(parent_key, old_parent);
        }

        self.unlink(key);
        self.link(key, new_parent);

        if dependency.is_exclusive
            && let Some(parent_key) = new_parent
        {
            let siblings: Vec<usize> = self.arena[parent_key]
                .children
                .iter()
                .copied()
                .filter(|&c| c != key)
                .collect();
            for sibling in siblings {
                self.unlink(sibling);
                self.link(sibling, Some(key));
            }
        }
    }

    /// True when `descendant` sits somewhere below `ancestor`.
    fn is_descendant(&self, ancestor: usize, descendant: usize) -> bool {
        let mut cursor = self.arena[descendant].parent;
        while let Some(key) = cursor {
            if key == ancestor {
                return true;
            }
            cursor = self.arena[key].parent;
        }
        false
    }

    fn unlink(&mut self, key: usize) {
        if let Some(parent) = self.arena[key].parent.take() {
            self.arena[parent].children.retain(|&c| c != key);
        }
    }

    fn link(&mut self, key: usize, parent: Option<usize>) {
        self.arena[key].parent = parent;
        if let Some(parent_key) = parent {
            self.arena[parent_key].children.push(key);
        }
    }
}
