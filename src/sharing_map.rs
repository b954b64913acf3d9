//! Persistent copy-on-write map with structural sharing.
//!
//! A [`SharingMap`] is a hash trie of reference-counted nodes. Cloning a map
//! copies only the root pointer; the first mutation of either copy
//! path-copies the nodes from the root down to the touched leaf, leaving all
//! other subtrees shared between the two maps.
//!
//! # Layout
//!
//! - **Inner nodes** fan out over 16 children, indexed by 4 bits of the key
//!   hash per level (low bits first).
//! - **Leaves** hold the full 64-bit hash and the entries with that hash
//!   (more than one only on a full hash collision).
//!
//! A node is never mutated while another map can reach it: mutation goes
//! through [`Rc::make_mut`], which clones a node whose reference count is
//! above one.
//!
//! # Delta views
//!
//! [`SharingMap::delta_view`] walks two maps side by side and skips every
//! pair of subtrees that are the same allocation. Two maps derived from one
//! another by a few updates are therefore compared in time proportional to
//! the number of differing nodes, not the number of keys.
//!
//! ```
//! use rd_sharing::sharing_map::SharingMap;
//!
//! let mut a = SharingMap::new();
//! for i in 0..1000u32 {
//!     a.insert(i, i);
//! }
//! let mut b = a.clone();
//! b.insert(5000, 0);
//!
//! let delta: Vec<_> = a.delta_view(&b, false).collect();
//! assert_eq!(delta.len(), 1);
//! assert_eq!(*delta[0].key, 5000);
//! assert!(!delta[0].in_both());
//! ```

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::ptr;
use std::rc::Rc;

use crate::types::Ternary;
use crate::utils::fx_hash;

const BITS: u32 = 4;
const FANOUT: usize = 1 << BITS;
const MASK: u64 = (FANOUT as u64) - 1;

/// Child index of `hash` in an inner node at `depth`.
fn slot(hash: u64, depth: u32) -> usize {
    debug_assert!(depth * BITS < u64::BITS, "trie depth {} out of range", depth);
    ((hash >> (depth * BITS)) & MASK) as usize
}

type Child<K, V> = Option<Rc<Node<K, V>>>;

#[derive(Clone)]
struct Inner<K, V> {
    children: [Child<K, V>; FANOUT],
}

impl<K, V> Inner<K, V> {
    fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| None),
        }
    }

    fn is_empty(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

#[derive(Clone)]
struct Leaf<K, V> {
    hash: u64,
    entries: Vec<(K, V)>,
}

impl<K, V> Leaf<K, V>
where
    K: Eq,
{
    fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or overwrite, returning the previous value.
    fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }
}

#[derive(Clone)]
enum Node<K, V> {
    Inner(Inner<K, V>),
    Leaf(Leaf<K, V>),
}

impl<K, V> Node<K, V> {
    fn leaf(hash: u64, key: K, value: V) -> Self {
        Node::Leaf(Leaf {
            hash,
            entries: vec![(key, value)],
        })
    }
}

/// Persistent map with O(1) copy and shared-subtree-aware diffing.
pub struct SharingMap<K, V> {
    root: Rc<Inner<K, V>>,
    len: usize,
}

impl<K, V> SharingMap<K, V> {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            root: Rc::new(Inner::new()),
            len: 0,
        }
    }

    /// Number of entries, kept up to date on every mutation.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove all entries. Other maps sharing nodes with this one are unaffected.
    pub fn clear(&mut self) {
        self.root = Rc::new(Inner::new());
        self.len = 0;
    }

    /// Exchange the contents of two maps in O(1).
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.root, &mut other.root);
        std::mem::swap(&mut self.len, &mut other.len);
    }

    /// Whether both maps hold the very same root node.
    ///
    /// Root identity implies equal contents; the converse does not hold.
    pub fn shares_root_with(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.root, &other.root)
    }

    /// Lazy sequence of all entries, in unspecified order.
    ///
    /// The map can be iterated any number of times.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let empty: &[(K, V)] = &[];
        Iter {
            stack: self.root.children.iter().flatten().map(|c| &**c).collect(),
            current: empty.iter(),
        }
    }

    /// All keys, in the order of [`iter`][Self::iter].
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }
}

impl<K, V> SharingMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Read-only lookup. Never copies a node.
    pub fn find(&self, key: &K) -> Option<&V> {
        let hash = fx_hash(key);
        let mut children = &self.root.children;
        let mut depth = 0;
        loop {
            match children[slot(hash, depth)].as_deref()? {
                Node::Inner(inner) => {
                    children = &inner.children;
                    depth += 1;
                }
                Node::Leaf(leaf) => {
                    if leaf.hash != hash {
                        return None;
                    }
                    return leaf.get(key);
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Mutable lookup. Path-copies the branch leading to `key` if it is
    /// shared; an absent key copies nothing.
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.contains_key(key) {
            return None;
        }
        let hash = fx_hash(key);
        let root = Rc::make_mut(&mut self.root);
        let child = root.children[slot(hash, 0)].as_mut()?;
        find_mut_in(child, hash, 1, key)
    }

    /// Insert or overwrite `key`. Returns whether the map changed.
    ///
    /// Overwriting a key with an equal value is not a change and copies nothing.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        self.insert_with_hint(key, value, Ternary::Unknown)
    }

    /// Like [`insert`][Self::insert], with a hint about whether `key` is
    /// already present.
    ///
    /// - `Ternary::False`: the caller knows the key is absent.
    /// - `Ternary::True`: the caller knows the key is present; the value is
    ///   overwritten and the call reports a change.
    /// - `Ternary::Unknown`: no knowledge, the map checks itself.
    ///
    /// A wrong hint is a caller bug (checked by debug assertions only).
    pub fn insert_with_hint(&mut self, key: K, value: V, key_exists: Ternary) -> bool {
        match key_exists {
            Ternary::Unknown => {
                if self.find(&key) == Some(&value) {
                    return false;
                }
            }
            Ternary::False => {
                debug_assert!(!self.contains_key(&key), "Key was hinted absent but is present");
            }
            Ternary::True => {
                debug_assert!(self.contains_key(&key), "Key was hinted present but is absent");
            }
        }

        let hash = fx_hash(&key);
        let root = Rc::make_mut(&mut self.root);
        let previous = insert_into(&mut root.children[slot(hash, 0)], hash, 1, key, value);
        if previous.is_none() {
            self.len += 1;
        }
        true
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// Only the branch leading to `key` is copied.
    pub fn erase(&mut self, key: &K) -> bool {
        if !self.contains_key(key) {
            return false;
        }
        let hash = fx_hash(key);
        let root = Rc::make_mut(&mut self.root);
        erase_from(&mut root.children[slot(hash, 0)], hash, 1, key);
        self.len -= 1;
        true
    }

    /// Lazy diff of `self` against `other`.
    ///
    /// Yields one entry per key that is present in exactly one of the maps
    /// or whose values differ. With `include_equal`, keys present in both
    /// with equal values are yielded as well, but only if they sit in
    /// subtrees the two maps do not share: shared subtrees are always skipped.
    pub fn delta_view<'a>(&'a self, other: &'a Self, include_equal: bool) -> DeltaView<'a, K, V> {
        let mut view = DeltaView {
            pending: Vec::new(),
            ready: VecDeque::new(),
            include_equal,
            visited: 0,
        };
        if !self.shares_root_with(other) {
            view.push_children(&self.root.children, &other.root.children, 1);
        }
        view
    }
}

fn find_mut_in<'a, K, V>(node: &'a mut Rc<Node<K, V>>, hash: u64, depth: u32, key: &K) -> Option<&'a mut V>
where
    K: Eq + Clone,
    V: Clone,
{
    match Rc::make_mut(node) {
        Node::Inner(inner) => {
            let child = inner.children[slot(hash, depth)].as_mut()?;
            find_mut_in(child, hash, depth + 1, key)
        }
        Node::Leaf(leaf) => leaf.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
    }
}

/// Insert into the subtree hanging off `child`, whose inner nodes (if any)
/// dispatch on `slot(hash, depth)`.
fn insert_into<K, V>(child: &mut Child<K, V>, hash: u64, depth: u32, key: K, value: V) -> Option<V>
where
    K: Eq + Clone,
    V: Clone,
{
    let Some(node) = child else {
        *child = Some(Rc::new(Node::leaf(hash, key, value)));
        return None;
    };

    // A leaf with another hash is pushed one level down, as is: it stays
    // shared with every other map that references it.
    let split_hash = match &**node {
        Node::Leaf(leaf) if leaf.hash != hash => Some(leaf.hash),
        _ => None,
    };
    if let Some(existing_hash) = split_hash {
        let mut inner = Inner::new();
        inner.children[slot(existing_hash, depth)] = Some(Rc::clone(node));
        *node = Rc::new(Node::Inner(inner));
    }

    match Rc::make_mut(node) {
        Node::Inner(inner) => insert_into(&mut inner.children[slot(hash, depth)], hash, depth + 1, key, value),
        Node::Leaf(leaf) => leaf.insert(key, value),
    }
}

fn erase_from<K, V>(child: &mut Child<K, V>, hash: u64, depth: u32, key: &K)
where
    K: Eq + Clone,
    V: Clone,
{
    let Some(node) = child else {
        return;
    };

    match Rc::make_mut(node) {
        Node::Leaf(leaf) => {
            leaf.entries.retain(|(k, _)| k != key);
            if leaf.entries.is_empty() {
                *child = None;
            }
        }
        Node::Inner(inner) => {
            erase_from(&mut inner.children[slot(hash, depth)], hash, depth + 1, key);

            // Collapse an inner node left with a single leaf.
            let mut live = inner.children.iter().flatten();
            let single_leaf = match (live.next(), live.next()) {
                (Some(only), None) if matches!(**only, Node::Leaf(_)) => Some(Rc::clone(only)),
                _ => None,
            };
            if inner.is_empty() {
                *child = None;
            } else if let Some(leaf) = single_leaf {
                *child = Some(leaf);
            }
        }
    }
}

impl<K, V> Clone for SharingMap<K, V> {
    /// O(1): the copy shares every node with `self`.
    fn clone(&self) -> Self {
        Self {
            root: Rc::clone(&self.root),
            len: self.len,
        }
    }
}

impl<K, V> Default for SharingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for SharingMap<K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> PartialEq for SharingMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.shares_root_with(other) || (self.len == other.len && self.delta_view(other, false).next().is_none())
    }
}

impl<K, V> Eq for SharingMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Eq,
{
}

impl<'a, K, V> IntoIterator for &'a SharingMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for SharingMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = SharingMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Iterator over all entries of a [`SharingMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    current: std::slice::Iter<'a, (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((k, v)) = self.current.next() {
                return Some((k, v));
            }
            match self.stack.pop()? {
                Node::Leaf(leaf) => self.current = leaf.entries.iter(),
                Node::Inner(inner) => self.stack.extend(inner.children.iter().flatten().map(|c| &**c)),
            }
        }
    }
}

/// One key of a [`DeltaView`].
#[derive(Debug)]
pub struct DeltaEntry<'a, K, V> {
    pub key: &'a K,
    /// Value in the map the view was taken from.
    pub value: Option<&'a V>,
    /// Value in the map it was compared against.
    pub other_value: Option<&'a V>,
}

impl<K, V> DeltaEntry<'_, K, V> {
    pub fn in_both(&self) -> bool {
        self.value.is_some() && self.other_value.is_some()
    }
}

enum Pending<'a, K, V> {
    /// Two differing subtrees at the same position; inner nodes dispatch on
    /// `slot(_, depth)`.
    Both(&'a Node<K, V>, &'a Node<K, V>, u32),
    Left(&'a Node<K, V>),
    Right(&'a Node<K, V>),
}

/// Lazy diff of two [`SharingMap`]s, see [`SharingMap::delta_view`].
pub struct DeltaView<'a, K, V> {
    pending: Vec<Pending<'a, K, V>>,
    ready: VecDeque<DeltaEntry<'a, K, V>>,
    include_equal: bool,
    visited: usize,
}

impl<'a, K, V> DeltaView<'a, K, V>
where
    K: Eq,
    V: PartialEq,
{
    /// Number of leaf entries examined so far.
    ///
    /// Entries inside shared subtrees are never examined.
    pub fn visited(&self) -> usize {
        self.visited
    }

    fn push_children(&mut self, left: &'a [Child<K, V>; FANOUT], right: &'a [Child<K, V>; FANOUT], depth: u32) {
        for (l, r) in left.iter().zip(right.iter()) {
            match (l, r) {
                (Some(l), Some(r)) => {
                    if !Rc::ptr_eq(l, r) {
                        self.pending.push(Pending::Both(&**l, &**r, depth));
                    }
                }
                (Some(l), None) => self.pending.push(Pending::Left(&**l)),
                (None, Some(r)) => self.pending.push(Pending::Right(&**r)),
                (None, None) => {}
            }
        }
    }

    /// Pair a leaf with the matching child of an inner node, all other
    /// children of the inner node being one-sided.
    fn expand(&mut self, leaf_node: &'a Node<K, V>, leaf_hash: u64, inner: &'a Inner<K, V>, depth: u32, leaf_is_left: bool) {
        let target = slot(leaf_hash, depth);
        for (i, child) in inner.children.iter().enumerate() {
            match child {
                Some(c) if i == target => {
                    if !ptr::eq(leaf_node, &**c) {
                        let pair = if leaf_is_left {
                            Pending::Both(leaf_node, &**c, depth + 1)
                        } else {
                            Pending::Both(&**c, leaf_node, depth + 1)
                        };
                        self.pending.push(pair);
                    }
                }
                Some(c) => self.pending.push(if leaf_is_left { Pending::Right(&**c) } else { Pending::Left(&**c) }),
                None if i == target => self.pending.push(if leaf_is_left {
                    Pending::Left(leaf_node)
                } else {
                    Pending::Right(leaf_node)
                }),
                None => {}
            }
        }
    }

    fn compare_leaves(&mut self, left: &'a Leaf<K, V>, right: &'a Leaf<K, V>) {
        for (k, v) in &left.entries {
            self.visited += 1;
            match right.get(k) {
                Some(other) => {
                    if self.include_equal || v != other {
                        self.ready.push_back(DeltaEntry {
                            key: k,
                            value: Some(v),
                            other_value: Some(other),
                        });
                    }
                }
                None => self.ready.push_back(DeltaEntry {
                    key: k,
                    value: Some(v),
                    other_value: None,
                }),
            }
        }
        for (k, other) in &right.entries {
            if left.get(k).is_none() {
                self.visited += 1;
                self.ready.push_back(DeltaEntry {
                    key: k,
                    value: None,
                    other_value: Some(other),
                });
            }
        }
    }

    fn one_sided(&mut self, node: &'a Node<K, V>, is_left: bool) {
        match node {
            Node::Leaf(leaf) => {
                for (k, v) in &leaf.entries {
                    self.visited += 1;
                    let (value, other_value) = if is_left { (Some(v), None) } else { (None, Some(v)) };
                    self.ready.push_back(DeltaEntry { key: k, value, other_value });
                }
            }
            Node::Inner(inner) => {
                for c in inner.children.iter().flatten() {
                    self.pending.push(if is_left { Pending::Left(&**c) } else { Pending::Right(&**c) });
                }
            }
        }
    }

    fn process(&mut self, pending: Pending<'a, K, V>) {
        match pending {
            Pending::Both(l, r, depth) => match (l, r) {
                (Node::Inner(li), Node::Inner(ri)) => self.push_children(&li.children, &ri.children, depth + 1),
                (Node::Leaf(ll), Node::Leaf(rl)) => self.compare_leaves(ll, rl),
                (Node::Leaf(ll), Node::Inner(ri)) => self.expand(l, ll.hash, ri, depth, true),
                (Node::Inner(li), Node::Leaf(rl)) => self.expand(r, rl.hash, li, depth, false),
            },
            Pending::Left(node) => self.one_sided(node, true),
            Pending::Right(node) => self.one_sided(node, false),
        }
    }
}

impl<'a, K, V> Iterator for DeltaView<'a, K, V>
where
    K: Eq,
    V: PartialEq,
{
    type Item = DeltaEntry<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(entry);
            }
            let pending = self.pending.pop()?;
            self.process(pending);
        }
    }
}
