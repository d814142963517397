//! Typed key/value map stored as a byte-trie inside a pool
//!
//! Every node and out-of-line value lives in the pool and is referenced by
//! pool offset, so any attached process sees the same live tree. One trie
//! level corresponds to one key byte; there is no edge compression.
//!
//! # Slot encoding
//!
//! A child-table slot is a single `u64` whose low 3 bits are a tag:
//! subnode offset (`0` doubles as the empty slot), inline int, boxed int,
//! string, boxed double, or trivial (null/false/true). Offsets are 8-aligned
//! so the tag bits are free. A leaf key's value therefore lives directly in
//! its parent's slot and no node is allocated for it; a node of its own
//! appears only once the key gains descendants (promotion) and disappears
//! again when they go away (demotion). A node's own value word uses the
//! same encoding, with 0 meaning no value.
//!
//! # Writer discipline
//!
//! Mutations are published with a single word store: new nodes, chains, and
//! value boxes are fully built unpublished, then attached by one slot (or
//! root-offset) write. A reader walking concurrently sees either the old or
//! the new structure, never a half-initialized one. Write exclusivity is
//! external; this type is `!Sync` like everything above the pool.

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::pool::Pool;
use log::debug;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOT_TAG_MASK: u64 = 0b111;
const TAG_SUBNODE: u64 = 0b000;
const TAG_INLINE_INT: u64 = 0b001;
const TAG_BOXED_INT: u64 = 0b010;
const TAG_STRING: u64 = 0b011;
const TAG_BOXED_DOUBLE: u64 = 0b100;
const TAG_TRIVIAL: u64 = 0b101;

const TRIVIAL_NULL: u64 = 0;
const TRIVIAL_FALSE: u64 = 1;
const TRIVIAL_TRUE: u64 = 2;

/// Pool-resident tree base, registered as the allocator's base object.
#[repr(C)]
struct TreeBase {
    /// Number of keys present (values that are not missing).
    item_count: AtomicU64,
    /// Number of live nodes, root included.
    node_count: AtomicU64,
    root_offset: AtomicU64,
}

const TREE_BASE_SIZE: u64 = std::mem::size_of::<TreeBase>() as u64;

/// Node header, followed by `count` slot words covering child bytes
/// `start .. start + count`. `start` and `count` are fixed for the life of
/// the node; range changes reallocate the node and republish its offset.
#[repr(C)]
struct NodeHeader {
    value: AtomicU64,
    start: u16,
    count: u16,
    _pad: u32,
}

const NODE_HEADER_SIZE: u64 = std::mem::size_of::<NodeHeader>() as u64;

/// Discriminator for the value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// No value stored (absent key, or interior node without a value)
    Missing,
    Null,
    Bool,
    Int,
    Double,
    String,
}

/// A value stored in (or read from) the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Vec<u8>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(s: &[u8]) -> Self {
        Value::String(s.to_vec())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Where an existing value word lives.
enum Location {
    RootValue,
    NodeValue(u64),
    Slot(u64, u8),
}

/// Typed map over byte-string keys. See the module docs.
pub struct PrefixTree {
    allocator: Rc<dyn Allocator>,
    base_offset: u64,
}

impl PrefixTree {
    /// Attach to (or create) the tree whose base lives at `base_offset`.
    ///
    /// Passing 0 uses the allocator's registered base object, creating and
    /// registering a fresh empty tree when none exists yet.
    pub fn attach(allocator: Rc<dyn Allocator>, base_offset: u64) -> Result<Self> {
        let mut base = base_offset;
        if base == 0 {
            base = allocator.base_object_offset();
        }
        if base == 0 {
            base = allocator.allocate(TREE_BASE_SIZE)?;
            let tree = Self {
                allocator: Rc::clone(&allocator),
                base_offset: base,
            };
            let root = match tree.alloc_node(0, 0, 0, &[]) {
                Ok(root) => root,
                Err(e) => {
                    allocator.free(base);
                    return Err(e);
                }
            };
            unsafe {
                std::ptr::write(
                    tree.pool().at::<TreeBase>(base),
                    TreeBase {
                        item_count: AtomicU64::new(0),
                        node_count: AtomicU64::new(1),
                        root_offset: AtomicU64::new(root),
                    },
                );
            }
            allocator.set_base_object_offset(base);
            debug!("created prefix tree at offset {base}");
            return Ok(tree);
        }
        Ok(Self {
            allocator,
            base_offset: base,
        })
    }

    /// The allocator this tree allocates from.
    pub fn allocator(&self) -> &Rc<dyn Allocator> {
        &self.allocator
    }

    fn pool(&self) -> &Rc<Pool> {
        self.allocator.pool()
    }

    fn base(&self) -> &TreeBase {
        unsafe { &*self.pool().at::<TreeBase>(self.base_offset) }
    }

    fn root(&self) -> u64 {
        self.base().root_offset.load(Ordering::Acquire)
    }

    /// Number of keys present.
    pub fn len(&self) -> u64 {
        self.base().item_count.load(Ordering::Relaxed)
    }

    /// Whether no keys are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live nodes, root included.
    pub fn node_size(&self) -> u64 {
        self.base().node_count.load(Ordering::Relaxed)
    }

    // ---- node primitives ----

    fn node_range(&self, node: u64) -> (u16, u16) {
        let hdr = unsafe { &*self.pool().at::<NodeHeader>(node) };
        (hdr.start, hdr.count)
    }

    fn node_value(&self, node: u64) -> u64 {
        unsafe { &(*self.pool().at::<NodeHeader>(node)).value }.load(Ordering::Acquire)
    }

    fn set_node_value(&self, node: u64, word: u64) {
        unsafe { &(*self.pool().at::<NodeHeader>(node)).value }.store(word, Ordering::Release);
    }

    fn slot_offset(&self, node: u64, byte: u8) -> Option<u64> {
        let (start, count) = self.node_range(node);
        let b = byte as u16;
        if b < start || b >= start + count {
            return None;
        }
        Some(node + NODE_HEADER_SIZE + 8 * (b - start) as u64)
    }

    fn slot_load(&self, node: u64, byte: u8) -> u64 {
        match self.slot_offset(node, byte) {
            Some(off) => {
                unsafe { &*(self.pool().at::<AtomicU64>(off)) }.load(Ordering::Acquire)
            }
            None => 0,
        }
    }

    fn slot_store(&self, node: u64, byte: u8, word: u64) {
        let off = self
            .slot_offset(node, byte)
            .expect("slot byte outside node range");
        unsafe { &*(self.pool().at::<AtomicU64>(off)) }.store(word, Ordering::Release);
    }

    fn child_count(&self, node: u64) -> usize {
        let (start, count) = self.node_range(node);
        let mut n = 0;
        for b in start..start + count {
            if self.slot_load(node, b as u8) != 0 {
                n += 1;
            }
        }
        n
    }

    /// First occupied slot at or after `from`, as `(byte, word)`.
    fn scan_slots(&self, node: u64, from: u16) -> Option<(u8, u64)> {
        let (start, count) = self.node_range(node);
        for b in from.max(start)..start + count {
            let word = self.slot_load(node, b as u8);
            if word != 0 {
                return Some((b as u8, word));
            }
        }
        None
    }

    /// Allocate and fully initialize a node without publishing it.
    fn alloc_node(&self, value: u64, start: u16, count: u16, slots: &[(u8, u64)]) -> Result<u64> {
        let size = NODE_HEADER_SIZE + 8 * count as u64;
        let off = self.allocator.allocate(size)?;
        unsafe {
            std::ptr::write(
                self.pool().at::<NodeHeader>(off),
                NodeHeader {
                    value: AtomicU64::new(value),
                    start,
                    count,
                    _pad: 0,
                },
            );
            std::ptr::write_bytes(
                self.pool().at_bytes(off + NODE_HEADER_SIZE, 8 * count as u64),
                0,
                8 * count as usize,
            );
            for &(byte, word) in slots {
                let slot = off + NODE_HEADER_SIZE + 8 * (byte as u16 - start) as u64;
                *self.pool().at::<u64>(slot) = word;
            }
        }
        Ok(off)
    }

    fn free_node(&self, node: u64) {
        self.allocator.free(node);
    }

    /// Reallocate `node` with its range extended to cover `byte`, setting
    /// that slot to `word`, and publish the replacement with a single store
    /// into the parent slot (or the root offset). Returns the new offset.
    fn grow_node(&self, node: u64, parent: Option<(u64, u8)>, byte: u8, word: u64) -> Result<u64> {
        let (start, count) = self.node_range(node);
        let b = byte as u16;
        let (new_start, new_end) = if count == 0 {
            (b, b + 1)
        } else {
            (start.min(b), (start + count).max(b + 1))
        };
        let new_count = new_end - new_start;

        let value = self.node_value(node);
        let replacement = self.alloc_node(value, new_start, new_count, &[(byte, word)])?;
        for old_b in start..start + count {
            let old_word = self.slot_load(node, old_b as u8);
            if old_word != 0 {
                let slot =
                    replacement + NODE_HEADER_SIZE + 8 * (old_b - new_start) as u64;
                unsafe { *self.pool().at::<u64>(slot) = old_word };
            }
        }

        match parent {
            Some((parent_node, parent_byte)) => {
                self.slot_store(parent_node, parent_byte, replacement)
            }
            None => self.base().root_offset.store(replacement, Ordering::Release),
        }
        self.free_node(node);
        Ok(replacement)
    }

    // ---- value encoding ----

    fn value_type_of(word: u64) -> ValueType {
        if word == 0 {
            return ValueType::Missing;
        }
        match word & SLOT_TAG_MASK {
            TAG_INLINE_INT | TAG_BOXED_INT => ValueType::Int,
            TAG_BOXED_DOUBLE => ValueType::Double,
            TAG_STRING => ValueType::String,
            TAG_TRIVIAL => {
                if word >> 3 == TRIVIAL_NULL {
                    ValueType::Null
                } else {
                    ValueType::Bool
                }
            }
            _ => ValueType::Missing,
        }
    }

    fn int_fits_inline(v: i64) -> bool {
        v >> 60 == 0 || v >> 60 == -1
    }

    /// Encode a value into a slot word, allocating backing storage for the
    /// out-of-line variants. Nothing is published; on a later failure the
    /// caller releases the storage with [`free_value`](Self::free_value).
    fn encode_value(&self, value: &Value) -> Result<u64> {
        Ok(match value {
            Value::Null => TAG_TRIVIAL | (TRIVIAL_NULL << 3),
            Value::Bool(false) => TAG_TRIVIAL | (TRIVIAL_FALSE << 3),
            Value::Bool(true) => TAG_TRIVIAL | (TRIVIAL_TRUE << 3),
            Value::Int(v) if Self::int_fits_inline(*v) => ((*v as u64) << 3) | TAG_INLINE_INT,
            Value::Int(v) => {
                let off = self.allocator.allocate(8)?;
                unsafe { *self.pool().at::<i64>(off) = *v };
                off | TAG_BOXED_INT
            }
            Value::Double(v) => {
                let off = self.allocator.allocate(8)?;
                unsafe { *self.pool().at::<u64>(off) = v.to_bits() };
                off | TAG_BOXED_DOUBLE
            }
            Value::String(s) => {
                let off = self.allocator.allocate(8 + s.len() as u64)?;
                unsafe {
                    *self.pool().at::<u64>(off) = s.len() as u64;
                    std::ptr::copy_nonoverlapping(
                        s.as_ptr(),
                        self.pool().at_bytes(off + 8, s.len() as u64),
                        s.len(),
                    );
                }
                off | TAG_STRING
            }
        })
    }

    fn decode_value(&self, word: u64) -> Value {
        match word & SLOT_TAG_MASK {
            TAG_INLINE_INT => Value::Int((word as i64) >> 3),
            TAG_BOXED_INT => Value::Int(unsafe { *self.pool().at::<i64>(word & !SLOT_TAG_MASK) }),
            TAG_BOXED_DOUBLE => Value::Double(f64::from_bits(unsafe {
                *self.pool().at::<u64>(word & !SLOT_TAG_MASK)
            })),
            TAG_STRING => {
                let off = word & !SLOT_TAG_MASK;
                let len = unsafe { *self.pool().at::<u64>(off) };
                let mut bytes = vec![0u8; len as usize];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.pool().at_bytes(off + 8, len),
                        bytes.as_mut_ptr(),
                        len as usize,
                    );
                }
                Value::String(bytes)
            }
            TAG_TRIVIAL => match word >> 3 {
                TRIVIAL_FALSE => Value::Bool(false),
                TRIVIAL_TRUE => Value::Bool(true),
                _ => Value::Null,
            },
            _ => Value::Null,
        }
    }

    /// Release the backing storage of an unpublished or superseded value.
    fn free_value(&self, word: u64) {
        match word & SLOT_TAG_MASK {
            TAG_BOXED_INT | TAG_BOXED_DOUBLE | TAG_STRING => {
                self.allocator.free(word & !SLOT_TAG_MASK)
            }
            _ => {}
        }
    }

    // ---- lookups ----

    /// Value word stored under `key`, or 0 when the key is absent.
    fn lookup_word(&self, key: &[u8]) -> u64 {
        let root = self.root();
        if key.is_empty() {
            return self.node_value(root);
        }
        let mut node = root;
        for &b in &key[..key.len() - 1] {
            let slot = self.slot_load(node, b);
            if slot == 0 || slot & SLOT_TAG_MASK != TAG_SUBNODE {
                return 0;
            }
            node = slot;
        }
        let slot = self.slot_load(node, key[key.len() - 1]);
        if slot != 0 && slot & SLOT_TAG_MASK == TAG_SUBNODE {
            return self.node_value(slot);
        }
        slot
    }

    /// Look up the value under `key`. Fails with [`Error::KeyNotFound`] when
    /// the key is absent or has no value.
    pub fn at(&self, key: &[u8]) -> Result<Value> {
        let word = self.lookup_word(key);
        if word == 0 {
            return Err(Error::KeyNotFound);
        }
        Ok(self.decode_value(word))
    }

    /// Type of the value under `key`; `Missing` for absent keys.
    pub fn value_type(&self, key: &[u8]) -> ValueType {
        Self::value_type_of(self.lookup_word(key))
    }

    /// Whether `key` has a value.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.lookup_word(key) != 0
    }

    /// Existing location of the value word for `key`, if the path exists.
    fn locate(&self, key: &[u8]) -> Option<(Location, u64)> {
        if key.is_empty() {
            let root = self.root();
            return Some((Location::RootValue, self.node_value(root)));
        }
        let mut node = self.root();
        for &b in &key[..key.len() - 1] {
            let slot = self.slot_load(node, b);
            if slot == 0 || slot & SLOT_TAG_MASK != TAG_SUBNODE {
                return None;
            }
            node = slot;
        }
        let last = key[key.len() - 1];
        let slot = self.slot_load(node, last);
        if slot != 0 && slot & SLOT_TAG_MASK == TAG_SUBNODE {
            Some((Location::NodeValue(slot), self.node_value(slot)))
        } else {
            Some((Location::Slot(node, last), slot))
        }
    }

    fn store_at(&self, location: &Location, word: u64) {
        match *location {
            Location::RootValue => self.set_node_value(self.root(), word),
            Location::NodeValue(node) => self.set_node_value(node, word),
            Location::Slot(node, byte) => self.slot_store(node, byte, word),
        }
    }

    // ---- mutations ----

    /// Insert or replace the value under `key`.
    ///
    /// Every allocation happens before anything becomes reachable; a failed
    /// insert releases its intermediate allocations and leaves the tree
    /// exactly as it was.
    pub fn insert(&self, key: &[u8], value: Value) -> Result<()> {
        if key.is_empty() {
            let encoded = self.encode_value(&value)?;
            let root = self.root();
            let old = self.node_value(root);
            self.set_node_value(root, encoded);
            if old == 0 {
                self.base().item_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.free_value(old);
            }
            return Ok(());
        }

        // Walk the existing path as far as it goes.
        let interior = &key[..key.len() - 1];
        let mut node = self.root();
        let mut parent: Option<(u64, u8)> = None;
        let mut depth = 0;
        while depth < interior.len() {
            let slot = self.slot_load(node, interior[depth]);
            if slot != 0 && slot & SLOT_TAG_MASK == TAG_SUBNODE {
                parent = Some((node, interior[depth]));
                node = slot;
                depth += 1;
            } else {
                break;
            }
        }
        let last = key[key.len() - 1];

        if depth == interior.len() {
            // The parent node of the terminal byte exists.
            let slot = self.slot_load(node, last);
            if slot != 0 && slot & SLOT_TAG_MASK == TAG_SUBNODE {
                let encoded = self.encode_value(&value)?;
                let old = self.node_value(slot);
                self.set_node_value(slot, encoded);
                if old == 0 {
                    self.base().item_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.free_value(old);
                }
                return Ok(());
            }
            let encoded = self.encode_value(&value)?;
            if self.slot_offset(node, last).is_some() {
                self.slot_store(node, last, encoded);
            } else if let Err(e) = self.grow_node(node, parent, last, encoded) {
                self.free_value(encoded);
                return Err(e);
            }
            if slot == 0 {
                self.base().item_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.free_value(slot);
            }
            return Ok(());
        }

        // The path ends early: build the missing chain bottom-up, fully
        // initialized but unreachable, then attach it with one store. If the
        // slot where the chain attaches holds an immediate value, that key
        // is promoted into the chain's top node.
        let encoded = self.encode_value(&value)?;
        let promoted = self.slot_load(node, interior[depth]);

        let mut created: Vec<u64> = Vec::with_capacity(interior.len() - depth);
        let mut child = 0u64;
        let mut failure = None;
        for i in (depth..interior.len()).rev() {
            let (byte, word) = if i == interior.len() - 1 {
                (last, encoded)
            } else {
                (interior[i + 1], child)
            };
            let value_word = if i == depth { promoted } else { 0 };
            match self.alloc_node(value_word, byte as u16, 1, &[(byte, word)]) {
                Ok(off) => {
                    created.push(off);
                    child = off;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() && self.slot_offset(node, interior[depth]).is_none() {
            if let Err(e) = self.grow_node(node, parent, interior[depth], child) {
                failure = Some(e);
            }
        } else if failure.is_none() {
            self.slot_store(node, interior[depth], child);
        }
        if let Some(e) = failure {
            for off in created {
                self.free_node(off);
            }
            self.free_value(encoded);
            return Err(e);
        }

        let base = self.base();
        base.node_count
            .fetch_add(created.len() as u64, Ordering::Relaxed);
        base.item_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Clear the value under `key`, pruning any nodes left with nothing to
    /// say. Returns whether a value was actually cleared.
    pub fn erase(&self, key: &[u8]) -> bool {
        if key.is_empty() {
            let root = self.root();
            let old = self.node_value(root);
            if old == 0 {
                return false;
            }
            self.set_node_value(root, 0);
            self.free_value(old);
            self.base().item_count.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        // path[i] is the node for key[..i].
        let mut path = Vec::with_capacity(key.len());
        let mut node = self.root();
        for &b in &key[..key.len() - 1] {
            path.push(node);
            let slot = self.slot_load(node, b);
            if slot == 0 || slot & SLOT_TAG_MASK != TAG_SUBNODE {
                return false;
            }
            node = slot;
        }
        path.push(node);
        let last = key[key.len() - 1];
        let slot = self.slot_load(node, last);
        if slot == 0 {
            return false;
        }

        if slot & SLOT_TAG_MASK == TAG_SUBNODE {
            // The key has descendants; only its value goes away.
            let old = self.node_value(slot);
            if old == 0 {
                return false;
            }
            self.set_node_value(slot, 0);
            self.free_value(old);
            self.base().item_count.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        self.slot_store(node, last, 0);
        self.free_value(slot);
        self.base().item_count.fetch_sub(1, Ordering::Relaxed);
        self.prune(&path, key);
        true
    }

    /// Walk back up after a slot was cleared, removing nodes that no longer
    /// justify their existence: a valueless childless node disappears, a
    /// childless node with a value demotes it into the parent slot, and a
    /// root left without children is reallocated with an empty table.
    fn prune(&self, path: &[u64], key: &[u8]) {
        let mut i = path.len() - 1;
        loop {
            let node = path[i];
            if i == 0 {
                let (_, count) = self.node_range(node);
                if count > 0 && self.child_count(node) == 0 {
                    let value = self.node_value(node);
                    if let Ok(replacement) = self.alloc_node(value, 0, 0, &[]) {
                        self.base()
                            .root_offset
                            .store(replacement, Ordering::Release);
                        self.free_node(node);
                    }
                }
                return;
            }
            if self.child_count(node) > 0 {
                return;
            }
            let parent = path[i - 1];
            let byte = key[i - 1];
            let value = self.node_value(node);
            if value != 0 {
                // Childless but valued: the value moves back into the
                // parent's slot and the node goes away.
                self.slot_store(parent, byte, value);
                self.free_node(node);
                self.base().node_count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            self.slot_store(parent, byte, 0);
            self.free_node(node);
            self.base().node_count.fetch_sub(1, Ordering::Relaxed);
            i -= 1;
        }
    }

    /// Add `delta` to the integer under `key`, creating the key when absent.
    /// Wraps in two's complement. Fails with
    /// [`Error::TypeMismatch`] when a value of another type is present.
    pub fn incr_int(&self, key: &[u8], delta: i64) -> Result<i64> {
        if let Some((location, word)) = self.locate(key) {
            if word != 0 {
                return match word & SLOT_TAG_MASK {
                    TAG_INLINE_INT => {
                        let new = ((word as i64) >> 3).wrapping_add(delta);
                        if Self::int_fits_inline(new) {
                            self.store_at(&location, ((new as u64) << 3) | TAG_INLINE_INT);
                        } else {
                            let off = self.allocator.allocate(8)?;
                            unsafe { *self.pool().at::<i64>(off) = new };
                            self.store_at(&location, off | TAG_BOXED_INT);
                        }
                        Ok(new)
                    }
                    TAG_BOXED_INT => {
                        let off = word & !SLOT_TAG_MASK;
                        let new = unsafe { *self.pool().at::<i64>(off) }.wrapping_add(delta);
                        unsafe { *self.pool().at::<i64>(off) = new };
                        Ok(new)
                    }
                    _ => Err(Error::TypeMismatch {
                        expected: ValueType::Int,
                        found: Self::value_type_of(word),
                    }),
                };
            }
        }
        self.insert(key, Value::Int(delta))?;
        Ok(delta)
    }

    /// Add `delta` to the double under `key`, creating the key when absent.
    /// Fails with [`Error::TypeMismatch`] when a value of another type is
    /// present; ints and doubles do not cross-convert.
    pub fn incr_double(&self, key: &[u8], delta: f64) -> Result<f64> {
        if let Some((_, word)) = self.locate(key) {
            if word != 0 {
                return match word & SLOT_TAG_MASK {
                    TAG_BOXED_DOUBLE => {
                        let off = word & !SLOT_TAG_MASK;
                        let new = f64::from_bits(unsafe { *self.pool().at::<u64>(off) }) + delta;
                        unsafe { *self.pool().at::<u64>(off) = new.to_bits() };
                        Ok(new)
                    }
                    _ => Err(Error::TypeMismatch {
                        expected: ValueType::Double,
                        found: Self::value_type_of(word),
                    }),
                };
            }
        }
        self.insert(key, Value::Double(delta))?;
        Ok(delta)
    }

    /// Remove every key, returning the tree to its freshly-created state.
    pub fn clear(&self) -> Result<()> {
        let root = self.root();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let (start, count) = self.node_range(node);
            for b in start..start + count {
                let word = self.slot_load(node, b as u8);
                if word == 0 {
                    continue;
                }
                if word & SLOT_TAG_MASK == TAG_SUBNODE {
                    stack.push(word);
                } else {
                    self.free_value(word);
                }
            }
            self.free_value(self.node_value(node));
            self.free_node(node);
        }

        let replacement = self.alloc_node(0, 0, 0, &[])?;
        let base = self.base();
        base.root_offset.store(replacement, Ordering::Release);
        base.item_count.store(0, Ordering::Relaxed);
        base.node_count.store(1, Ordering::Relaxed);
        debug!("cleared prefix tree at offset {}", self.base_offset);
        Ok(())
    }

    // ---- iteration ----

    /// Smallest entry in the subtree rooted at `node`, whose path from the
    /// tree root spells `path`.
    fn min_entry(&self, mut node: u64, mut path: Vec<u8>) -> Option<(Vec<u8>, Value)> {
        loop {
            let word = self.node_value(node);
            if word != 0 {
                return Some((path, self.decode_value(word)));
            }
            let (byte, slot) = self.scan_slots(node, 0)?;
            path.push(byte);
            if slot & SLOT_TAG_MASK != TAG_SUBNODE {
                return Some((path, self.decode_value(slot)));
            }
            node = slot;
        }
    }

    /// Smallest key strictly greater than `after` (or the smallest key
    /// overall when `after` is `None`), with its value.
    fn next_entry(&self, after: Option<&[u8]>) -> Option<(Vec<u8>, Value)> {
        let root = self.root();
        let key = match after {
            None => return self.min_entry(root, Vec::new()),
            Some(key) => key,
        };

        // Descend along the key while subnodes exist; nodes[i] covers
        // key[..i].
        let mut nodes = vec![root];
        while nodes.len() <= key.len() {
            let i = nodes.len() - 1;
            let slot = self.slot_load(nodes[i], key[i]);
            if slot != 0 && slot & SLOT_TAG_MASK == TAG_SUBNODE {
                nodes.push(slot);
            } else {
                break;
            }
        }

        // If the whole key resolved to a node, the smallest strictly-greater
        // key lives below it.
        if nodes.len() == key.len() + 1 {
            let node = nodes[key.len()];
            if let Some((byte, slot)) = self.scan_slots(node, 0) {
                let mut path = key.to_vec();
                path.push(byte);
                if slot & SLOT_TAG_MASK != TAG_SUBNODE {
                    return Some((path, self.decode_value(slot)));
                }
                return self.min_entry(slot, path);
            }
        }

        // Backtrack: at each level, try slots after the key byte.
        for depth in (0..nodes.len().min(key.len())).rev() {
            let from = key[depth] as u16 + 1;
            if let Some((byte, slot)) = self.scan_slots(nodes[depth], from) {
                let mut path = key[..depth].to_vec();
                path.push(byte);
                if slot & SLOT_TAG_MASK != TAG_SUBNODE {
                    return Some((path, self.decode_value(slot)));
                }
                return self.min_entry(slot, path);
            }
        }
        None
    }

    /// Iterate over `(key, value)` pairs in lexicographic byte order.
    ///
    /// Each step re-resolves the successor from the root, so the iterator
    /// holds no node addresses and stays coherent while a writer mutates
    /// the tree (it simply reflects whatever it finds at each step).
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            state: IterState::Start,
        }
    }
}

enum IterState {
    Start,
    After(Vec<u8>),
    Done,
}

/// Iterator over the tree in key order. See [`PrefixTree::iter`].
pub struct Iter<'a> {
    tree: &'a PrefixTree,
    state: IterState,
}

impl Iterator for Iter<'_> {
    type Item = (Vec<u8>, Value);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match &self.state {
            IterState::Start => self.tree.next_entry(None),
            IterState::After(key) => self.tree.next_entry(Some(key)),
            IterState::Done => None,
        };
        match entry {
            Some((key, value)) => {
                self.state = IterState::After(key.clone());
                Some((key, value))
            }
            None => {
                self.state = IterState::Done;
                None
            }
        }
    }
}
