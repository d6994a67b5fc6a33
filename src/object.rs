//! The polymorphic value stored against every key.
//!
//! An object is a sum type: each variant carries both the logical type and
//! the concrete encoding of its payload. Encodings only ever move from the
//! compact form to the general one (embstr to raw, packed hash to table,
//! intset to table), never back.
//!
//! Values live in the keyspace as `Arc<Object>`. Interned small integers
//! are handed out as clones of the shared table, so a write path that
//! needs to mutate calls `unshare` first and works on a private copy.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::dict::Dict;
use crate::packedlist::{try_parse_int, PackedList};
use crate::quicklist::Quicklist;

/// Strings up to this length embed in the compact immutable form.
pub const EMBSTR_LIMIT: usize = 44;

/// Small integers interned at startup and shared by refcount.
pub const SHARED_INTEGERS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    String,
    List,
    Hash,
    Set,
    ZSet,
    Stream,
    Module,
}

impl ObjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Hash => "hash",
            ObjectType::Set => "set",
            ObjectType::ZSet => "zset",
            ObjectType::Stream => "stream",
            ObjectType::Module => "module",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Int,
    Embstr,
    Raw,
    Quicklist,
    Listpack,
    HashTable,
    IntSet,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Int => "int",
            Encoding::Embstr => "embstr",
            Encoding::Raw => "raw",
            Encoding::Quicklist => "quicklist",
            Encoding::Listpack => "listpack",
            Encoding::HashTable => "hashtable",
            Encoding::IntSet => "intset",
        }
    }
}

/// Sorted, deduplicated set of integers: the compact set encoding.
#[derive(Debug, Clone, Default)]
pub struct IntSet {
    values: Vec<i64>,
}

impl IntSet {
    pub fn new() -> Self {
        IntSet { values: Vec::new() }
    }

    pub fn add(&mut self, v: i64) -> bool {
        match self.values.binary_search(&v) {
            Ok(_) => false,
            Err(pos) => {
                self.values.insert(pos, v);
                true
            }
        }
    }

    pub fn remove(&mut self, v: i64) -> bool {
        match self.values.binary_search(&v) {
            Ok(pos) => {
                self.values.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        self.values.binary_search(&v).is_ok()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.values.iter().copied()
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Int(i64),
    Embstr(Box<[u8]>),
    Raw(Vec<u8>),
    List(Quicklist),
    PackedHash(PackedList),
    TableHash(Dict<Vec<u8>>),
    IntSet(IntSet),
    TableSet(Dict<()>),
}

#[derive(Debug)]
pub struct Object {
    /// Seconds-resolution access stamp used by eviction accounting.
    lru: AtomicU32,
    payload: Payload,
}

impl Clone for Object {
    fn clone(&self) -> Self {
        Object {
            lru: AtomicU32::new(self.lru.load(Ordering::Relaxed)),
            payload: self.payload.clone(),
        }
    }
}

/// Per-type thresholds driving compact-to-general conversions.
#[derive(Debug, Clone, Copy)]
pub struct EncodingLimits {
    pub hash_max_entries: usize,
    pub hash_max_value: usize,
    pub set_max_intset_entries: usize,
}

impl Default for EncodingLimits {
    fn default() -> Self {
        EncodingLimits {
            hash_max_entries: 128,
            hash_max_value: 64,
            set_max_intset_entries: 512,
        }
    }
}

impl Object {
    fn with_payload(payload: Payload) -> Self {
        Object {
            lru: AtomicU32::new(0),
            payload,
        }
    }

    // -------------------------------------------------------- constructors

    /// Build a string object, applying the compact encodings: canonical
    /// integers become tagged ints, short strings embed.
    pub fn string_from(data: Vec<u8>) -> Self {
        match try_parse_int(&data) {
            Some(v) => Object::with_payload(Payload::Int(v)),
            None if data.len() <= EMBSTR_LIMIT => {
                Object::with_payload(Payload::Embstr(data.into_boxed_slice()))
            }
            None => Object::with_payload(Payload::Raw(data)),
        }
    }

    pub fn from_int(v: i64) -> Self {
        Object::with_payload(Payload::Int(v))
    }

    /// A raw string that skips compact encodings (append targets).
    pub fn raw_string_from(data: Vec<u8>) -> Self {
        Object::with_payload(Payload::Raw(data))
    }

    pub fn new_list(fill: i32, compress_depth: usize) -> Self {
        Object::with_payload(Payload::List(Quicklist::new(fill, compress_depth)))
    }

    pub fn new_hash() -> Self {
        Object::with_payload(Payload::PackedHash(PackedList::new()))
    }

    pub fn new_set() -> Self {
        Object::with_payload(Payload::IntSet(IntSet::new()))
    }

    // ----------------------------------------------------------- type tags

    pub fn otype(&self) -> ObjectType {
        match &self.payload {
            Payload::Int(_) | Payload::Embstr(_) | Payload::Raw(_) => ObjectType::String,
            Payload::List(_) => ObjectType::List,
            Payload::PackedHash(_) | Payload::TableHash(_) => ObjectType::Hash,
            Payload::IntSet(_) | Payload::TableSet(_) => ObjectType::Set,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.payload {
            Payload::Int(_) => Encoding::Int,
            Payload::Embstr(_) => Encoding::Embstr,
            Payload::Raw(_) => Encoding::Raw,
            Payload::List(_) => Encoding::Quicklist,
            Payload::PackedHash(_) => Encoding::Listpack,
            Payload::TableHash(_) => Encoding::HashTable,
            Payload::IntSet(_) => Encoding::IntSet,
            Payload::TableSet(_) => Encoding::HashTable,
        }
    }

    pub fn is_type(&self, t: ObjectType) -> bool {
        self.otype() == t
    }

    // ------------------------------------------------------------- strings

    /// Render any string encoding as bytes.
    pub fn string_bytes(&self) -> Cow<'_, [u8]> {
        match &self.payload {
            Payload::Int(v) => Cow::Owned(v.to_string().into_bytes()),
            Payload::Embstr(b) => Cow::Borrowed(b),
            Payload::Raw(b) => Cow::Borrowed(b),
            _ => panic!("string_bytes on a {} object", self.otype().name()),
        }
    }

    pub fn string_len(&self) -> usize {
        match &self.payload {
            Payload::Int(v) => v.to_string().len(),
            Payload::Embstr(b) => b.len(),
            Payload::Raw(b) => b.len(),
            _ => panic!("string_len on a {} object", self.otype().name()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.payload {
            Payload::Int(v) => Some(*v),
            Payload::Embstr(b) => try_parse_int(b),
            Payload::Raw(b) => try_parse_int(b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &self.payload {
            Payload::Int(v) => Some(*v as f64),
            Payload::Embstr(b) => parse_float(b),
            Payload::Raw(b) => parse_float(b),
            _ => None,
        }
    }

    /// Set a new integer value in place, keeping the int encoding.
    pub fn set_int(&mut self, v: i64) {
        debug_assert_eq!(self.otype(), ObjectType::String);
        self.payload = Payload::Int(v);
    }

    /// One-way transition to the general string form; embedded and integer
    /// strings convert before any in-place byte mutation.
    pub fn make_raw_string(&mut self) -> &mut Vec<u8> {
        match &mut self.payload {
            Payload::Raw(_) => {}
            Payload::Int(v) => {
                self.payload = Payload::Raw(v.to_string().into_bytes());
            }
            Payload::Embstr(b) => {
                self.payload = Payload::Raw(b.to_vec());
            }
            other => panic!("make_raw_string on non-string payload {other:?}"),
        }
        match &mut self.payload {
            Payload::Raw(b) => b,
            _ => unreachable!(),
        }
    }

    /// Re-apply compact string encodings after a wholesale value swap.
    pub fn try_encode(self) -> Self {
        match self.payload {
            Payload::Raw(b) => {
                let mut obj = Object::string_from(b);
                obj.lru = self.lru;
                obj
            }
            _ => self,
        }
    }

    // --------------------------------------------------------------- lists

    pub fn as_list(&self) -> Option<&Quicklist> {
        match &self.payload {
            Payload::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Quicklist> {
        match &mut self.payload {
            Payload::List(l) => Some(l),
            _ => None,
        }
    }

    // -------------------------------------------------------------- hashes

    pub fn hash_len(&self) -> usize {
        match &self.payload {
            Payload::PackedHash(pl) => pl.len() / 2,
            Payload::TableHash(d) => d.len(),
            _ => panic!("hash_len on a {} object", self.otype().name()),
        }
    }

    pub fn hash_get(&self, field: &[u8]) -> Option<Vec<u8>> {
        match &self.payload {
            Payload::PackedHash(pl) => {
                let head = pl.head()?;
                let hit = pl.find(head, field, 1)?;
                let val = pl.next(hit)?;
                Some(pl.get(val).to_vec())
            }
            Payload::TableHash(d) => d.peek(field).cloned(),
            _ => panic!("hash_get on a {} object", self.otype().name()),
        }
    }

    pub fn hash_exists(&self, field: &[u8]) -> bool {
        self.hash_get(field).is_some()
    }

    /// Insert or update one field. Returns true when the field is new.
    /// Crossing either limit converts the packed form to the table first;
    /// the conversion is never undone.
    pub fn hash_set(&mut self, field: &[u8], value: &[u8], limits: &EncodingLimits) -> bool {
        if let Payload::PackedHash(pl) = &self.payload {
            let would_grow = self.hash_get(field).is_none();
            let over_len = field.len() > limits.hash_max_value || value.len() > limits.hash_max_value;
            let over_count = would_grow && pl.len() / 2 + 1 > limits.hash_max_entries;
            if over_len || over_count {
                self.hash_convert_to_table();
            }
        }
        match &mut self.payload {
            Payload::PackedHash(pl) => {
                if let Some(head) = pl.head() {
                    if let Some(hit) = pl.find(head, field, 1) {
                        let val = pl.next(hit).expect("packed hash missing value");
                        let next = pl.delete(val);
                        match next {
                            Some(p) => {
                                pl.insert_before(p, value);
                            }
                            None => pl.push_tail(value),
                        }
                        return false;
                    }
                }
                pl.push_tail(field);
                pl.push_tail(value);
                true
            }
            Payload::TableHash(d) => d.upsert(field.to_vec(), value.to_vec()).is_none(),
            _ => panic!("hash_set on a non-hash object"),
        }
    }

    pub fn hash_del(&mut self, field: &[u8]) -> bool {
        match &mut self.payload {
            Payload::PackedHash(pl) => {
                let Some(head) = pl.head() else { return false };
                match pl.find(head, field, 1) {
                    Some(hit) => {
                        let _ = pl.delete(hit); // field
                        let _ = pl.delete(hit); // value now at the same offset
                        true
                    }
                    None => false,
                }
            }
            Payload::TableHash(d) => d.remove(field).is_some(),
            _ => panic!("hash_del on a non-hash object"),
        }
    }

    /// Every field/value pair, in storage order for the packed form.
    pub fn hash_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        match &self.payload {
            Payload::PackedHash(pl) => {
                let mut out = Vec::with_capacity(pl.len() / 2);
                let mut p = pl.head();
                while let Some(field_off) = p {
                    let val_off = pl.next(field_off).expect("packed hash missing value");
                    out.push((pl.get(field_off).to_vec(), pl.get(val_off).to_vec()));
                    p = pl.next(val_off);
                }
                out
            }
            Payload::TableHash(d) => {
                let mut out = Vec::with_capacity(d.len());
                let mut cursor = 0;
                loop {
                    cursor = d.scan(cursor, |k, v| out.push((k.to_vec(), v.clone())));
                    if cursor == 0 {
                        break;
                    }
                }
                out
            }
            _ => panic!("hash_entries on a non-hash object"),
        }
    }

    /// Cursor-driven incremental iteration for HSCAN. The packed form is
    /// returned whole with a zero cursor.
    pub fn hash_scan(&self, cursor: u64, mut f: impl FnMut(&[u8], &[u8])) -> u64 {
        match &self.payload {
            Payload::PackedHash(pl) => {
                let mut p = pl.head();
                while let Some(field_off) = p {
                    let val_off = pl.next(field_off).expect("packed hash missing value");
                    f(&pl.get(field_off).to_vec(), &pl.get(val_off).to_vec());
                    p = pl.next(val_off);
                }
                0
            }
            Payload::TableHash(d) => d.scan(cursor, |k, v| f(k, v)),
            _ => panic!("hash_scan on a non-hash object"),
        }
    }

    fn hash_convert_to_table(&mut self) {
        let entries = self.hash_entries();
        let mut d = Dict::new();
        for (k, v) in entries {
            let _ = d.insert(k, v);
        }
        self.payload = Payload::TableHash(d);
    }

    // ---------------------------------------------------------------- sets

    pub fn set_len(&self) -> usize {
        match &self.payload {
            Payload::IntSet(s) => s.len(),
            Payload::TableSet(d) => d.len(),
            _ => panic!("set_len on a {} object", self.otype().name()),
        }
    }

    /// Add a member. A non-integer member, or growth past the intset
    /// limit, converts to the table encoding first.
    pub fn set_add(&mut self, member: &[u8], limits: &EncodingLimits) -> bool {
        if let Payload::IntSet(s) = &self.payload {
            let as_int = try_parse_int(member);
            let overflow = s.len() + 1 > limits.set_max_intset_entries;
            if as_int.is_none() || overflow {
                self.set_convert_to_table();
            }
        }
        match &mut self.payload {
            Payload::IntSet(s) => s.add(try_parse_int(member).expect("checked above")),
            Payload::TableSet(d) => d.insert(member.to_vec(), ()).is_ok(),
            _ => panic!("set_add on a non-set object"),
        }
    }

    pub fn set_remove(&mut self, member: &[u8]) -> bool {
        match &mut self.payload {
            Payload::IntSet(s) => match try_parse_int(member) {
                Some(v) => s.remove(v),
                None => false,
            },
            Payload::TableSet(d) => d.remove(member).is_some(),
            _ => panic!("set_remove on a non-set object"),
        }
    }

    pub fn set_contains(&self, member: &[u8]) -> bool {
        match &self.payload {
            Payload::IntSet(s) => match try_parse_int(member) {
                Some(v) => s.contains(v),
                None => false,
            },
            Payload::TableSet(d) => d.peek(member).is_some(),
            _ => panic!("set_contains on a non-set object"),
        }
    }

    fn set_convert_to_table(&mut self) {
        if let Payload::IntSet(s) = &self.payload {
            let mut d = Dict::new();
            for v in s.iter() {
                let _ = d.insert(v.to_string().into_bytes(), ());
            }
            self.payload = Payload::TableSet(d);
        }
    }

    // ------------------------------------------------------------ eviction

    pub fn touch_lru(&self, now_ms: u64) {
        self.lru.store((now_ms / 1000) as u32, Ordering::Relaxed);
    }

    pub fn idle_seconds(&self, now_ms: u64) -> u64 {
        let now = (now_ms / 1000) as u32;
        now.saturating_sub(self.lru.load(Ordering::Relaxed)) as u64
    }
}

/// Interned read-only objects created at startup. Cloning one of these
/// Arcs is the "shared refcount" path: the object is never mutated, and
/// `unshare` produces a private copy for any writer.
#[derive(Debug)]
pub struct SharedObjects {
    integers: Vec<Arc<Object>>,
}

impl SharedObjects {
    pub fn new() -> Self {
        let integers = (0..SHARED_INTEGERS).map(|v| Arc::new(Object::from_int(v))).collect();
        SharedObjects { integers }
    }

    pub fn integer(&self, v: i64) -> Option<Arc<Object>> {
        if (0..SHARED_INTEGERS).contains(&v) {
            Some(self.integers[v as usize].clone())
        } else {
            None
        }
    }
}

impl Default for SharedObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// Get a mutable view of a possibly-shared object, copying it first when
/// other owners exist.
pub fn unshare(slot: &mut Arc<Object>) -> &mut Object {
    Arc::make_mut(slot)
}

pub fn refcount(obj: &Arc<Object>) -> usize {
    Arc::strong_count(obj)
}

/// Float parse with the same strictness commands expect: NaN is rejected,
/// explicit "inf"/"-inf" are allowed.
pub fn parse_float(data: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(data).ok()?;
    if s.is_empty() || s.trim() != s {
        return None;
    }
    let v: f64 = s.parse().ok()?;
    if v.is_nan() {
        return None;
    }
    if v.is_infinite() {
        let lower = s.to_ascii_lowercase();
        let bare = lower.trim_start_matches(['+', '-']);
        if bare != "inf" && bare != "infinity" {
            return None;
        }
    }
    Some(v)
}
