//! Binary encoding of the cluster map.
//!
//! This is the canonical on-wire and on-disk form: little-endian
//! regardless of host, prefixed with a magic number, and carrying every
//! precomputed selection table verbatim so that peers reproduce placement
//! bit-exactly without re-deriving anything. `decode(encode(m)) == m` for
//! every finalized map.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bucket::{Alg, AlgKind, Bucket};
use crate::error::{Error, Result};
use crate::map::{CrushMap, NameMap};
use crate::rule::{Rule, RuleType, Step};

/// Magic number identifying this encoding. Consumers must reject anything
/// else.
pub const CRUSH_MAGIC: u32 = 0x0001_0000;

/// Byte reader that remembers its absolute offset for error reporting.
struct Reader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, total: buf.len() }
    }

    fn offset(&self) -> usize {
        self.total - self.buf.len()
    }

    fn corrupt(&self, why: impl Into<String>) -> Error {
        Error::CorruptBinary { offset: self.offset(), why: why.into() }
    }

    fn get_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(self.corrupt("truncated"));
        }
        Ok(self.buf.get_u32_le())
    }

    fn get_i32(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(self.corrupt("truncated"));
        }
        Ok(self.buf.get_i32_le())
    }

    /// Read a `count`-sized u32 table, refusing counts the input cannot
    /// possibly hold.
    fn get_u32s(&mut self, count: usize) -> Result<Vec<u32>> {
        if self.buf.remaining() < count.saturating_mul(4) {
            return Err(self.corrupt(format!("table of {count} words overruns input")));
        }
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }

    fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.buf.remaining() < count {
            return Err(self.corrupt(format!("string of {count} bytes overruns input")));
        }
        let mut out = vec![0u8; count];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

/// Node count of the implicit tree holding `n` children.
fn tree_num_nodes(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        2 * n.next_power_of_two()
    }
}

impl CrushMap {
    /// Encode this map to its canonical binary form.
    ///
    /// Meaningful for finalized maps; an unfinalized map encodes whatever
    /// tables it currently holds.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(CRUSH_MAGIC);
        buf.put_u32_le(self.max_buckets() as u32);
        buf.put_u32_le(self.max_rules() as u32);
        buf.put_u32_le(self.max_devices() as u32);

        for slot in 0..self.max_buckets() {
            let id = -1 - slot as i32;
            let Some(bucket) = self.bucket(id) else {
                buf.put_u32_le(0);
                continue;
            };
            buf.put_u32_le(1);
            buf.put_u32_le(bucket.alg.kind().to_wire());
            buf.put_u32_le(bucket.type_id as u32);
            buf.put_u32_le(bucket.weight);
            buf.put_u32_le(bucket.size() as u32);
            for &item in &bucket.items {
                buf.put_i32_le(item);
            }
            for &w in &bucket.item_weights {
                buf.put_u32_le(w);
            }
            match &bucket.alg {
                Alg::Uniform { primes, .. } => {
                    for &p in primes {
                        buf.put_u32_le(p);
                    }
                }
                Alg::List { sum_weights } => {
                    for &s in sum_weights {
                        buf.put_u32_le(s);
                    }
                }
                Alg::Tree { node_weights } => {
                    for &w in node_weights {
                        buf.put_u32_le(w);
                    }
                }
                Alg::Straw { straws } => {
                    for &s in straws {
                        buf.put_u32_le(s);
                    }
                }
            }
        }

        for id in 0..self.max_rules() {
            let Some(rule) = self.rule(id) else {
                buf.put_u32_le(0);
                continue;
            };
            buf.put_u32_le(1);
            buf.put_u32_le(rule.steps.len() as u32);
            buf.put_u32_le(rule.pool);
            buf.put_u32_le(rule.rule_type.to_wire());
            buf.put_u32_le(rule.min_size);
            buf.put_u32_le(rule.max_size);
            for &step in &rule.steps {
                let (op, arg1, arg2) = step.to_wire();
                buf.put_u32_le(op);
                buf.put_i32_le(arg1);
                buf.put_i32_le(arg2);
            }
        }

        for id in 0..self.max_devices() {
            buf.put_u32_le(self.device_offload(id));
        }

        encode_names(&mut buf, self.type_names());
        encode_names(&mut buf, self.item_names());
        encode_names(&mut buf, self.rule_names());

        buf.freeze()
    }

    /// Decode a map from its canonical binary form.
    ///
    /// The decoded map is immediately usable for selection: the tables come
    /// from the wire, and the structure is re-validated.
    ///
    /// # Errors
    ///
    /// `UnknownVersion` for a foreign magic, `CorruptBinary` for anything
    /// truncated or nonsensical, `InvalidTopology` when the decoded
    /// structure violates the forest invariant.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.get_u32()?;
        if magic != CRUSH_MAGIC {
            return Err(Error::UnknownVersion { magic });
        }
        let max_buckets = r.get_u32()? as usize;
        let max_rules = r.get_u32()? as usize;
        let max_devices = r.get_u32()? as usize;

        let mut buckets: Vec<Option<Bucket>> = Vec::new();
        for slot in 0..max_buckets {
            if r.get_u32()? == 0 {
                buckets.push(None);
                continue;
            }
            let id = -1 - slot as i32;
            let kind_wire = r.get_u32()?;
            let kind = AlgKind::from_wire(kind_wire)
                .ok_or_else(|| r.corrupt(format!("unknown bucket alg {kind_wire}")))?;
            let type_id = r.get_u32()? as i32;
            if type_id <= 0 {
                return Err(r.corrupt(format!("bucket {id} has non-positive type {type_id}")));
            }
            let weight = r.get_u32()?;
            let size = r.get_u32()? as usize;
            if r.buf.remaining() < size.saturating_mul(8) {
                return Err(r.corrupt(format!("bucket of {size} children overruns input")));
            }
            let mut items = Vec::with_capacity(size);
            for _ in 0..size {
                items.push(r.get_i32()?);
            }
            let item_weights = r.get_u32s(size)?;
            let alg = match kind {
                AlgKind::Uniform => Alg::Uniform {
                    item_weight: item_weights.first().copied().unwrap_or(0),
                    primes: r.get_u32s(size)?,
                },
                AlgKind::List => Alg::List { sum_weights: r.get_u32s(size)? },
                AlgKind::Tree => Alg::Tree { node_weights: r.get_u32s(tree_num_nodes(size))? },
                AlgKind::Straw => Alg::Straw { straws: r.get_u32s(size)? },
            };
            buckets.push(Some(Bucket { id, type_id, weight, items, item_weights, alg }));
        }

        let mut rules: Vec<Option<Rule>> = Vec::new();
        for _ in 0..max_rules {
            if r.get_u32()? == 0 {
                rules.push(None);
                continue;
            }
            let len = r.get_u32()? as usize;
            let pool = r.get_u32()?;
            let type_wire = r.get_u32()?;
            let rule_type = RuleType::from_wire(type_wire)
                .ok_or_else(|| r.corrupt(format!("unknown rule type {type_wire}")))?;
            let min_size = r.get_u32()?;
            let max_size = r.get_u32()?;
            if r.buf.remaining() < len.saturating_mul(12) {
                return Err(r.corrupt(format!("rule of {len} steps overruns input")));
            }
            let mut steps = Vec::with_capacity(len);
            for _ in 0..len {
                let op = r.get_u32()?;
                let arg1 = r.get_i32()?;
                let arg2 = r.get_i32()?;
                steps.push(
                    Step::from_wire(op, arg1, arg2)
                        .map_err(|_| r.corrupt(format!("unknown rule opcode {op}")))?,
                );
            }
            rules.push(Some(Rule { pool, rule_type, min_size, max_size, steps }));
        }

        let device_offload = r.get_u32s(max_devices)?;

        let type_names = decode_names(&mut r)?;
        let item_names = decode_names(&mut r)?;
        let rule_names = decode_names(&mut r)?;

        let max_devices = i32::try_from(max_devices)
            .map_err(|_| r.corrupt("max_devices out of range"))?;
        let mut map = CrushMap::from_parts(
            max_devices,
            device_offload,
            buckets,
            rules,
            type_names,
            item_names,
            rule_names,
        );
        map.validate_topology()?;
        map.set_finalized();
        Ok(map)
    }
}

fn encode_names<'a>(buf: &mut BytesMut, names: impl Iterator<Item = (i32, &'a str)>) {
    let entries: Vec<(i32, &str)> = names.collect();
    buf.put_u32_le(entries.len() as u32);
    for (id, name) in entries {
        buf.put_i32_le(id);
        buf.put_u32_le(name.len() as u32);
        buf.put_slice(name.as_bytes());
    }
}

fn decode_names(r: &mut Reader<'_>) -> Result<NameMap> {
    let count = r.get_u32()? as usize;
    let mut names = NameMap::default();
    for _ in 0..count {
        let id = r.get_i32()?;
        let len = r.get_u32()? as usize;
        let bytes = r.get_bytes(len)?;
        let name = String::from_utf8(bytes).map_err(|_| r.corrupt("name is not UTF-8"))?;
        names.insert(id, &name).map_err(|_| r.corrupt(format!("name '{name}' repeats")))?;
    }
    Ok(names)
}
