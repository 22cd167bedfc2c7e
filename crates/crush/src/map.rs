//! The cluster map: devices, buckets, rules and their name registries.
//!
//! The map owns everything. Buckets live in a table indexed by `-1 - id`,
//! rules are numbered densely from zero, and devices are implied by the
//! offload vector plus the item-name registry (a gap in the id space is an
//! absent device). Mutation happens during a single-writer build phase;
//! [`CrushMap::finalize`] validates the structure, computes every bucket's
//! selection table, and unlocks [`CrushMap::map_pg`](crate::select).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::bucket::{AlgKind, Bucket, BucketId, DeviceId, WEIGHT_ONE};
use crate::error::{Error, Result};
use crate::rule::Rule;

/// Offload value meaning "device is down".
pub const OFFLOAD_DOWN: u32 = WEIGHT_ONE;

/// A bidirectional id <-> name registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct NameMap {
    by_id: BTreeMap<i32, String>,
    by_name: HashMap<String, i32>,
}

impl NameMap {
    /// Bind `id` to `name`. Re-binding an id replaces its old name; binding
    /// a name that already refers to a different id is a duplicate.
    pub(crate) fn insert(&mut self, id: i32, name: &str) -> Result<()> {
        match self.by_name.get(name) {
            Some(&existing) if existing != id => {
                return Err(Error::Duplicate { name: name.to_string() });
            }
            _ => {}
        }
        if let Some(old) = self.by_id.insert(id, name.to_string()) {
            self.by_name.remove(&old);
        }
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    pub(crate) fn name(&self, id: i32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub(crate) fn id(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.by_id.iter().map(|(&id, name)| (id, name.as_str()))
    }
}

/// The complete cluster topology plus its placement rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrushMap {
    max_devices: i32,
    device_offload: Vec<u32>,
    buckets: Vec<Option<Bucket>>,
    rules: Vec<Option<Rule>>,
    type_names: NameMap,
    item_names: NameMap,
    rule_names: NameMap,
    finalized: bool,
}

impl CrushMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a device.
    ///
    /// Gaps in the id space are fine; they stand for absent devices.
    /// `offload` is the 16.16 fixed-point probability of rejecting the
    /// device at selection time (`0` healthy, [`OFFLOAD_DOWN`] down).
    ///
    /// # Errors
    ///
    /// `InvalidTopology` for a negative id, `InvalidOffload` for an offload
    /// beyond [`OFFLOAD_DOWN`], `Duplicate` when the name is taken.
    pub fn add_device(
        &mut self,
        id: DeviceId,
        name: Option<&str>,
        offload: Option<u32>,
    ) -> Result<()> {
        if id < 0 {
            return Err(Error::InvalidTopology { why: format!("device id {id} is negative") });
        }
        if let Some(off) = offload {
            if off > OFFLOAD_DOWN {
                return Err(Error::InvalidOffload {
                    value: f64::from(off) / f64::from(WEIGHT_ONE),
                });
            }
        }
        if let Some(name) = name {
            self.item_names.insert(id, name)?;
        }
        if id >= self.max_devices {
            self.max_devices = id + 1;
        }
        if self.device_offload.len() <= id as usize {
            self.device_offload.resize(id as usize + 1, 0);
        }
        self.device_offload[id as usize] = offload.unwrap_or(0);
        self.finalized = false;
        Ok(())
    }

    /// Add a bucket. An id of `0` auto-assigns the next unused negative id.
    /// Returns the id actually used.
    ///
    /// Children may reference buckets declared later; resolution happens at
    /// [`CrushMap::finalize`].
    ///
    /// # Errors
    ///
    /// `Duplicate` when the explicit id is occupied; `InvalidTopology` for
    /// a malformed bucket (see [`Bucket::new`]).
    pub fn add_bucket(
        &mut self,
        id: BucketId,
        kind: AlgKind,
        type_id: i32,
        items: Vec<i32>,
        item_weights: Vec<u32>,
    ) -> Result<BucketId> {
        let id = if id == 0 {
            let mut candidate = -1;
            while self.bucket(candidate).is_some() {
                candidate -= 1;
            }
            candidate
        } else {
            id
        };
        let bucket = Bucket::new(id, kind, type_id, items, item_weights)?;
        let slot = (-1 - id) as usize;
        if self.buckets.len() <= slot {
            self.buckets.resize(slot + 1, None);
        }
        if self.buckets[slot].is_some() {
            return Err(Error::Duplicate { name: id.to_string() });
        }
        self.buckets[slot] = Some(bucket);
        self.finalized = false;
        Ok(id)
    }

    /// Append a rule; returns its id.
    pub fn add_rule(&mut self, rule: Rule) -> usize {
        self.rules.push(Some(rule));
        self.finalized = false;
        self.rules.len() - 1
    }

    /// Name a device or bucket.
    ///
    /// # Errors
    ///
    /// `Duplicate` when the name already refers to a different item.
    pub fn set_item_name(&mut self, id: i32, name: &str) -> Result<()> {
        self.item_names.insert(id, name)
    }

    /// Name a hierarchy type.
    ///
    /// # Errors
    ///
    /// `Duplicate` when the name already refers to a different type.
    pub fn set_type_name(&mut self, id: i32, name: &str) -> Result<()> {
        self.type_names.insert(id, name)
    }

    /// Name a rule.
    ///
    /// # Errors
    ///
    /// `Duplicate` when the name already refers to a different rule.
    pub fn set_rule_name(&mut self, id: usize, name: &str) -> Result<()> {
        let id = i32::try_from(id)
            .map_err(|_| Error::InvalidTopology { why: format!("rule id {id} out of range") })?;
        self.rule_names.insert(id, name)
    }

    /// Look up an item name.
    #[must_use]
    pub fn item_name(&self, id: i32) -> Option<&str> {
        self.item_names.name(id)
    }

    /// Look up an item by name.
    #[must_use]
    pub fn item_id(&self, name: &str) -> Option<i32> {
        self.item_names.id(name)
    }

    /// Look up a type name.
    #[must_use]
    pub fn type_name(&self, id: i32) -> Option<&str> {
        self.type_names.name(id)
    }

    /// Look up a type by name.
    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<i32> {
        self.type_names.id(name)
    }

    /// Look up a rule name.
    #[must_use]
    pub fn rule_name(&self, id: usize) -> Option<&str> {
        self.rule_names.name(i32::try_from(id).ok()?)
    }

    /// Look up a rule by name.
    #[must_use]
    pub fn rule_id(&self, name: &str) -> Option<usize> {
        self.rule_names.id(name).and_then(|id| usize::try_from(id).ok())
    }

    /// All named types, ascending by id.
    pub fn type_names(&self) -> impl Iterator<Item = (i32, &str)> {
        self.type_names.iter()
    }

    /// All named items, ascending by id.
    pub fn item_names(&self) -> impl Iterator<Item = (i32, &str)> {
        self.item_names.iter()
    }

    /// All named rules, ascending by id.
    pub fn rule_names(&self) -> impl Iterator<Item = (i32, &str)> {
        self.rule_names.iter()
    }

    /// One past the highest device id.
    #[must_use]
    pub fn max_devices(&self) -> i32 {
        self.max_devices
    }

    /// Size of the bucket table (ids `-1` through `-max_buckets`).
    #[must_use]
    pub fn max_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Size of the rule table.
    #[must_use]
    pub fn max_rules(&self) -> usize {
        self.rules.len()
    }

    /// The bucket with the given negative id.
    #[must_use]
    pub fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        if id >= 0 {
            return None;
        }
        self.buckets.get((-1 - id) as usize).and_then(Option::as_ref)
    }

    /// The rule with the given id.
    #[must_use]
    pub fn rule(&self, id: usize) -> Option<&Rule> {
        self.rules.get(id).and_then(Option::as_ref)
    }

    /// The offload of a device, zero for absent ids.
    #[must_use]
    pub fn device_offload(&self, id: DeviceId) -> u32 {
        if id < 0 {
            return 0;
        }
        self.device_offload.get(id as usize).copied().unwrap_or(0)
    }

    /// Hierarchy type of an item: `0` for devices, the bucket's type
    /// otherwise. `None` for a bucket id with no bucket.
    #[must_use]
    pub fn item_type(&self, item: i32) -> Option<i32> {
        if item >= 0 {
            Some(0)
        } else {
            self.bucket(item).map(|b| b.type_id)
        }
    }

    /// Whether [`CrushMap::finalize`] has run since the last mutation.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Validate the structure and compute every bucket's selection table.
    ///
    /// Extends `max_devices` over any device referenced as a child, checks
    /// that every bucket child exists, and enforces the forest invariant
    /// (no bucket is the child of two parents). On failure the map stays
    /// observable but unusable for selection until a later finalize
    /// succeeds.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` on a structural violation or a per-bucket table
    /// failure (see [`Bucket::finalize`]).
    pub fn finalize(&mut self) -> Result<()> {
        self.finalized = false;
        self.validate_topology()?;
        for slot in &mut self.buckets {
            if let Some(bucket) = slot {
                bucket.finalize()?;
            }
        }
        self.device_offload.resize(self.max_devices.max(0) as usize, 0);
        self.finalized = true;
        Ok(())
    }

    /// Structural checks shared by [`CrushMap::finalize`] and the decoder.
    pub(crate) fn validate_topology(&mut self) -> Result<()> {
        let mut seen_child: HashMap<BucketId, BucketId> = HashMap::new();
        let mut max_devices = self.max_devices;
        for bucket in self.buckets.iter().flatten() {
            for &child in &bucket.items {
                if child >= 0 {
                    max_devices = max_devices.max(child + 1);
                    continue;
                }
                if self.bucket(child).is_none() {
                    return Err(Error::InvalidTopology {
                        why: format!("bucket {} references unknown child {child}", bucket.id),
                    });
                }
                if let Some(first) = seen_child.insert(child, bucket.id) {
                    return Err(Error::InvalidTopology {
                        why: format!(
                            "bucket {child} is a child of both {first} and {}",
                            bucket.id
                        ),
                    });
                }
            }
        }

        // Single parents alone do not rule out a closed loop of buckets.
        // Anything not reachable from a parentless bucket sits on a cycle.
        let mut reachable: std::collections::HashSet<BucketId> = std::collections::HashSet::new();
        let mut stack: Vec<BucketId> = self
            .buckets
            .iter()
            .flatten()
            .filter(|b| !seen_child.contains_key(&b.id))
            .map(|b| b.id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(bucket) = self.bucket(id) {
                stack.extend(bucket.items.iter().copied().filter(|&c| c < 0));
            }
        }
        for bucket in self.buckets.iter().flatten() {
            if !reachable.contains(&bucket.id) {
                return Err(Error::InvalidTopology {
                    why: format!("bucket {} is part of a cycle", bucket.id),
                });
            }
        }

        self.max_devices = max_devices;
        Ok(())
    }

    /// Restore decoded state. Used by the codec only; the caller is
    /// responsible for validating afterwards.
    pub(crate) fn from_parts(
        max_devices: i32,
        device_offload: Vec<u32>,
        buckets: Vec<Option<Bucket>>,
        rules: Vec<Option<Rule>>,
        type_names: NameMap,
        item_names: NameMap,
        rule_names: NameMap,
    ) -> Self {
        Self {
            max_devices,
            device_offload,
            buckets,
            rules,
            type_names,
            item_names,
            rule_names,
            finalized: false,
        }
    }

    /// Mark a decoded map usable for selection.
    pub(crate) fn set_finalized(&mut self) {
        self.finalized = true;
    }
}
