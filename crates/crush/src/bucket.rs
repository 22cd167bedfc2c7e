//! Weighted-child containers forming the interior of the cluster hierarchy.
//!
//! A bucket owns an ordered list of child items (devices or other buckets)
//! with 16.16 fixed-point weights, and answers exactly one question: given a
//! placement input `x` and an attempt counter `r`, which child should this
//! selection descend into? Four algorithms answer it with different
//! stability/cost trade-offs:
//!
//! - **Uniform**: equal weights, O(1), any membership change remaps freely.
//! - **List**: newest-first scan, O(n), additions at the tail are cheap.
//! - **Tree**: implicit binary tree, O(log n), moderately stable.
//! - **Straw**: every child draws a scaled straw, O(n), optimally stable
//!   under membership change. The default for real deployments.
//!
//! The per-kind tables (primes, running sums, node weights, straw factors)
//! are computed once by [`Bucket::finalize`] and carried verbatim by the
//! binary codec, so peers never re-derive them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{hash3, hash4};

/// Unique identifier for a device. Always non-negative.
pub type DeviceId = i32;

/// Unique identifier for a bucket. Always negative.
pub type BucketId = i32;

/// One unit of weight in 16.16 fixed point.
pub const WEIGHT_ONE: u32 = 0x1_0000;

/// Smallest prime admitted into a uniform bucket's table. Keeping the
/// primes well above any realistic fan-out bounds the double-modulo bias
/// by `n / 65537`.
const UNIFORM_PRIME_FLOOR: u32 = 65_537;

/// Bucket selection algorithm discriminant, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgKind {
    /// Equal-weight children.
    Uniform,
    /// Newest-first weighted scan.
    List,
    /// Binary tree descent.
    Tree,
    /// Scaled maximum draw.
    Straw,
}

impl AlgKind {
    /// Wire encoding of this kind.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Uniform => 1,
            Self::List => 2,
            Self::Tree => 3,
            Self::Straw => 4,
        }
    }

    /// Decode a wire discriminant.
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Uniform),
            2 => Some(Self::List),
            3 => Some(Self::Tree),
            4 => Some(Self::Straw),
            _ => None,
        }
    }

    /// The name used by the text map format.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::List => "list",
            Self::Tree => "tree",
            Self::Straw => "straw",
        }
    }

    /// Parse a text map algorithm name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uniform" => Some(Self::Uniform),
            "list" => Some(Self::List),
            "tree" => Some(Self::Tree),
            "straw" => Some(Self::Straw),
            _ => None,
        }
    }
}

/// Selection algorithm plus its precomputed table.
///
/// The tables are empty until [`Bucket::finalize`] runs; a bucket with an
/// empty table never picks anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alg {
    /// Equal-weight children indexed through a primes table.
    Uniform {
        /// The weight shared by every child.
        item_weight: u32,
        /// Primes for double-modulo indexing, fixed at finalize. Resizing
        /// a finalized uniform bucket is rejected, so the table length
        /// doubles as the frozen child count.
        primes: Vec<u32>,
    },
    /// Newest-first scan over accumulated weights.
    List {
        /// `sum_weights[i]` = sum of `item_weights[0..=i]`.
        sum_weights: Vec<u32>,
    },
    /// Implicit complete binary tree; child `j` sits at node `2j + 1`.
    Tree {
        /// Weight of every node's subtree; internal nodes at even indices.
        node_weights: Vec<u32>,
    },
    /// Per-child scaling factors for the maximum-draw competition.
    Straw {
        /// 16.16 fixed-point straw lengths.
        straws: Vec<u32>,
    },
}

impl Alg {
    /// A fresh, not-yet-finalized table of the given kind.
    #[must_use]
    pub fn new(kind: AlgKind) -> Self {
        match kind {
            AlgKind::Uniform => Self::Uniform { item_weight: 0, primes: Vec::new() },
            AlgKind::List => Self::List { sum_weights: Vec::new() },
            AlgKind::Tree => Self::Tree { node_weights: Vec::new() },
            AlgKind::Straw => Self::Straw { straws: Vec::new() },
        }
    }

    /// The discriminant for this table.
    #[must_use]
    pub fn kind(&self) -> AlgKind {
        match self {
            Self::Uniform { .. } => AlgKind::Uniform,
            Self::List { .. } => AlgKind::List,
            Self::Tree { .. } => AlgKind::Tree,
            Self::Straw { .. } => AlgKind::Straw,
        }
    }
}

/// An interior node of the cluster hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Unique negative id.
    pub id: BucketId,
    /// Hierarchy level of this bucket (a type id > 0).
    pub type_id: i32,
    /// Total weight of all children, 16.16 fixed point.
    pub weight: u32,
    /// Child items: device ids >= 0 or bucket ids < 0.
    pub items: Vec<i32>,
    /// Per-child weights, parallel to `items`.
    pub item_weights: Vec<u32>,
    /// Selection algorithm and its precomputed table.
    pub alg: Alg,
}

impl Bucket {
    /// Create a bucket. Tables are computed later by [`Bucket::finalize`].
    ///
    /// # Errors
    ///
    /// `InvalidTopology` when the id is not negative, the type id is not
    /// positive, the item/weight vectors disagree in length, or the total
    /// weight overflows fixed point.
    pub fn new(
        id: BucketId,
        kind: AlgKind,
        type_id: i32,
        items: Vec<i32>,
        item_weights: Vec<u32>,
    ) -> Result<Self> {
        if id >= 0 {
            return Err(Error::InvalidTopology { why: format!("bucket id {id} is not negative") });
        }
        if type_id <= 0 {
            return Err(Error::InvalidTopology {
                why: format!("bucket {id} has non-positive type {type_id}"),
            });
        }
        if items.len() != item_weights.len() {
            return Err(Error::InvalidTopology {
                why: format!(
                    "bucket {id} has {} items but {} weights",
                    items.len(),
                    item_weights.len()
                ),
            });
        }
        let weight = total_weight(id, &item_weights)?;
        Ok(Self { id, type_id, weight, items, item_weights, alg: Alg::new(kind) })
    }

    /// Number of children.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Recompute the total weight and the per-kind table from the current
    /// children and weights.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` when a uniform bucket carries unequal weights or
    /// was resized after a previous finalize.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        self.weight = total_weight(self.id, &self.item_weights)?;
        let n = self.items.len();
        match &mut self.alg {
            Alg::Uniform { item_weight, primes } => {
                if !primes.is_empty() && primes.len() != n {
                    return Err(Error::InvalidTopology {
                        why: format!(
                            "uniform bucket {} resized from {} to {n} children",
                            self.id,
                            primes.len()
                        ),
                    });
                }
                let shared = self.item_weights.first().copied().unwrap_or(0);
                if self.item_weights.iter().any(|&w| w != shared) {
                    return Err(Error::InvalidTopology {
                        why: format!("uniform bucket {} has unequal child weights", self.id),
                    });
                }
                *item_weight = shared;
                *primes = generate_primes(n);
            }
            Alg::List { sum_weights } => {
                sum_weights.clear();
                let mut acc = 0u32;
                for &w in &self.item_weights {
                    acc += w;
                    sum_weights.push(acc);
                }
            }
            Alg::Tree { node_weights } => {
                *node_weights = tree_node_weights(&self.item_weights);
            }
            Alg::Straw { straws } => {
                *straws = calc_straws(&self.item_weights);
            }
        }
        Ok(())
    }

    /// Pick one child pseudo-randomly.
    ///
    /// `x` is the placement input, `r` the attempt counter. The result
    /// depends only on the bucket contents and `(x, r)`; it is `None` when
    /// the bucket is empty, carries no weight, or has not been finalized.
    #[must_use]
    pub fn pick(&self, x: u32, r: u32) -> Option<usize> {
        let n = self.items.len();
        if n == 0 || self.weight == 0 {
            return None;
        }
        let id = self.id as u32;
        match &self.alg {
            Alg::Uniform { primes, .. } => {
                if primes.is_empty() {
                    return None;
                }
                let p = primes[r as usize % primes.len()];
                Some(((hash3(x, id, r) % p) % n as u32) as usize)
            }
            Alg::List { sum_weights } => {
                if sum_weights.len() != n {
                    return None;
                }
                for i in (0..n).rev() {
                    if sum_weights[i] == 0 {
                        continue;
                    }
                    let t = hash4(x, id, self.items[i] as u32, r) % sum_weights[i];
                    if t < self.item_weights[i] {
                        return Some(i);
                    }
                }
                None
            }
            Alg::Tree { node_weights } => {
                if node_weights.is_empty() {
                    return None;
                }
                let mut node = node_weights.len() >> 1;
                while node & 1 == 0 {
                    let w = node_weights[node];
                    if w == 0 {
                        return None;
                    }
                    let t = hash4(x, id, node as u32, r) % w;
                    let half = 1 << (tree_height(node) - 1);
                    let left = node - half;
                    node = if t < node_weights[left] { left } else { node + half };
                }
                let j = node >> 1;
                if j < n && self.item_weights[j] > 0 {
                    Some(j)
                } else {
                    None
                }
            }
            Alg::Straw { straws } => {
                if straws.len() != n {
                    return None;
                }
                let mut best: Option<(usize, u64)> = None;
                for (i, &straw) in straws.iter().enumerate() {
                    if straw == 0 {
                        continue;
                    }
                    let draw = u64::from(hash4(x, id, i as u32, r) & 0xffff) * u64::from(straw);
                    match best {
                        Some((_, high)) if draw <= high => {}
                        _ => best = Some((i, draw)),
                    }
                }
                best.map(|(i, _)| i)
            }
        }
    }
}

fn total_weight(id: BucketId, weights: &[u32]) -> Result<u32> {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    u32::try_from(total).map_err(|_| Error::InvalidTopology {
        why: format!("bucket {id} total weight overflows 16.16 fixed point"),
    })
}

/// Height of a tree node: the number of trailing zero bits in its index.
/// Leaves (odd indices) have height 0.
fn tree_height(node: usize) -> u32 {
    node.trailing_zeros()
}

/// Subtree weights for the implicit complete binary tree holding `n`
/// children at odd node indices (child `j` at node `2j + 1`). The array
/// spans `2 * next_power_of_two(n)` nodes; index 0 is unused.
fn tree_node_weights(item_weights: &[u32]) -> Vec<u32> {
    let n = item_weights.len();
    if n == 0 {
        return Vec::new();
    }
    let num_nodes = 2 * n.next_power_of_two();
    let root = num_nodes >> 1;
    let mut node_weights = vec![0u32; num_nodes];
    for (j, &w) in item_weights.iter().enumerate() {
        let mut node = 2 * j + 1;
        node_weights[node] = w;
        while node != root {
            node = tree_parent(node);
            node_weights[node] += w;
        }
    }
    node_weights
}

/// Parent of a tree node.
fn tree_parent(node: usize) -> usize {
    let h = tree_height(node);
    if (node >> (h + 1)) & 1 == 1 {
        node - (1 << h)
    } else {
        node + (1 << h)
    }
}

/// First `count` primes at or above [`UNIFORM_PRIME_FLOOR`].
fn generate_primes(count: usize) -> Vec<u32> {
    let mut primes = Vec::with_capacity(count);
    let mut candidate = UNIFORM_PRIME_FLOOR;
    while primes.len() < count {
        if is_prime(candidate) {
            primes.push(candidate);
        }
        candidate += 2;
    }
    primes
}

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Straw scaling factors.
///
/// Children are walked in ascending weight order; each weight class scales
/// the running straw by `(1 / p_below) ^ (1 / remaining)` so that, in the
/// continuous limit, each child's win probability equals its weight
/// fraction. Zero-weight children get zero-length straws and never win.
fn calc_straws(item_weights: &[u32]) -> Vec<u32> {
    let size = item_weights.len();
    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by_key(|&i| (item_weights[i], i));

    let mut straws = vec![0u32; size];
    let mut numleft = size;
    let mut straw = 1.0f64;
    let mut wbelow = 0.0f64;
    let mut lastw = 0.0f64;

    let mut i = 0;
    while i < size {
        if item_weights[order[i]] == 0 {
            straws[order[i]] = 0;
            i += 1;
            continue;
        }
        straws[order[i]] = (straw * f64::from(WEIGHT_ONE)) as u32;
        i += 1;
        if i == size {
            break;
        }
        if item_weights[order[i]] == item_weights[order[i - 1]] {
            continue;
        }
        wbelow += (f64::from(item_weights[order[i - 1]]) - lastw) * numleft as f64;
        for &idx in &order[i..] {
            if item_weights[idx] == item_weights[order[i]] {
                numleft -= 1;
            } else {
                break;
            }
        }
        let wnext =
            numleft as f64 * f64::from(item_weights[order[i]] - item_weights[order[i - 1]]);
        let pbelow = wbelow / (wbelow + wnext);
        straw *= (1.0 / pbelow).powf(1.0 / numleft as f64);
        lastw = f64::from(item_weights[order[i - 1]]);
    }
    straws
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(w: f64) -> u32 {
        (w * f64::from(WEIGHT_ONE)).round() as u32
    }

    fn bucket(kind: AlgKind, weights: &[u32]) -> Bucket {
        let items: Vec<i32> = (0..weights.len() as i32).collect();
        let mut b = Bucket::new(-1, kind, 1, items, weights.to_vec()).unwrap();
        b.finalize().unwrap();
        b
    }

    #[test]
    fn test_bucket_rejects_bad_shape() {
        assert!(Bucket::new(1, AlgKind::Straw, 1, vec![], vec![]).is_err());
        assert!(Bucket::new(-1, AlgKind::Straw, 0, vec![], vec![]).is_err());
        assert!(Bucket::new(-1, AlgKind::Straw, 1, vec![0], vec![]).is_err());
    }

    #[test]
    fn test_pick_deterministic() {
        for kind in [AlgKind::Uniform, AlgKind::List, AlgKind::Tree, AlgKind::Straw] {
            let weights =
                if kind == AlgKind::Uniform { vec![fp(1.0); 4] } else { vec![fp(1.0), fp(2.0), fp(3.0), fp(1.5)] };
            let b = bucket(kind, &weights);
            for x in 0..50 {
                for r in 0..4 {
                    assert_eq!(b.pick(x, r), b.pick(x, r), "{kind:?}");
                    assert!(b.pick(x, r).is_some(), "{kind:?}");
                }
            }
        }
    }

    #[test]
    fn test_empty_bucket_picks_nothing() {
        for kind in [AlgKind::Uniform, AlgKind::List, AlgKind::Tree, AlgKind::Straw] {
            let b = bucket(kind, &[]);
            assert_eq!(b.pick(42, 0), None);
        }
    }

    #[test]
    fn test_zero_weight_bucket_picks_nothing() {
        for kind in [AlgKind::Uniform, AlgKind::List, AlgKind::Tree, AlgKind::Straw] {
            let b = bucket(kind, &[0, 0]);
            assert_eq!(b.pick(42, 0), None);
        }
    }

    #[test]
    fn test_zero_weight_child_never_picked() {
        for kind in [AlgKind::List, AlgKind::Tree, AlgKind::Straw] {
            let b = bucket(kind, &[fp(1.0), 0, fp(1.0)]);
            for x in 0..500 {
                assert_ne!(b.pick(x, 0), Some(1), "{kind:?}");
            }
        }
    }

    #[test]
    fn test_uniform_primes_table() {
        let b = bucket(AlgKind::Uniform, &[fp(1.0); 3]);
        let Alg::Uniform { item_weight, primes } = &b.alg else { panic!("wrong alg") };
        assert_eq!(*item_weight, fp(1.0));
        assert_eq!(primes, &[65_537, 65_539, 65_543]);
    }

    #[test]
    fn test_uniform_unequal_weights_rejected() {
        let mut b =
            Bucket::new(-1, AlgKind::Uniform, 1, vec![0, 1], vec![fp(1.0), fp(2.0)]).unwrap();
        assert!(matches!(b.finalize(), Err(Error::InvalidTopology { .. })));
    }

    #[test]
    fn test_uniform_resize_rejected() {
        let mut b = bucket(AlgKind::Uniform, &[fp(1.0); 3]);
        b.items.push(3);
        b.item_weights.push(fp(1.0));
        assert!(matches!(b.finalize(), Err(Error::InvalidTopology { .. })));
    }

    #[test]
    fn test_list_sum_weights() {
        let b = bucket(AlgKind::List, &[fp(1.0), fp(2.0), fp(0.5)]);
        let Alg::List { sum_weights } = &b.alg else { panic!("wrong alg") };
        assert_eq!(sum_weights, &[fp(1.0), fp(3.0), fp(3.5)]);
    }

    #[test]
    fn test_tree_node_weights() {
        let b = bucket(AlgKind::Tree, &[fp(1.0), fp(2.0), fp(3.0)]);
        let Alg::Tree { node_weights } = &b.alg else { panic!("wrong alg") };
        // 3 children round up to 4 leaves; nodes 1, 3, 5 are the children,
        // node 4 is the root.
        assert_eq!(
            node_weights,
            &[0, fp(1.0), fp(3.0), fp(2.0), fp(6.0), fp(3.0), fp(3.0), 0]
        );
    }

    #[test]
    fn test_tree_single_child() {
        let b = bucket(AlgKind::Tree, &[fp(2.0)]);
        for x in 0..100 {
            assert_eq!(b.pick(x, 0), Some(0));
        }
    }

    #[test]
    fn test_straw_factors_two_items() {
        // With weights 1 and 2 the heavier straw is exactly 1.5x: the win
        // probability integral works out to 2/3 for the heavy child.
        let straws = calc_straws(&[fp(1.0), fp(2.0)]);
        assert_eq!(straws[0], WEIGHT_ONE);
        assert!((i64::from(straws[1]) - 98_304).abs() <= 1, "{straws:?}");
    }

    #[test]
    fn test_straw_factors_equal_weights() {
        assert_eq!(calc_straws(&[fp(1.0); 4]), vec![WEIGHT_ONE; 4]);
    }

    #[test]
    fn test_straw_factors_with_zero() {
        let straws = calc_straws(&[0, fp(1.0)]);
        assert_eq!(straws[0], 0);
        assert_eq!(straws[1], WEIGHT_ONE);
    }

    #[test]
    fn test_straw_weighted_distribution() {
        let b = bucket(AlgKind::Straw, &[fp(1.0), fp(2.0), fp(1.0)]);
        let mut counts = [0u32; 3];
        for x in 0..20_000 {
            counts[b.pick(x, 0).unwrap()] += 1;
        }
        let ratio = f64::from(counts[1]) / f64::from(counts[0]);
        assert!((1.7..2.3).contains(&ratio), "weight ratio not respected: {counts:?}");
    }

    #[test]
    fn test_tree_weighted_distribution() {
        let b = bucket(AlgKind::Tree, &[fp(1.0), fp(2.0), fp(3.0)]);
        let mut counts = [0u32; 3];
        for x in 0..50_000 {
            counts[b.pick(x, 0).unwrap()] += 1;
        }
        for (i, expected) in [1.0 / 6.0, 2.0 / 6.0, 3.0 / 6.0].iter().enumerate() {
            let got = f64::from(counts[i]) / 50_000.0;
            assert!(
                (got - expected).abs() / expected < 0.05,
                "child {i}: {got} vs {expected} ({counts:?})"
            );
        }
    }

    #[test]
    fn test_list_weighted_distribution() {
        let b = bucket(AlgKind::List, &[fp(1.0), fp(2.0), fp(3.0)]);
        let mut counts = [0u32; 3];
        for x in 0..50_000 {
            counts[b.pick(x, 0).unwrap()] += 1;
        }
        for (i, expected) in [1.0 / 6.0, 2.0 / 6.0, 3.0 / 6.0].iter().enumerate() {
            let got = f64::from(counts[i]) / 50_000.0;
            assert!(
                (got - expected).abs() / expected < 0.05,
                "child {i}: {got} vs {expected} ({counts:?})"
            );
        }
    }

    #[test]
    fn test_uniform_flat_distribution() {
        let b = bucket(AlgKind::Uniform, &[fp(1.0); 4]);
        let mut counts = [0u32; 4];
        for x in 0..20_000 {
            counts[b.pick(x, 0).unwrap()] += 1;
        }
        for count in counts {
            assert!((4_500..5_500).contains(&count), "skew: {counts:?}");
        }
    }

    #[test]
    fn test_straw_addition_stability() {
        // Adding a fifth equal child should steal roughly 1/5 of the picks
        // and leave the rest untouched.
        let before = bucket(AlgKind::Straw, &[fp(1.0); 4]);
        let after = bucket(AlgKind::Straw, &[fp(1.0); 5]);
        let n = 20_000;
        let mut moved = 0;
        for x in 0..n {
            let a = before.pick(x, 0).unwrap();
            let b = after.pick(x, 0).unwrap();
            if a != b {
                assert_eq!(b, 4, "pick moved between preexisting children");
                moved += 1;
            }
        }
        let frac = f64::from(moved) / f64::from(n);
        assert!((0.15..0.25).contains(&frac), "remapped fraction {frac}");
    }
}
