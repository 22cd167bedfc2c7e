//! CRUSH: deterministic, hierarchy-aware data placement.
//!
//! This crate maps a placement group id to an ordered list of storage
//! devices drawn from a weighted, hierarchical cluster topology. The same
//! map produces the same answer on every host, so peers can agree on where
//! data lives without talking to each other.
//!
//! # Architecture
//!
//! ```text
//! text map ──compile──▶ ┌──────────────────────────────┐ ──encode──▶ wire bytes
//!                       │           CrushMap           │
//! wire bytes ──decode─▶ │  devices, buckets, rules,    │ ◀─decompile── text map
//!                       │  name registries             │
//!                       └──────────────┬───────────────┘
//!                                      │ map_pg(rule, pg, n)
//!                                      ▼
//!                        [Some(osd3), Some(osd7), None, …]
//! ```
//!
//! A map is built (or compiled, or decoded), finalized once, and then
//! shared freely: selection takes `&self` and keeps no state between
//! calls.
//!
//! # Usage
//!
//! ```
//! use crush::{AlgKind, ChooseMode, CrushMap, Rule, RuleType, Step, WEIGHT_ONE};
//!
//! let mut map = CrushMap::new();
//! for i in 0..4 {
//!     map.add_device(i, Some(&format!("osd{i}")), None).unwrap();
//! }
//! map.set_type_name(1, "host").unwrap();
//! let host = map
//!     .add_bucket(0, AlgKind::Straw, 1, vec![0, 1, 2, 3], vec![WEIGHT_ONE; 4])
//!     .unwrap();
//! map.set_item_name(host, "h1").unwrap();
//!
//! let rule = Rule::new(0, RuleType::Replicated, 1, 10)
//!     .with_step(Step::Take { item: host })
//!     .with_step(Step::Choose { mode: ChooseMode::FirstN, n: 0, type_id: 0 })
//!     .with_step(Step::Emit);
//! let rule_id = map.add_rule(rule);
//!
//! map.finalize().unwrap();
//!
//! let placement = map.map_pg(rule_id, 42, 2);
//! assert_eq!(placement.len(), 2);
//! assert_ne!(placement[0], placement[1]);
//!
//! // The binary form round-trips bit-exactly.
//! let decoded = CrushMap::decode(&map.encode()).unwrap();
//! assert_eq!(decoded, map);
//! ```

#![warn(missing_docs)]

pub mod bucket;
pub mod codec;
pub mod compile;
pub mod decompile;
pub mod error;
pub mod hash;
pub mod map;
pub mod rule;
pub mod select;

pub use bucket::{Alg, AlgKind, Bucket, BucketId, DeviceId, WEIGHT_ONE};
pub use codec::CRUSH_MAGIC;
pub use compile::compile;
pub use decompile::decompile;
pub use error::{Error, Result};
pub use map::{CrushMap, OFFLOAD_DOWN};
pub use rule::{ChooseMode, Rule, RuleType, Step};
