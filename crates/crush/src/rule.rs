//! Placement rules: small programs evaluated against the hierarchy.
//!
//! A rule belongs to a pool, declares the replica-count range it serves,
//! and carries an ordered list of steps. The selector interprets the steps
//! as a tiny stack machine over a working vector of items; see
//! [`crate::select`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placement strategy a rule serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    /// Full-copy replication.
    Replicated,
    /// Parity striping; replica index is positional.
    Raid4,
}

impl RuleType {
    /// Wire encoding.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Replicated => 1,
            Self::Raid4 => 2,
        }
    }

    /// Decode a wire discriminant.
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Replicated),
            2 => Some(Self::Raid4),
            _ => None,
        }
    }

    /// The name used by the text map format.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Replicated => "replicated",
            Self::Raid4 => "raid4",
        }
    }

    /// Parse a text map rule type.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "replicated" => Some(Self::Replicated),
            "raid4" => Some(Self::Raid4),
            _ => None,
        }
    }
}

/// How a choose step surfaces rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChooseMode {
    /// Rejections are transparent; accepted picks pack into a compact
    /// prefix. Used for replicated placement.
    FirstN,
    /// Every output slot is positional; a rejected slot stays empty and
    /// retries re-roll only within that slot. Used where chunk index must
    /// be stable across failures.
    Indep,
}

impl ChooseMode {
    /// The name used by the text map format.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::FirstN => "firstn",
            Self::Indep => "indep",
        }
    }

    /// Parse a text map choose mode.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "firstn" => Some(Self::FirstN),
            "indep" => Some(Self::Indep),
            _ => None,
        }
    }
}

/// One step of a placement rule.
///
/// `n` in the choose steps may be zero or negative: zero means "as many as
/// the caller asked for", a negative value means "that many fewer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Does nothing; kept for wire compatibility.
    Noop,
    /// Replace the working vector with the given item.
    Take {
        /// Device id (>= 0) or bucket id (< 0) to start from.
        item: i32,
    },
    /// For each working-vector entry, select `n` distinct items of the
    /// given type and concatenate the results.
    Choose {
        /// Rejection mode.
        mode: ChooseMode,
        /// Requested count; see the enum docs for `n <= 0`.
        n: i32,
        /// Target hierarchy type.
        type_id: i32,
    },
    /// Like `Choose`, but keep descending from each picked item until a
    /// leaf device is reached; the working vector becomes the leaf list.
    ChooseLeaf {
        /// Rejection mode.
        mode: ChooseMode,
        /// Requested count; see the enum docs for `n <= 0`.
        n: i32,
        /// Target hierarchy type.
        type_id: i32,
    },
    /// Append the working vector to the result and clear it.
    Emit,
}

impl Step {
    /// Wire encoding: `(op, arg1, arg2)`.
    #[must_use]
    pub fn to_wire(self) -> (u32, i32, i32) {
        match self {
            Self::Noop => (0, 0, 0),
            Self::Take { item } => (1, item, 0),
            Self::Choose { mode: ChooseMode::FirstN, n, type_id } => (2, n, type_id),
            Self::Choose { mode: ChooseMode::Indep, n, type_id } => (3, n, type_id),
            Self::Emit => (4, 0, 0),
            Self::ChooseLeaf { mode: ChooseMode::FirstN, n, type_id } => (6, n, type_id),
            Self::ChooseLeaf { mode: ChooseMode::Indep, n, type_id } => (7, n, type_id),
        }
    }

    /// Decode a wire step.
    ///
    /// # Errors
    ///
    /// `CorruptBinary` (with a zero offset, re-tagged by the codec) on an
    /// unknown opcode.
    pub fn from_wire(op: u32, arg1: i32, arg2: i32) -> Result<Self> {
        match op {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Take { item: arg1 }),
            2 => Ok(Self::Choose { mode: ChooseMode::FirstN, n: arg1, type_id: arg2 }),
            3 => Ok(Self::Choose { mode: ChooseMode::Indep, n: arg1, type_id: arg2 }),
            4 => Ok(Self::Emit),
            6 => Ok(Self::ChooseLeaf { mode: ChooseMode::FirstN, n: arg1, type_id: arg2 }),
            7 => Ok(Self::ChooseLeaf { mode: ChooseMode::Indep, n: arg1, type_id: arg2 }),
            other => Err(Error::CorruptBinary {
                offset: 0,
                why: format!("unknown rule opcode {other}"),
            }),
        }
    }
}

/// A named, numbered placement program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Tenant / policy-group id this rule serves.
    pub pool: u32,
    /// Placement strategy.
    pub rule_type: RuleType,
    /// Smallest replica count this rule applies to.
    pub min_size: u32,
    /// Largest replica count this rule applies to.
    pub max_size: u32,
    /// The program.
    pub steps: Vec<Step>,
}

impl Rule {
    /// Create a rule with no steps.
    #[must_use]
    pub fn new(pool: u32, rule_type: RuleType, min_size: u32, max_size: u32) -> Self {
        Self { pool, rule_type, min_size, max_size, steps: Vec::new() }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Whether this rule serves the requested replica count.
    #[must_use]
    pub fn applies_to(&self, size: usize) -> bool {
        let Ok(size) = u32::try_from(size) else {
            return false;
        };
        size >= self.min_size && size <= self.max_size
    }
}
