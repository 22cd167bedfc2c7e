//! Rule evaluation: mapping a placement group to an ordered device list.
//!
//! [`CrushMap::map_pg`] interprets a rule as a tiny stack machine over two
//! vectors: `work`, the current candidates, and `result`, the accumulated
//! output. `take` seeds `work`, the choose steps expand every `work` entry
//! into selections of the requested type, and `emit` drains `work` into
//! `result`.
//!
//! Selection never fails: when the retry budget runs out the remaining
//! slots are simply absent (a shorter list under `firstn`, `None` gaps
//! under `indep`). Everything here is a pure function of
//! `(map, rule, pg, max_result)` and is safe to call from any number of
//! threads against a finalized map.

use tracing::{debug, trace};

use crate::bucket::DeviceId;
use crate::hash::hash2;
use crate::map::{CrushMap, OFFLOAD_DOWN};
use crate::rule::{ChooseMode, Step};

/// Re-rolls within one bucket before a collision retry gives up and
/// restarts the descent.
pub const CHOOSE_LOCAL_TRIES: u32 = 50;

/// Full descents for one output slot before the slot is abandoned.
pub const CHOOSE_TOTAL_TRIES: u32 = 50;

impl CrushMap {
    /// Map a placement group to an ordered vector of devices.
    ///
    /// Returns up to `max_result` entries; `None` marks a slot an `indep`
    /// step could not fill. The result is empty when the rule does not
    /// exist, the map has not been finalized, or `max_result` falls outside
    /// the rule's `[min_size, max_size]` mask.
    ///
    /// For a fixed `(map, rule_id, pg, max_result)` the output is
    /// deterministic and identical on every host.
    #[must_use]
    pub fn map_pg(&self, rule_id: usize, pg: u32, max_result: usize) -> Vec<Option<DeviceId>> {
        let Some(rule) = self.rule(rule_id) else {
            debug!(rule_id, "map_pg: no such rule");
            return Vec::new();
        };
        if !self.is_finalized() {
            debug!(rule_id, "map_pg: map is not finalized");
            return Vec::new();
        }
        if max_result == 0 || !rule.applies_to(max_result) {
            debug!(
                rule_id,
                max_result, rule.min_size, rule.max_size, "map_pg: size outside rule mask"
            );
            return Vec::new();
        }

        let mut work: Vec<Option<i32>> = Vec::new();
        let mut result: Vec<Option<DeviceId>> = Vec::new();

        for step in &rule.steps {
            match *step {
                Step::Noop => {}
                Step::Take { item } => {
                    trace!(pg, item, "step take");
                    work = vec![Some(item)];
                }
                Step::Choose { mode, n, type_id } | Step::ChooseLeaf { mode, n, type_id } => {
                    let leaf = matches!(step, Step::ChooseLeaf { .. });
                    let numrep = if n > 0 { n } else { max_result as i32 + n };
                    if numrep <= 0 {
                        work.clear();
                        continue;
                    }
                    let numrep = numrep as u32;
                    let mut next = Vec::new();
                    for entry in &work {
                        match *entry {
                            None => {
                                // An earlier indep step left this slot
                                // empty; keep its gaps positional.
                                next.extend(std::iter::repeat(None).take(numrep as usize));
                            }
                            Some(item) if item >= 0 => {
                                // A device can only satisfy a device-type
                                // choose, and only while it is in.
                                if type_id == 0 && !self.is_out(pg, item) {
                                    next.push(Some(item));
                                }
                            }
                            Some(bucket_id) => {
                                let picked =
                                    self.choose(bucket_id, pg, numrep, type_id, mode, leaf);
                                next.extend(picked);
                            }
                        }
                    }
                    work = next;
                }
                Step::Emit => {
                    trace!(pg, emitted = work.len(), "step emit");
                    result.append(&mut work);
                }
            }
        }
        result.truncate(max_result);
        result
    }

    /// Produce up to `numrep` items of `type_id` below `start`.
    ///
    /// Under `firstn` the returned vector is compact (rejected slots are
    /// dropped); under `indep` it always holds `numrep` positional entries.
    /// With `recurse_to_leaf`, each picked bucket is further resolved to a
    /// single device and the device is returned in its place.
    fn choose(
        &self,
        start: i32,
        x: u32,
        numrep: u32,
        type_id: i32,
        mode: ChooseMode,
        recurse_to_leaf: bool,
    ) -> Vec<Option<i32>> {
        let firstn = mode == ChooseMode::FirstN;
        // `out` holds the accepted target-type items and drives collision
        // checks; `leaves` holds the devices they resolved to when
        // recursing. They stay parallel.
        let mut out: Vec<Option<i32>> = Vec::with_capacity(numrep as usize);
        let mut leaves: Vec<Option<i32>> = Vec::with_capacity(numrep as usize);

        'rep: for rep in 0..numrep {
            let mut ftotal = 0u32;

            // Restart here when a pick is rejected outright.
            'descent: loop {
                let Some(mut bucket) = self.bucket(start) else {
                    debug!(start, "choose: take item is not a bucket");
                    break 'descent;
                };
                let mut flocal = 0u32;

                // One iteration per hierarchy level; collisions re-roll
                // here without restarting the whole descent.
                'level: loop {
                    let r = match mode {
                        ChooseMode::FirstN => rep + ftotal,
                        ChooseMode::Indep => rep + numrep * (flocal + ftotal),
                    };

                    let Some(idx) = bucket.pick(x, r) else {
                        ftotal += 1;
                        flocal += 1;
                        if ftotal <= CHOOSE_TOTAL_TRIES {
                            continue 'descent;
                        }
                        break 'descent;
                    };
                    let item = bucket.items[idx];
                    let itemtype = self.item_type(item).unwrap_or(-1);

                    if itemtype != type_id {
                        if item < 0 && itemtype > type_id {
                            // Keep descending toward the target level.
                            // The bucket exists or item_type was None.
                            if let Some(child) = self.bucket(item) {
                                bucket = child;
                                continue 'level;
                            }
                        }
                        // A device above the target level, a dangling
                        // child, or a level skip: reject and restart.
                        trace!(x, item, itemtype, type_id, "choose: wrong type, rejecting");
                        ftotal += 1;
                        flocal += 1;
                        if ftotal <= CHOOSE_TOTAL_TRIES {
                            continue 'descent;
                        }
                        break 'descent;
                    }

                    // Reached the target level.
                    let collide = out.contains(&Some(item));
                    let mut reject = false;
                    let mut leaf = None;
                    if !collide {
                        if recurse_to_leaf && item < 0 {
                            let inner = self.choose(item, x, 1, 0, mode, false);
                            match inner.into_iter().flatten().next() {
                                Some(device) => leaf = Some(device),
                                None => reject = true,
                            }
                        } else if item >= 0 {
                            reject = self.is_out(x, item);
                        }
                    }

                    if collide || reject {
                        trace!(x, item, collide, reject, ftotal, "choose: rejecting");
                        ftotal += 1;
                        flocal += 1;
                        if collide && flocal <= CHOOSE_LOCAL_TRIES {
                            continue 'level;
                        }
                        if ftotal <= CHOOSE_TOTAL_TRIES {
                            continue 'descent;
                        }
                        break 'descent;
                    }

                    // Accepted.
                    out.push(Some(item));
                    leaves.push(if item < 0 { leaf } else { Some(item) });
                    continue 'rep;
                }
            }

            // Retry budget exhausted for this slot.
            debug!(x, rep, type_id, "choose: slot exhausted");
            if !firstn {
                out.push(None);
                leaves.push(None);
            }
        }
        if recurse_to_leaf {
            leaves
        } else {
            out
        }
    }

    /// Whether a device is rejected for this input, by its offload.
    ///
    /// An offload of [`OFFLOAD_DOWN`] rejects always; anything in between
    /// rejects pseudo-randomly with probability `offload / 0x10000`.
    fn is_out(&self, x: u32, device: DeviceId) -> bool {
        let offload = self.device_offload(device);
        if offload == 0 {
            return false;
        }
        if offload >= OFFLOAD_DOWN {
            return true;
        }
        (hash2(x, device as u32) & 0xffff) < offload
    }
}
