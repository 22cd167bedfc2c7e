//! Text rendering of a cluster map.
//!
//! Produces the canonical authoring form: recompiling the output of
//! [`decompile`] yields a byte-identical binary for any map that came out
//! of the compiler. Explicit ids and positions are always emitted so that
//! nothing depends on declaration order or auto-assignment.

use std::fmt::Write;

use crate::bucket::{Alg, WEIGHT_ONE};
use crate::map::CrushMap;
use crate::rule::{ChooseMode, Step};

/// Render a map to its text form.
#[must_use]
pub fn decompile(map: &CrushMap) -> String {
    let mut out = String::new();
    out.push_str("# begin crush map\n\n");

    out.push_str("# devices\n");
    for id in 0..map.max_devices() {
        let name = map.item_name(id);
        let offload = map.device_offload(id);
        if name.is_none() && offload == 0 {
            // An absent device; nothing to say about it.
            continue;
        }
        let _ = write!(out, "device {id} ");
        out.push_str(&item_name(map, id));
        if offload > 0 {
            let _ = write!(out, " offload {}", fixedpoint(offload));
        }
        out.push('\n');
    }

    out.push_str("\n# types\n");
    for (id, name) in map.type_names() {
        let _ = writeln!(out, "type {id} {name}");
    }

    out.push_str("\n# buckets\n");
    // Children must be declared before any bucket that contains them, so
    // walk id order but emit depth-first.
    let mut emitted = std::collections::HashSet::new();
    for slot in 0..map.max_buckets() {
        emit_bucket(map, -1 - slot as i32, &mut emitted, &mut out);
    }
    out.push_str("\n# rules\n");
    for id in 0..map.max_rules() {
        let Some(rule) = map.rule(id) else { continue };
        match map.rule_name(id) {
            Some(name) => {
                let _ = writeln!(out, "rule {name} {{");
            }
            None => out.push_str("rule {\n"),
        }
        let _ = writeln!(out, "\tpool {}", rule.pool);
        let _ = writeln!(out, "\ttype {}", rule.rule_type.name());
        let _ = writeln!(out, "\tmin_size {}", rule.min_size);
        let _ = writeln!(out, "\tmax_size {}", rule.max_size);
        for step in &rule.steps {
            match *step {
                Step::Noop => out.push_str("\tstep noop\n"),
                Step::Take { item } => {
                    let _ = writeln!(out, "\tstep take {}", item_name(map, item));
                }
                Step::Choose { mode, n, type_id } => {
                    let _ = writeln!(
                        out,
                        "\tstep choose {} {n} type {}",
                        mode_name(mode),
                        type_name(map, type_id)
                    );
                }
                Step::ChooseLeaf { mode, n, type_id } => {
                    let _ = writeln!(
                        out,
                        "\tstep chooseleaf {} {n} type {}",
                        mode_name(mode),
                        type_name(map, type_id)
                    );
                }
                Step::Emit => out.push_str("\tstep emit\n"),
            }
        }
        out.push_str("}\n");
    }

    out.push_str("\n# end crush map\n");
    out
}

fn mode_name(mode: ChooseMode) -> &'static str {
    mode.name()
}

/// Render one bucket, preceded by any of its bucket children that have not
/// been rendered yet.
fn emit_bucket(
    map: &CrushMap,
    id: i32,
    emitted: &mut std::collections::HashSet<i32>,
    out: &mut String,
) {
    let Some(bucket) = map.bucket(id) else { return };
    if !emitted.insert(id) {
        return;
    }
    for &item in &bucket.items {
        if item < 0 {
            emit_bucket(map, item, emitted, out);
        }
    }

    out.push_str(&type_name(map, bucket.type_id));
    out.push(' ');
    out.push_str(&item_name(map, id));
    out.push_str(" {\n");
    let _ = writeln!(out, "\tid {id}\t\t# do not change unnecessarily");
    let _ = write!(out, "\talg {}", bucket.alg.kind().name());
    let dopos = match bucket.alg {
        Alg::Uniform { .. } => {
            let _ = write!(out, "\t# do not change bucket size ({}) unnecessarily", bucket.size());
            true
        }
        Alg::List { .. } => {
            out.push_str("\t# add new items at the end; do not change order unnecessarily");
            false
        }
        Alg::Tree { .. } => {
            out.push_str("\t# do not change pos for existing items unnecessarily");
            true
        }
        Alg::Straw { .. } => false,
    };
    out.push('\n');
    for (pos, (&item, &weight)) in bucket.items.iter().zip(bucket.item_weights.iter()).enumerate()
    {
        let _ = write!(out, "\titem {} weight {}", item_name(map, item), fixedpoint(weight));
        if dopos {
            let _ = write!(out, " pos {pos}");
        }
        out.push('\n');
    }
    out.push_str("}\n");
}

fn item_name(map: &CrushMap, item: i32) -> String {
    match map.item_name(item) {
        Some(name) => name.to_string(),
        None if item >= 0 => format!("device{item}"),
        None => format!("bucket{}", -1 - item),
    }
}

fn type_name(map: &CrushMap, type_id: i32) -> String {
    match map.type_name(type_id) {
        Some(name) => name.to_string(),
        None if type_id == 0 => "device".to_string(),
        None => format!("type{type_id}"),
    }
}

/// Print a 16.16 fixed-point value so that `round(x * 65536)` recovers it
/// exactly: three decimals when that is lossless, six otherwise (six are
/// always enough, since 5e-7 * 65536 < 0.5).
fn fixedpoint(w: u32) -> String {
    let value = f64::from(w) / f64::from(WEIGHT_ONE);
    let three = (value * 1000.0).round() / 1000.0;
    if (three * f64::from(WEIGHT_ONE)).round() as i64 == i64::from(w) {
        format!("{value:.3}")
    } else {
        format!("{value:.6}")
    }
}
