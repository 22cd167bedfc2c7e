//! End-to-end placement scenarios across the compiler, codec and selector.

use crush::{compile, decompile, AlgKind, ChooseMode, CrushMap, Rule, RuleType, Step, OFFLOAD_DOWN, WEIGHT_ONE};

fn fp(w: f64) -> u32 {
    (w * f64::from(WEIGHT_ONE)).round() as u32
}

/// One straw host holding `n` unit-weight devices plus a firstn rule.
fn flat_cluster(n: i32, down: &[i32]) -> CrushMap {
    let mut map = CrushMap::new();
    for i in 0..n {
        let offload = down.contains(&i).then_some(OFFLOAD_DOWN);
        map.add_device(i, Some(&format!("osd{i}")), offload).unwrap();
    }
    map.set_type_name(1, "host").unwrap();
    let host = map
        .add_bucket(0, AlgKind::Straw, 1, (0..n).collect(), vec![fp(1.0); n as usize])
        .unwrap();
    map.set_item_name(host, "h1").unwrap();
    let rule = Rule::new(0, RuleType::Replicated, 1, 10)
        .with_step(Step::Take { item: host })
        .with_step(Step::Choose { mode: ChooseMode::FirstN, n: 0, type_id: 0 })
        .with_step(Step::Emit);
    map.add_rule(rule);
    map.finalize().unwrap();
    map
}

/// Scenario (a): a flat four-device cluster spreads size-2 placements over
/// distinct devices with roughly even frequencies.
#[test]
fn test_flat_cluster_spreads_evenly() {
    let map = flat_cluster(4, &[]);
    let mut freq = [0u32; 4];
    for pg in 0..10 {
        let out = map.map_pg(0, pg, 2);
        assert_eq!(out.len(), 2);
        let (a, b) = (out[0].unwrap(), out[1].unwrap());
        assert_ne!(a, b);
        assert!((0..4).contains(&a) && (0..4).contains(&b));
        freq[a as usize] += 1;
        freq[b as usize] += 1;
    }
    // 20 slots over 4 devices: each should land near 5.
    for (device, count) in freq.iter().enumerate() {
        assert!(
            (1..=9).contains(count),
            "device {device} got {count} of 20 slots: {freq:?}"
        );
    }
}

/// Scenario (b): two racks of two hosts of two devices; a rule that picks
/// two racks then one leaf per rack never lands both replicas in one rack.
#[test]
fn test_two_racks_isolate_failure_domains() {
    let mut map = CrushMap::new();
    for i in 0..8 {
        map.add_device(i, Some(&format!("osd{i}")), None).unwrap();
    }
    map.set_type_name(1, "host").unwrap();
    map.set_type_name(2, "rack").unwrap();
    map.set_type_name(3, "root").unwrap();
    let mut hosts = Vec::new();
    for h in 0..4 {
        let id = map
            .add_bucket(0, AlgKind::Straw, 1, vec![2 * h, 2 * h + 1], vec![fp(1.0); 2])
            .unwrap();
        map.set_item_name(id, &format!("host{h}")).unwrap();
        hosts.push(id);
    }
    let rack0 = map
        .add_bucket(0, AlgKind::Straw, 2, vec![hosts[0], hosts[1]], vec![fp(2.0); 2])
        .unwrap();
    let rack1 = map
        .add_bucket(0, AlgKind::Straw, 2, vec![hosts[2], hosts[3]], vec![fp(2.0); 2])
        .unwrap();
    let root = map
        .add_bucket(0, AlgKind::Straw, 3, vec![rack0, rack1], vec![fp(4.0); 2])
        .unwrap();
    for (id, name) in [(rack0, "rack0"), (rack1, "rack1"), (root, "root")] {
        map.set_item_name(id, name).unwrap();
    }
    let rule = Rule::new(0, RuleType::Replicated, 1, 10)
        .with_step(Step::Take { item: root })
        .with_step(Step::Choose { mode: ChooseMode::FirstN, n: 2, type_id: 2 })
        .with_step(Step::ChooseLeaf { mode: ChooseMode::FirstN, n: 1, type_id: 0 })
        .with_step(Step::Emit);
    let rule_id = map.add_rule(rule);
    map.finalize().unwrap();

    for pg in 0..1000 {
        let out = map.map_pg(rule_id, pg, 2);
        assert_eq!(out.len(), 2, "pg {pg}: {out:?}");
        let (a, b) = (out[0].unwrap(), out[1].unwrap());
        assert_ne!(a, b, "pg {pg} repeated a device");
        assert_ne!(a / 4, b / 4, "pg {pg} put both replicas in rack {}", a / 4);
    }
}

/// Scenario (c): a down device takes no placements and the rest share its
/// load.
#[test]
fn test_down_device_sheds_all_load() {
    let map = flat_cluster(4, &[0]);
    let mut freq = [0u32; 4];
    for pg in 0..1000 {
        let out = map.map_pg(0, pg, 2);
        assert_eq!(out.len(), 2);
        for d in out.into_iter().flatten() {
            freq[d as usize] += 1;
        }
    }
    assert_eq!(freq[0], 0, "down device was selected: {freq:?}");
    for device in 1..4 {
        assert!(
            (500..850).contains(&freq[device]),
            "surviving devices did not share the load: {freq:?}"
        );
    }
}

/// Scenario (d): adding a fifth device remaps only a bounded fraction of
/// placements.
#[test]
fn test_straw_growth_moves_bounded_fraction() {
    let before = flat_cluster(4, &[]);
    let after = flat_cluster(5, &[]);

    let mut changed_pairs = 0u32;
    let mut changed_singles = 0u32;
    let n = 10_000u32;
    for pg in 0..n {
        if before.map_pg(0, pg, 2) != after.map_pg(0, pg, 2) {
            changed_pairs += 1;
        }
        if before.map_pg(0, pg, 1) != after.map_pg(0, pg, 1) {
            changed_singles += 1;
        }
    }
    // One draw moves with probability ~ w/(W+w) = 1/5; a size-2 result is
    // two draws.
    let single = f64::from(changed_singles) / f64::from(n);
    assert!((0.15..0.25).contains(&single), "single-draw remap fraction {single}");
    let pair = f64::from(changed_pairs) / f64::from(n);
    assert!(pair < 0.45, "size-2 remap fraction {pair}");
}

/// Scenario (e): the section-6 sample map compiles, decompiles and
/// recompiles to an identical binary.
#[test]
fn test_sample_map_round_trips() {
    let src = "\
device 0 osd0 offload 0.500
type 1 host
host h1 {
\tid -1
\talg straw
\titem osd0 weight 1.000
}
rule data {
\tpool 0
\ttype replicated
\tmin_size 1
\tmax_size 10
\tstep take h1
\tstep choose firstn 0 type device
\tstep emit
}
";
    let first = compile(src).unwrap();
    let text = decompile(&first);
    let second = compile(&text).unwrap_or_else(|e| panic!("recompile failed: {e}\n{text}"));
    assert_eq!(first.encode(), second.encode());
}

/// Scenario (f): asking indep for four devices when only three are healthy
/// yields exactly one deterministic gap.
#[test]
fn test_indep_leaves_deterministic_gap() {
    let mut map = flat_cluster(4, &[3]);
    let rule = Rule::new(0, RuleType::Raid4, 1, 10)
        .with_step(Step::Take { item: -1 })
        .with_step(Step::Choose { mode: ChooseMode::Indep, n: 4, type_id: 0 })
        .with_step(Step::Emit);
    let rule_id = map.add_rule(rule);
    map.finalize().unwrap();

    for pg in 0..200 {
        let out = map.map_pg(rule_id, pg, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(
            out.iter().filter(|slot| slot.is_none()).count(),
            1,
            "pg {pg}: {out:?}"
        );
        let live: Vec<i32> = out.iter().copied().flatten().collect();
        assert_eq!(live.len(), 3);
        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                assert_ne!(a, b, "pg {pg} repeated a device: {out:?}");
            }
        }
        assert_eq!(out, map.map_pg(rule_id, pg, 4), "pg {pg} not deterministic");
    }
}

/// Determinism across the codec: a decoded copy places identically.
#[test]
fn test_placement_survives_the_wire() {
    let map = flat_cluster(6, &[2]);
    let copy = CrushMap::decode(&map.encode()).unwrap();
    for pg in 0..500 {
        assert_eq!(map.map_pg(0, pg, 3), copy.map_pg(0, pg, 3));
    }
}

/// The same topology authored as text and through the API places
/// identically once ids and weights agree.
#[test]
fn test_text_and_api_agree() {
    let text = "\
device 0 osd0
device 1 osd1
device 2 osd2
device 3 osd3
type 1 host
host h1 {
\tid -1
\talg straw
\titem osd0 weight 1.000
\titem osd1 weight 1.000
\titem osd2 weight 1.000
\titem osd3 weight 1.000
}
rule data {
\tpool 0
\ttype replicated
\tmin_size 1
\tmax_size 10
\tstep take h1
\tstep choose firstn 0 type device
\tstep emit
}
";
    let compiled = compile(text).unwrap();
    let built = flat_cluster(4, &[]);
    for pg in 0..500 {
        assert_eq!(compiled.map_pg(0, pg, 2), built.map_pg(0, pg, 2));
    }
}
