//! Replica convergence under concurrent edits, including randomized
//! interleavings.

use girder::crdt::{OrSet, PnCounter, Rga, RgaOp};
use proptest::prelude::*;

fn type_str(rga: &mut Rga, node_id: &str, text: &str) -> Vec<RgaOp> {
    let mut ops = Vec::new();
    let mut anchor = None;
    for ch in text.chars() {
        let op = rga.insert(anchor.as_ref(), ch, node_id).expect("insert");
        if let RgaOp::Insert { id, .. } = &op {
            anchor = Some(id.clone());
        }
        ops.push(op);
    }
    ops
}

#[test]
fn concurrent_inserts_after_same_anchor_pick_one_order_everywhere() {
    let mut base = Rga::new();
    let ops = type_str(&mut base, "seed", "ab");
    let RgaOp::Insert { id: anchor, .. } = &ops[0] else {
        panic!("expected insert op");
    };

    let mut alice = base.clone();
    let mut bob = base.clone();

    let from_alice = alice.insert(Some(anchor), 'x', "alice").expect("insert x");
    let from_bob = bob.insert(Some(anchor), 'y', "bob").expect("insert y");

    alice.apply(from_bob).expect("apply remote");
    bob.apply(from_alice).expect("apply remote");

    assert_eq!(alice.text(), bob.text());
    assert!(alice.text() == "axyb" || alice.text() == "ayxb");
}

proptest! {
    #[test]
    fn rga_replicas_converge_under_concurrent_edits(
        edits_a in prop::collection::vec((0usize..8, any::<bool>()), 0..20),
        edits_b in prop::collection::vec((0usize..8, any::<bool>()), 0..20),
    ) {
        let mut base = Rga::new();
        type_str(&mut base, "seed", "abcdef");

        let mut replica_a = base.clone();
        let mut replica_b = base.clone();

        let mut ops_a = Vec::new();
        for (slot, is_delete) in edits_a {
            let ids = replica_a.visible_ids();
            if ids.is_empty() {
                continue;
            }
            let target = &ids[slot % ids.len()];
            let op = if is_delete {
                replica_a.delete(target).expect("local delete")
            } else {
                replica_a.insert(Some(target), 'A', "replica-a").expect("local insert")
            };
            ops_a.push(op);
        }

        let mut ops_b = Vec::new();
        for (slot, is_delete) in edits_b {
            let ids = replica_b.visible_ids();
            if ids.is_empty() {
                continue;
            }
            let target = &ids[slot % ids.len()];
            let op = if is_delete {
                replica_b.delete(target).expect("local delete")
            } else {
                replica_b.insert(Some(target), 'B', "replica-b").expect("local insert")
            };
            ops_b.push(op);
        }

        // Exchange op logs in causal (per-replica) order.
        for op in &ops_b {
            replica_a.apply(op.clone()).expect("apply remote");
        }
        for op in &ops_a {
            replica_b.apply(op.clone()).expect("apply remote");
        }

        prop_assert_eq!(replica_a.text(), replica_b.text());
    }

    #[test]
    fn pn_counter_value_is_sum_of_replica_deltas(
        ops in prop::collection::vec((0usize..3, any::<bool>(), 1u64..100), 0..40),
    ) {
        let mut replicas: Vec<PnCounter> = (0..3).map(|_| PnCounter::new()).collect();
        let mut expected: i64 = 0;
        for (replica, is_increment, delta) in ops {
            let node = format!("n{replica}");
            if is_increment {
                replicas[replica].increment(&node, delta);
                expected += delta as i64;
            } else {
                replicas[replica].decrement(&node, delta);
                expected -= delta as i64;
            }
        }

        // All-pairs merge, twice, in both directions.
        let snapshot = replicas.clone();
        for replica in replicas.iter_mut() {
            for other in &snapshot {
                replica.merge(other);
                replica.merge(other);
            }
        }
        for replica in &replicas {
            prop_assert_eq!(replica.value(), expected);
        }
    }

    #[test]
    fn orset_add_wins_only_for_unobserved_tags(
        interleave in prop::collection::vec(any::<bool>(), 1..12),
    ) {
        let mut a = OrSet::new();
        let mut b = OrSet::new();

        // b adds (tags a never observes), a adds-then-removes its own.
        let mut b_added = false;
        for concurrent_add in interleave {
            if concurrent_add {
                b.add("v", "node-b");
                b_added = true;
            } else {
                a.add("v", "node-a");
                a.remove(&"v");
            }
        }

        a.merge(&b);
        b.merge(&a);

        prop_assert_eq!(a.contains(&"v"), b_added, "only unobserved adds survive");
        prop_assert_eq!(a.contains(&"v"), b.contains(&"v"));
    }
}
