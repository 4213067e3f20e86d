//! Four ranks in a ring exchanging interface DOF values: every ghost slot
//! carries exactly the owner's value.

use std::collections::BTreeMap;

use dof_space::prelude::*;
use serial_test::serial;

#[test]
#[serial]
fn four_rank_ring_ghosts_match_owners() {
    let nranks = 4;
    let handles: Vec<_> = (0..nranks)
        .map(|rank| {
            std::thread::spawn(move || {
                let comm = RayonComm::new(rank, nranks);
                let next = (rank + 1) % nranks;
                let prev = (rank + nranks - 1) % nranks;

                // Two dofs per rank: dof 1 faces the next rank, dof 0 the
                // previous one.
                let mut lists = BTreeMap::new();
                lists.insert(next, vec![1]);
                lists.insert(prev, vec![0]);
                let mut ex =
                    FaceNbrExchange::build(&comm, CommTag::new(0x0800), 2, lists).unwrap();
                assert_eq!(ex.num_ghost(), 2);
                assert_eq!(ex.total_size(), 4);

                let x = vec![(10 * rank) as f64, (10 * rank + 1) as f64];
                let got = ex.exchange(&comm, &x).unwrap().to_vec();

                // Slots are grouped by ascending neighbor rank; the previous
                // rank contributes its dof 1, the next rank its dof 0.
                let mut expected_by_nbr = BTreeMap::new();
                expected_by_nbr.insert(prev, (10 * prev + 1) as f64);
                expected_by_nbr.insert(next, (10 * next) as f64);
                for (&nbr, &val) in &expected_by_nbr {
                    let range = ex.ghost_range(nbr).unwrap();
                    assert_eq!(range.len(), 1);
                    assert_eq!(got[range.start], val);
                }
                // The cache serves repeated reads without another exchange.
                assert_eq!(ex.values().unwrap(), got.as_slice());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
