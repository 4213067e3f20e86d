//! Two thread-ranks sharing one vertex group: numbering, offsets, and the
//! equivalence of the implicit and assembled operators.

use dof_space::prelude::*;
use serial_test::serial;

/// rank 0 holds dofs [0,1,2] with dof 2 on the shared vertex; rank 1 holds
/// dofs [0,1,2] with dof 0 on the shared vertex, oriented opposite.
fn rank_inputs(rank: usize) -> (GroupTopology, DofLayout, DependencyGraph) {
    let mut topo = GroupTopology::new(rank);
    let g = topo.add_group(vec![0, 1]).unwrap();
    let mut layout = DofLayout::new(3);
    if rank == 0 {
        layout.set_group_dofs(g, vec![2]).unwrap();
    } else {
        layout.set_group_dofs(g, vec![0]).unwrap();
        layout.set_sign(0, -1).unwrap();
    }
    (topo, layout, DependencyGraph::new())
}

fn on_two_ranks<F, T>(f: F) -> Vec<T>
where
    F: Fn(usize, RayonComm) -> T + Send + Sync + Copy + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = (0..2)
        .map(|rank| std::thread::spawn(move || f(rank, RayonComm::new(rank, 2))))
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
#[serial]
fn numbering_and_offsets() {
    on_two_ranks(|rank, comm| {
        let (topo, layout, deps) = rank_inputs(rank);
        let space = DofSpace::build(&comm, &topo, &layout, &deps, &SpaceConfig {
            tag_base: 0x1000,
            ..SpaceConfig::default()
        })
        .unwrap();

        assert!(space.prolongation().is_implicit());
        assert_eq!(space.global_dof_count(), 6);
        assert_eq!(space.global_tdof_count(), 5);
        if rank == 0 {
            assert_eq!(space.true_size(), 3);
            assert_eq!(space.tdof_offset(), 0);
            assert_eq!(space.global_tdof_number(2).unwrap(), Some(2));
        } else {
            assert_eq!(space.true_size(), 2);
            assert_eq!(space.tdof_offset(), 3);
            assert_eq!(space.dof_offset(), 3);
            // The shared dof is owned by rank 0 and numbered there.
            assert_eq!(space.owner(0), 0);
            assert_eq!(space.local_tdof_number(0), None);
            assert_eq!(space.global_tdof_number(0).unwrap(), Some(2));
        }
    });
}

#[test]
#[serial]
fn implicit_and_assembled_operators_agree() {
    on_two_ranks(|rank, comm| {
        let (topo, layout, deps) = rank_inputs(rank);
        let implicit = DofSpace::build(&comm, &topo, &layout, &deps, &SpaceConfig {
            tag_base: 0x1000,
            ..SpaceConfig::default()
        })
        .unwrap();
        let assembled = DofSpace::build(&comm, &topo, &layout, &deps, &SpaceConfig {
            force_matrix: true,
            tag_base: 0x2000,
            ..SpaceConfig::default()
        })
        .unwrap();
        assert!(!assembled.prolongation().is_implicit());

        let x_true: Vec<f64> = if rank == 0 {
            vec![1.0, 2.0, 3.0]
        } else {
            vec![4.0, 5.0]
        };
        let mut y_imp = vec![0.0; 3];
        let mut y_asm = vec![0.0; 3];
        implicit.prolongation().apply(&comm, &x_true, &mut y_imp).unwrap();
        assembled.prolongation().apply(&comm, &x_true, &mut y_asm).unwrap();
        assert_eq!(y_imp, y_asm);
        if rank == 0 {
            assert_eq!(y_imp, vec![1.0, 2.0, 3.0]);
        } else {
            // The shared copy carries the member's -1 orientation.
            assert_eq!(y_imp, vec![-3.0, 4.0, 5.0]);
            let p = assembled.prolongation().p_matrix().unwrap();
            assert_eq!(p.row_terms(0), vec![(2, -1.0)]);
        }

        // R P = I in both representations.
        let mut back = vec![0.0; x_true.len()];
        implicit.prolongation().restrict(&comm, &y_imp, &mut back).unwrap();
        assert_eq!(back, x_true);
        back.fill(0.0);
        assembled.prolongation().restrict(&comm, &y_asm, &mut back).unwrap();
        assert_eq!(back, x_true);
    });
}

#[test]
#[serial]
fn transpose_sums_sign_corrected_copies() {
    on_two_ranks(|rank, comm| {
        let (topo, layout, deps) = rank_inputs(rank);
        let space = DofSpace::build(&comm, &topo, &layout, &deps, &SpaceConfig {
            tag_base: 0x3000,
            ..SpaceConfig::default()
        })
        .unwrap();

        let x = vec![1.0; 3];
        let mut y_true = vec![0.0; space.true_size()];
        space.prolongation().apply_transpose(&comm, &x, &mut y_true).unwrap();
        if rank == 0 {
            // Shared column: own copy (+1) plus the neighbor's (-1) cancel.
            assert_eq!(y_true, vec![1.0, 1.0, 0.0]);
        } else {
            assert_eq!(y_true, vec![1.0, 1.0]);
        }
    });
}

#[test]
#[serial]
fn average_restriction_matches_copy_on_consistent_data() {
    on_two_ranks(|rank, comm| {
        let (topo, layout, deps) = rank_inputs(rank);
        let space = DofSpace::build(&comm, &topo, &layout, &deps, &SpaceConfig {
            reduce_mode: ReduceMode::Average,
            tag_base: 0x4000,
            ..SpaceConfig::default()
        })
        .unwrap();

        let x_true: Vec<f64> = if rank == 0 {
            vec![1.0, 2.0, 3.0]
        } else {
            vec![4.0, 5.0]
        };
        let mut y = vec![0.0; 3];
        space.prolongation().apply(&comm, &x_true, &mut y).unwrap();
        let mut back = vec![0.0; x_true.len()];
        space.prolongation().restrict(&comm, &y, &mut back).unwrap();
        assert_eq!(back, x_true);
    });
}
