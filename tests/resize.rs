mod common;

use std::{thread, time::Duration};

use sphere_hierarchy::{Averaging, Hierarchy, HierarchySpec, Result, Tuning, hierarchy::ROOT};

use common::{Counting, eventually};

fn sorted(mut ids: Vec<usize>) -> Vec<usize> {
    ids.sort_unstable();
    ids
}

#[test]
fn queue_pressure_spawns_and_idleness_retires() -> Result<()> {
    const ITEMS: usize = 600;

    let tuning = Tuning {
        idle_timeout_ms: 1,
        resize_check_interval: 10,
        spawn_queue_threshold: 20,
        spawn_per_pending: 5,
        idle_cycles_before_retire: 3,
        averaging: Averaging::None,
        ..Tuning::default()
    };
    let spec = HierarchySpec::new(3, 2, 4).with_tuning(tuning);
    let trainer = Counting::slow(ITEMS, Duration::from_micros(200));
    let mut hierarchy = Hierarchy::create(spec, trainer)?;

    hierarchy.start()?;
    hierarchy.submit(0..ITEMS)?;
    assert!(hierarchy.wait_idle(Some(Duration::from_secs(30))));

    let stats = hierarchy.stats();
    assert!(stats.total_spawned > 0, "root never grew");

    // Spawned children go away once idle, the two built ones stay.
    assert!(eventually(Duration::from_secs(10), || hierarchy.nodes_per_level() == [1, 2]));
    assert_eq!(hierarchy.children(ROOT)?.len(), 2);

    hierarchy.stop()?;
    hierarchy.trainer().assert_exactly_once();

    let stats = hierarchy.stats();
    assert_eq!(stats.total_processed, ITEMS as u64);
    assert_eq!(stats.total_retired, stats.total_spawned);
    assert_eq!(stats.retired.len() as u64, stats.total_spawned);

    // Retired children handed their partial gradients back.
    assert_eq!(hierarchy.reduce().to_vec(), [ITEMS as f32; 4]);
    Ok(())
}

#[test]
fn retiring_returns_queued_work_to_the_parent() -> Result<()> {
    const ITEMS: usize = 10;

    let tuning = Tuning {
        dynamic_resize: false,
        averaging: Averaging::None,
        ..Tuning::default()
    };
    let spec = HierarchySpec::new(3, 2, 2).with_tuning(tuning);
    let mut hierarchy = Hierarchy::create(spec, Counting::new(ITEMS))?;

    let child = hierarchy.spawn_child(ROOT)?.expect("root has room");
    assert_eq!(hierarchy.nodes_per_level(), [1, 3]);

    hierarchy.submit_to(child, 0..ITEMS)?;
    assert!(hierarchy.retire_child(ROOT, child)?);
    assert_eq!(hierarchy.nodes_per_level(), [1, 2]);

    let root = hierarchy.stats().nodes.into_iter().find(|n| n.id == ROOT).unwrap();
    assert_eq!(root.queue_depth, ITEMS);

    hierarchy.start()?;
    hierarchy.stop()?;

    hierarchy.trainer().assert_exactly_once();
    assert_eq!(hierarchy.reduce().to_vec(), [ITEMS as f32; 2]);
    Ok(())
}

#[test]
fn built_children_are_never_retired() -> Result<()> {
    let hierarchy = Hierarchy::create(HierarchySpec::new(5, 2, 2), Counting::new(0))?;

    assert!(!hierarchy.retire_child(ROOT, 1)?);
    assert_eq!(hierarchy.children(ROOT)?, [1, 2, 3, 4]);
    assert!(hierarchy.retire_child(ROOT, 99).is_err());
    Ok(())
}

#[test]
fn full_or_deepest_parents_spawn_nothing() -> Result<()> {
    let hierarchy = Hierarchy::create(HierarchySpec::new(13, 2, 2), Counting::new(0))?;
    assert_eq!(hierarchy.spawn_child(ROOT)?, None);

    // 160 threads reach the fourth level, its nodes can't have children.
    let deep = Hierarchy::create(HierarchySpec::new(160, 4, 2), Counting::new(0))?;
    assert_eq!(deep.nodes_per_level(), [1, 12, 144, 3]);

    let leaf = deep.stats().nodes.iter().find(|n| n.level == 3).map(|n| n.id).unwrap();
    assert_eq!(deep.spawn_child(leaf)?, None);
    Ok(())
}

#[test]
fn spawning_while_siblings_steal_keeps_sibling_lists_whole() -> Result<()> {
    const ITEMS: usize = 400;

    let tuning = Tuning {
        dynamic_resize: false,
        averaging: Averaging::None,
        ..Tuning::default()
    };
    let spec = HierarchySpec::new(4, 2, 8).with_tuning(tuning);
    let trainer = Counting::slow(ITEMS, Duration::from_micros(300));
    let mut hierarchy = Hierarchy::create(spec, trainer)?;

    hierarchy.submit_to(1, 0..ITEMS)?;
    hierarchy.start()?;

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..5 {
                let mut spawned = Vec::new();
                while let Some(id) = hierarchy.spawn_child(ROOT).unwrap() {
                    spawned.push(id);
                }

                thread::sleep(Duration::from_millis(5));
                for id in spawned {
                    assert!(hierarchy.retire_child(ROOT, id).unwrap());
                }
            }
        });

        s.spawn(|| {
            for _ in 0..200 {
                let children = sorted(hierarchy.children(ROOT).unwrap());

                for &child in &children {
                    // The child may be retired between both reads.
                    let Ok(siblings) = hierarchy.siblings(child) else {
                        continue;
                    };

                    assert!(!siblings.contains(&child));
                    assert!(siblings.len() < 12);
                }
                thread::yield_now();
            }
        });
    });

    assert!(hierarchy.wait_idle(Some(Duration::from_secs(30))));
    hierarchy.stop()?;

    let children = sorted(hierarchy.children(ROOT)?);
    assert_eq!(children, [1, 2, 3]);
    for &child in &children {
        let expected: Vec<_> = children.iter().copied().filter(|&c| c != child).collect();
        assert_eq!(sorted(hierarchy.siblings(child)?), expected);
    }

    hierarchy.trainer().assert_exactly_once();
    assert_eq!(hierarchy.reduce().to_vec(), [ITEMS as f32; 8]);
    Ok(())
}

#[test]
fn work_of_an_orphaned_grandchild_reaches_the_root() -> Result<()> {
    const ITEMS: usize = 20;

    let tuning = Tuning {
        dynamic_resize: false,
        averaging: Averaging::None,
        ..Tuning::default()
    };
    let spec = HierarchySpec::new(3, 2, 2).with_tuning(tuning);
    let trainer = Counting::slow(ITEMS, Duration::from_millis(20));
    let mut hierarchy = Hierarchy::create(spec, trainer)?;

    let parent = hierarchy.spawn_child(ROOT)?.expect("root has room");
    let grandchild = hierarchy.spawn_child(parent)?.expect("parent has room");

    hierarchy.start()?;
    hierarchy.submit_to(grandchild, 0..ITEMS)?;

    // The parent goes away before the grandchild's thread hands its queue back.
    assert!(hierarchy.retire_child(parent, grandchild)?);
    assert!(hierarchy.retire_child(ROOT, parent)?);
    assert_eq!(hierarchy.nodes_per_level(), [1, 2]);

    assert!(hierarchy.wait_idle(Some(Duration::from_secs(30))));
    hierarchy.stop()?;

    hierarchy.trainer().assert_exactly_once();

    let stats = hierarchy.stats();
    assert_eq!(stats.total_processed, ITEMS as u64);
    assert_eq!(stats.total_skipped, 0);
    assert_eq!(stats.retired.len(), 2);
    assert_eq!(hierarchy.reduce().to_vec(), [ITEMS as f32; 2]);
    Ok(())
}
