use sphere_hierarchy::{
    Averaging, EpochDriver, FnTrainer, Hierarchy, HierarchyErr, HierarchySpec, Optimizer,
    ProcessErr, Result, Trainer, Tuning,
    training::{IndexSource, VecBatchSource},
};

const SIZE: usize = 3;

/// Keeps every gradient it was stepped with.
#[derive(Default)]
struct Recorder {
    steps: Vec<Vec<f32>>,
}

impl Optimizer for Recorder {
    fn step(&mut self, grads: &[f32]) {
        self.steps.push(grads.to_vec());
    }
}

fn norm(grads: &[f32]) -> f32 {
    grads.iter().map(|g| g * g).sum::<f32>().sqrt()
}

fn assert_steps(got: &[Vec<f32>], expected: &[&[f32]]) {
    assert_eq!(got.len(), expected.len());

    for (step, want) in got.iter().zip(expected) {
        assert_eq!(step.len(), want.len());
        assert!(step.iter().zip(*want).all(|(g, w)| (g - w).abs() < 1e-5), "{step:?} != {want:?}");
    }
}

fn build<T: Trainer>(trainer: T) -> Result<Hierarchy<T>> {
    let tuning = Tuning {
        averaging: Averaging::Items,
        ..Tuning::default()
    };

    Hierarchy::create(HierarchySpec::new(5, 2, SIZE).with_tuning(tuning), trainer)
}

/// Adds 2 to every entry and reports the item as its loss.
fn doubling() -> impl Trainer<Item = usize> {
    FnTrainer::new(|item: &usize, grads: &mut [f32]| {
        grads.iter_mut().for_each(|g| *g += 2.);
        Ok(*item as f32)
    })
}

#[test]
fn epochs_feed_the_optimizer() -> Result<()> {
    let mut hierarchy = build(doubling())?;
    let mut recorder = Recorder::default();
    let mut driver = EpochDriver::new(VecBatchSource::new((0..40usize).collect()), &mut recorder);

    hierarchy.start()?;
    for epoch in 0..2 {
        let report = driver.run_epoch(&mut hierarchy)?;

        assert_eq!(report.epoch, epoch);
        assert_eq!(report.batches, 40);
        assert_eq!(report.items, 40);
        assert_eq!(report.skipped, 0);
        assert!((report.mean_loss - 19.5).abs() < 1e-9);
        assert!((report.grad_norm - norm(&[2.; SIZE])).abs() < 1e-5);
        assert!(!report.clipped);
    }
    hierarchy.stop()?;

    assert_eq!(driver.epoch(), 2);
    drop(driver);
    assert_steps(&recorder.steps, &[&[2.; SIZE], &[2.; SIZE]]);
    Ok(())
}

#[test]
fn large_gradients_are_clipped_before_the_step() -> Result<()> {
    let mut hierarchy = build(doubling())?;
    let mut driver = EpochDriver::new(IndexSource::new(16), Recorder::default()).with_clip_norm(1.);

    hierarchy.start()?;
    let report = driver.run_epoch(&mut hierarchy)?;
    hierarchy.stop()?;

    assert!(report.clipped);
    assert!((report.grad_norm - norm(&[2.; SIZE])).abs() < 1e-5);

    let steps = &driver.optimizer().steps;
    assert_eq!(steps.len(), 1);
    assert!((norm(&steps[0]) - 1.).abs() < 1e-5);
    Ok(())
}

#[test]
fn skipped_batches_are_reported() -> Result<()> {
    let trainer = FnTrainer::new(|item: &usize, grads: &mut [f32]| {
        if item % 4 == 0 {
            return Err(ProcessErr::new(format!("unreadable batch {item}")));
        }

        grads[0] += 1.;
        Ok(1.)
    });

    let mut hierarchy = build(trainer)?;
    let mut driver = EpochDriver::new(IndexSource::new(20), Recorder::default());

    hierarchy.start()?;
    let report = driver.run_epoch(&mut hierarchy)?;
    hierarchy.stop()?;

    assert_eq!(report.batches, 20);
    assert_eq!(report.skipped, 5);
    assert_eq!(report.items, 15);
    assert_steps(&driver.optimizer().steps, &[&[1., 0., 0.]]);
    Ok(())
}

#[test]
fn a_stopped_hierarchy_runs_no_epoch() -> Result<()> {
    let mut hierarchy = build(doubling())?;
    let mut driver = EpochDriver::new(IndexSource::new(4), Recorder::default());

    assert!(matches!(driver.run_epoch(&mut hierarchy), Err(HierarchyErr::NotRunning)));
    assert!(driver.optimizer().steps.is_empty());
    assert_eq!(driver.epoch(), 0);
    Ok(())
}
