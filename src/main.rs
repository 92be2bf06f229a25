use std::{num::NonZeroUsize, sync::Arc};

use log::info;

use maestro::{
    config::TrainerSettings,
    data::{Dataset, SliceIterator},
    hooks::library::{
        LearningRateDecayHook, LossLoggerHook, ParameterNormHook, StopAfterEpochsHook,
    },
    net::{DenseNet, Network},
    operator::OperatorState,
    optimization::GradientDescent,
    strategy::MseStep,
    Operator, ThreadWorkerFactory, TimeScale, TimeStep,
};

fn main() -> maestro::Result<()> {
    env_logger::init();

    let settings = match std::env::args().nth(1) {
        Some(path) => match maestro::config::load_settings(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => demo_settings(),
    };

    // y = 2x + 1 over a small grid.
    let rows = 32;
    let xs: Vec<f32> = (0..rows).map(|i| i as f32 / rows as f32).collect();
    let ys: Vec<f32> = xs.iter().map(|x| 2. * x + 1.).collect();
    let dataset = Arc::new(Dataset::new(xs, ys, 1, 1)?);
    let iterator = SliceIterator::new(dataset, settings.batch_size).shuffled(settings.seed);

    let network = DenseNet::new(&settings.layers, settings.seed)?;
    let operator = Operator::builder(settings.workers)
        .trainer_name("linreg")
        .build(
            Box::new(network),
            Box::new(GradientDescent::new(settings.learning_rate)),
            Box::new(iterator),
            Box::new(ThreadWorkerFactory::new(Box::new(MseStep))),
        );

    operator.attach_local_hook(Arc::new(LossLoggerHook::new(TimeStep::with_interval(
        TimeScale::Iteration,
        NonZeroUsize::new(8).unwrap(),
    ))))?;
    if let Some(decay) = settings.lr_decay {
        // Local: each worker decays its own optimizer copy.
        operator.attach_local_hook(Arc::new(LearningRateDecayHook::new(decay)))?;
    }
    operator.attach_global_hook(Arc::new(ParameterNormHook::new()))?;
    operator.attach_global_hook(Arc::new(StopAfterEpochsHook::new(settings.epochs.get())))?;

    operator.start()?;
    operator.wait_for_state(OperatorState::Stopped);

    info!(
        "training finished: epochs={} highest_iteration={}",
        operator.epoch_number(),
        operator.highest_iteration_number()
    );

    if let Some(network) = operator.network() {
        let network = network.lock();
        if let Some(net) = network.as_any().downcast_ref::<DenseNet>() {
            let prediction = net.forward(&[0.5])[0];
            println!("f(0.5) = {prediction:.4} (expected 2.0)");
        }
    }
    if let Some(norm) = operator.shared_registry().get_as::<f32>("param_norm") {
        println!("final parameter norm: {norm:.4}");
    }
    Ok(())
}

fn demo_settings() -> TrainerSettings {
    TrainerSettings {
        workers: NonZeroUsize::new(2).unwrap(),
        batch_size: NonZeroUsize::new(4).unwrap(),
        epochs: NonZeroUsize::new(20).unwrap(),
        learning_rate: 0.2,
        lr_decay: Some(0.98),
        seed: 7,
        layers: vec![1, 1],
    }
}
