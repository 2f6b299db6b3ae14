// Integration tests for the trainer and SGD
//
// Forward under recording, backward, then step: checks the update math,
// the stale-gradient guard, context consistency and optimizer state
// persistence.

use approx::assert_relative_eq;
use gluon::prelude::*;

fn linear_model(prefix: &str) -> gluon::Result<Dense> {
    let dense = Dense::new(
        1,
        DenseConfig::default()
            .with_in_units(2)
            .with_use_bias(false)
            .with_prefix(prefix),
    )?;
    dense.initialize(InitOptions::new().with_init(One))?;
    Ok(dense)
}

fn input() -> gluon::Result<NDArray> {
    NDArray::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F32, Context::cpu(0))
}

fn forward_backward(model: &Dense, x: &NDArray) -> gluon::Result<()> {
    let loss = autograd::record(true, || model.forward(x)?.sum_all())?;
    loss.backward()
}

fn sgd(learning_rate: f64) -> TrainerConfig {
    TrainerConfig::default().with_optimizer("sgd", SgdConfig::default().with_learning_rate(learning_rate))
}

#[test]
fn test_sgd_step_updates_weights() -> gluon::Result<()> {
    let model = linear_model("lin_")?;
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;
    forward_backward(&model, &input()?)?;
    assert_eq!(model.weight().grad(None)?.to_f64_vec()?, vec![1.0, 2.0]);

    trainer.step(1)?;
    let w = model.weight().data(None)?.to_f64_vec()?;
    assert_relative_eq!(w[0], 0.9, epsilon = 1e-6);
    assert_relative_eq!(w[1], 0.8, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_batch_size_rescales_gradient() -> gluon::Result<()> {
    let model = linear_model("lin_")?;
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;
    forward_backward(&model, &input()?)?;
    trainer.step(2)?;
    let w = model.weight().data(None)?.to_f64_vec()?;
    assert_relative_eq!(w[0], 0.95, epsilon = 1e-6);
    assert_relative_eq!(w[1], 0.9, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_lr_mult_scales_update() -> gluon::Result<()> {
    let model = linear_model("lin_")?;
    model.weight().set_lr_mult(0.0);
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;
    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    assert_eq!(model.weight().data(None)?.to_f64_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_stale_gradient_is_refused() -> gluon::Result<()> {
    let model = linear_model("lin_")?;
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;

    let err = trainer.step(1).unwrap_err();
    assert!(matches!(err, Error::StaleGradient { ref name, .. } if name == "lin_weight"));

    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    // The gradient was consumed by the previous step.
    assert!(matches!(trainer.step(1), Err(Error::StaleGradient { .. })));

    let before = model.weight().data(None)?.to_f64_vec()?;
    trainer.step_with(1, true)?;
    assert_eq!(model.weight().data(None)?.to_f64_vec()?, before);
    Ok(())
}

#[test]
fn test_inconsistent_contexts_fail_at_construction() {
    let a = Parameter::new("a", ParamAttrs::new().with_shape(2));
    let b = Parameter::new("b", ParamAttrs::new().with_shape(2));
    a.init(InitOptions::new().with_contexts(vec![Context::cpu(0)])).unwrap();
    b.init(InitOptions::new().with_contexts(vec![Context::cpu(0), Context::cpu(1)]))
        .unwrap();

    let err = Trainer::from_config(vec![a, b], TrainerConfig::default()).unwrap_err();
    assert!(err.to_string().contains("same ordered list of contexts"));
    match err {
        Error::InconsistentContexts { name, expected, got } => {
            assert_eq!(name, "b");
            assert_ne!(expected, got);
        }
        other => panic!("expected InconsistentContexts, got {other:?}"),
    }
}

#[test]
fn test_uninitialized_parameter_rejected() {
    let p = Parameter::new("never", ParamAttrs::new().with_shape(2));
    let err = Trainer::from_config(vec![p], TrainerConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Uninitialized { .. }));
}

#[test]
fn test_constants_are_skipped() -> gluon::Result<()> {
    let dict = ParameterDict::new("net_");
    let w = dict.get("w", ParamAttrs::new().with_shape(2).with_dtype(DType::F64))?;
    let c = dict.get_constant(
        "c",
        Some(NDArray::from_f64_slice(&[5.0, 5.0], 2, DType::F64, Context::cpu(0))?),
    )?;
    dict.init(InitOptions::new().with_init(One))?;
    let mut trainer = Trainer::from_config(&dict, sgd(1.0))?;

    let x = NDArray::from_f64_slice(&[3.0, 4.0], 2, DType::F64, Context::cpu(0))?;
    let loss = autograd::record(true, || {
        let wx = w.data(None)?.mul(&x)?;
        wx.add(&c.data(None)?)?.sum_all()
    })?;
    loss.backward()?;
    trainer.step(1)?;

    assert_eq!(w.data(None)?.to_f64_vec()?, vec![-2.0, -3.0]);
    assert_eq!(c.data(None)?.to_f64_vec()?, vec![5.0, 5.0]);
    Ok(())
}

#[test]
fn test_multi_context_step_keeps_replicas_in_sync() -> gluon::Result<()> {
    let p = Parameter::new("w", ParamAttrs::new().with_shape(2).with_dtype(DType::F64));
    let contexts = vec![Context::cpu(0), Context::cpu(1)];
    p.init(InitOptions::new().with_init(Zero).with_contexts(contexts.clone()))?;
    let mut trainer = Trainer::from_config(vec![p.clone()], sgd(1.0))?;

    for ctx in &contexts {
        let x = NDArray::from_f64_slice(&[1.0, 2.0], 2, DType::F64, *ctx)?;
        let loss = autograd::record(true, || p.data(Some(*ctx))?.mul(&x)?.sum_all())?;
        loss.backward()?;
    }
    trainer.step(1)?;

    for data in p.list_data()? {
        assert_eq!(data.to_f64_vec()?, vec![-2.0, -4.0]);
    }
    Ok(())
}

#[test]
fn test_learning_rate_round_trip() -> gluon::Result<()> {
    let model = linear_model("lin_")?;
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;
    assert_relative_eq!(trainer.learning_rate(), 0.1);
    trainer.set_learning_rate(0.5)?;
    assert_relative_eq!(trainer.learning_rate(), 0.5);
    Ok(())
}

#[test]
fn test_momentum_states_persist() -> gluon::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("trainer.states");
    let config = TrainerConfig::default().with_optimizer(
        "sgd",
        SgdConfig::default().with_learning_rate(0.1).with_momentum(0.9),
    );

    let model = linear_model("lin_")?;
    let mut trainer = Trainer::from_config(model.collect_params()?, config.clone())?;
    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    trainer.save_states(&path)?;

    // A fresh trainer with the saved momentum continues where the first
    // one stopped.
    let twin = linear_model("twin_")?;
    twin.weight().set_data(&model.weight().data(None)?)?;
    let mut restored = Trainer::from_config(twin.collect_params()?, config)?;
    restored.load_states(&path)?;

    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    forward_backward(&twin, &input()?)?;
    restored.step(1)?;

    let a = model.weight().data(None)?.to_f64_vec()?;
    let b = twin.weight().data(None)?.to_f64_vec()?;
    for (x, y) in a.iter().zip(&b) {
        assert_relative_eq!(*x, *y, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn test_l2_loss_drives_training() -> gluon::Result<()> {
    let model = linear_model("reg_")?;
    let loss_fn = L2Loss::new(LossConfig::default());
    let mut trainer = Trainer::from_config(model.collect_params()?, sgd(0.1))?;
    let x = input()?;
    let label = NDArray::zeros(1, DType::F32, Context::cpu(0))?;

    let loss = autograd::record(true, || loss_fn.loss(&model.forward(&x)?, &label))?;
    // 0.5 * (1 + 2 - 0)²
    assert_relative_eq!(loss.to_f64_vec()?[0], 4.5, epsilon = 1e-6);
    loss.backward()?;
    trainer.step(1)?;
    let w = model.weight().data(None)?.to_f64_vec()?;
    assert_relative_eq!(w[0], 0.7, epsilon = 1e-6);
    assert_relative_eq!(w[1], 0.4, epsilon = 1e-6);

    let after = loss_fn.loss(&model.forward(&x)?, &label)?;
    assert_relative_eq!(after.to_f64_vec()?[0], 1.125, epsilon = 1e-5);
    Ok(())
}

#[test]
fn test_softmax_cross_entropy_gradient_reaches_weights() -> gluon::Result<()> {
    let model = Dense::new(
        2,
        DenseConfig::default().with_in_units(2).with_use_bias(false).with_prefix("cls_"),
    )?;
    model.initialize(InitOptions::new().with_init(Zero))?;
    let loss_fn = SoftmaxCrossEntropyLoss::new(LossConfig::default());
    let x = input()?;
    let label = NDArray::from_f64_slice(&[1.0], 1, DType::F32, Context::cpu(0))?;
    let loss = autograd::record(true, || loss_fn.loss(&model.forward(&x)?, &label)?.sum_all())?;
    loss.backward()?;
    // dL/dlogits = softmax - onehot = [0.5, -0.5], outer product with x.
    let grad = model.weight().grad(None)?.to_f64_vec()?;
    for (g, e) in grad.iter().zip([0.5, 1.0, -0.5, -1.0]) {
        assert_relative_eq!(*g, e, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn test_factor_schedule_through_trainer() -> gluon::Result<()> {
    let model = linear_model("sched_")?;
    let sgd = Sgd::new(SgdConfig::default().with_learning_rate(1.0)).with_lr_scheduler(FactorScheduler::new(1, 0.5)?);
    let mut trainer = Trainer::new(model.collect_params()?, Box::new(sgd), TrainerConfig::default())?;

    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    assert_eq!(model.weight().data(None)?.to_f64_vec()?, vec![0.0, -1.0]);

    forward_backward(&model, &input()?)?;
    trainer.step(1)?;
    assert_eq!(model.weight().data(None)?.to_f64_vec()?, vec![-0.5, -2.0]);
    assert_relative_eq!(trainer.learning_rate(), 0.5);
    assert!(matches!(trainer.set_learning_rate(0.1), Err(Error::InvalidArgument(_))));
    Ok(())
}
