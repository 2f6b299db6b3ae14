// Integration tests for parameters, parameter dicts and the scope stacks
//
// These exercise the lifecycle guarantees the rest of the toolkit builds on:
// gradient buffers track grad_req, deferred shapes complete, dict lookups
// are idempotent, persistence round-trips and every scope restores what it
// changed.

use approx::assert_relative_eq;
use gluon::nn::ParamState;
use gluon::prelude::*;
use gluon::NameManager;

fn distinct_2x3() -> Result<NDArray> {
    NDArray::from_f64_slice(&[0.5, -1.25, 2.0, 3.75, -4.5, 6.125], (2, 3), DType::F32, Context::cpu(0))
}

// grad_req and gradient buffers

#[test]
fn test_grad_buffers_follow_grad_req() -> gluon::Result<()> {
    let p = Parameter::new("w", ParamAttrs::new().with_shape((2, 2)));
    p.init(InitOptions::new())?;
    assert_eq!(p.grad_req(), GradReq::Write);
    assert_eq!(p.list_grad()?.len(), 1);

    p.set_grad_req(GradReq::Null)?;
    assert!(matches!(p.grad(None), Err(Error::NullGradient { .. })));
    assert!(p.grad_replicas()?.is_empty());

    p.set_grad_req(GradReq::Add)?;
    let grads = p.list_grad()?;
    assert_eq!(grads.len(), 1);
    assert_eq!(grads[0].to_f64_vec()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn test_null_grad_req_from_creation() -> gluon::Result<()> {
    let p = Parameter::new("frozen", ParamAttrs::new().with_shape(3).with_grad_req(GradReq::Null));
    p.init(InitOptions::new())?;
    assert!(p.list_grad().is_err());
    assert!(p.grad_replicas()?.is_empty());
    Ok(())
}

// Deferred initialization

#[test]
fn test_deferred_shape_completes() -> gluon::Result<()> {
    let p = Parameter::new(
        "fc_weight",
        ParamAttrs::new().with_shape((0, 3)).with_allow_deferred_init(true),
    );
    p.init(InitOptions::new())?;
    assert_eq!(p.state(), ParamState::Deferred);
    assert!(matches!(p.data(None), Err(Error::DeferredInit { .. })));

    p.set_shape((4, 3))?;
    p.finish_deferred_init()?;
    assert_eq!(p.state(), ParamState::Materialized);
    assert_eq!(p.data(None)?.dims(), &[4, 3]);
    Ok(())
}

#[test]
fn test_uninitialized_and_deferred_errors_differ() {
    let never = Parameter::new("a", ParamAttrs::new().with_shape(2));
    let deferred = Parameter::new("b", ParamAttrs::new().with_shape(0).with_allow_deferred_init(true));
    deferred.init(InitOptions::new()).unwrap();
    assert!(matches!(never.data(None), Err(Error::Uninitialized { .. })));
    assert!(matches!(deferred.data(None), Err(Error::DeferredInit { .. })));
}

// ParameterDict

#[test]
fn test_dict_get_is_idempotent() -> gluon::Result<()> {
    let dict = ParameterDict::new("net_");
    let first = dict.get("w", ParamAttrs::new().with_shape((2, 3)))?;
    let second = dict.get("w", ParamAttrs::new().with_shape((2, 3)))?;
    assert!(first.ptr_eq(&second));
    assert_eq!(first.name(), "net_w");

    let err = dict.get("w", ParamAttrs::new().with_shape((3, 3))).unwrap_err();
    assert!(matches!(err, Error::NameConflict { .. }));
    assert_eq!(first.shape(), Some(Shape::from((2, 3))));
    assert_eq!(dict.len(), 1);
    Ok(())
}

#[test]
fn test_shared_dict_lookup() -> gluon::Result<()> {
    let base = ParameterDict::new("enc_");
    let w = base.get("w", ParamAttrs::new().with_shape(4))?;
    let child = ParameterDict::with_shared("enc_", Some(base.clone()));
    assert!(child.get("w", ParamAttrs::new())?.ptr_eq(&w));
    Ok(())
}

#[test]
fn test_dict_save_load_round_trip() -> gluon::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("net.safetensors");

    let dict = ParameterDict::new("net_");
    let w = dict.get("w", ParamAttrs::new().with_shape((2, 3)).with_dtype(DType::F32))?;
    dict.init(InitOptions::new())?;
    w.set_data(&distinct_2x3()?)?;
    dict.save(&path, "")?;

    let restored = ParameterDict::new("net_");
    let w2 = restored.get("w", ParamAttrs::new().with_shape((2, 3)).with_dtype(DType::F32))?;
    restored.load(&path, &LoadOptions::new())?;

    let expected = w.data(None)?.to_f64_vec()?;
    let got = w2.data(None)?.to_f64_vec()?;
    assert_eq!(got.len(), 6);
    for (g, e) in got.iter().zip(&expected) {
        assert_relative_eq!(*g, *e);
    }
    Ok(())
}

#[test]
fn test_load_reports_missing_parameter() -> gluon::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("partial.safetensors");

    let dict = ParameterDict::new("net_");
    dict.get("w", ParamAttrs::new().with_shape(2))?;
    dict.init(InitOptions::new())?;
    dict.save(&path, "")?;

    let bigger = ParameterDict::new("net_");
    bigger.get("w", ParamAttrs::new().with_shape(2))?;
    bigger.get("b", ParamAttrs::new().with_shape(2))?;
    let err = bigger.load(&path, &LoadOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Persistence(ref msg) if msg.contains("net_b")));

    bigger.load(&path, &LoadOptions::new().with_allow_missing(true))?;
    assert_eq!(bigger.param("net_w").unwrap().state(), ParamState::Materialized);
    Ok(())
}

// Scopes

#[test]
fn test_recording_flags_restored_after_error() {
    assert!(!autograd::is_recording());
    assert!(!autograd::is_training());

    let result: gluon::Result<()> = autograd::record(true, || {
        assert!(autograd::is_recording());
        autograd::pause(false, || {
            assert!(!autograd::is_recording());
            Err(Error::msg("inner failure"))
        })
    });

    assert!(result.is_err());
    assert!(!autograd::is_recording());
    assert!(!autograd::is_training());
}

#[test]
fn test_recording_flags_restored_after_panic() {
    let outcome = std::panic::catch_unwind(|| {
        autograd::record(true, || autograd::pause(true, || panic!("inner panic")))
    });
    assert!(outcome.is_err());
    assert!(!autograd::is_recording());
    assert!(!autograd::is_training());
}

#[test]
fn test_name_manager_counters() {
    let names = NameManager::new();
    assert_eq!(names.get(None, "bar"), "bar0");
    assert_eq!(names.get(None, "bar"), "bar1");
    assert_eq!(names.get(None, "baz"), "baz0");
    assert_eq!(names.get(Some("explicit"), "bar"), "explicit");
    assert_eq!(names.get(None, "bar"), "bar2");
}
