// Integration tests for blocks and containers
//
// Naming, parameter collection, deferred shape inference through a chain
// and structural save/load.

use gluon::nn::{hybrid, ParamState};
use gluon::prelude::*;

fn two_layer(prefix: &str) -> gluon::Result<HybridSequential> {
    let mut net = HybridSequential::with_prefix(Some(prefix), None);
    {
        let _scope = net.name_scope();
        net.add(Dense::new(3, DenseConfig::default().with_activation(ActivationKind::Tanh))?)?;
        net.add(Dense::new(2, DenseConfig::default())?)?;
    }
    Ok(net)
}

fn batch() -> gluon::Result<NDArray> {
    NDArray::from_f64_slice(&[0.1, 0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8], (2, 4), DType::F32, Context::cpu(0))
}

#[test]
fn test_collect_params_preserves_identity() -> gluon::Result<()> {
    let net = two_layer("net_")?;
    let all = net.collect_params()?;
    assert_eq!(
        all.keys(),
        vec!["net_dense0_weight", "net_dense0_bias", "net_dense1_weight", "net_dense1_bias"]
    );
    for (child_name, dense_prefix) in [("0", "net_dense0_"), ("1", "net_dense1_")] {
        let child = net.core().child_by_name(child_name).expect("child is registered");
        for attr in ["weight", "bias"] {
            let full = format!("{dense_prefix}{attr}");
            let owned = child.params().param(&full).expect("child owns the parameter");
            assert!(all.param(&full).expect("collected").ptr_eq(&owned));
        }
    }
    Ok(())
}

#[test]
fn test_collect_params_matching() -> gluon::Result<()> {
    let net = two_layer("net_")?;
    let weights = net.collect_params_matching(".*weight")?;
    assert_eq!(weights.keys(), vec!["net_dense0_weight", "net_dense1_weight"]);
    Ok(())
}

#[test]
fn test_top_level_blocks_get_unique_names() -> gluon::Result<()> {
    let outer = Sequential::with_prefix(Some("outer_"), None);
    let _scope = outer.name_scope();
    let a = Dense::new(1, DenseConfig::default())?;
    let b = Dense::new(1, DenseConfig::default())?;
    assert_eq!(a.prefix(), "outer_dense0_");
    assert_eq!(b.prefix(), "outer_dense1_");
    Ok(())
}

#[test]
fn test_deferred_init_through_chain() -> gluon::Result<()> {
    let net = two_layer("net_")?;
    net.initialize(InitOptions::new().with_init(Xavier::default()))?;
    let params = net.collect_params()?;
    assert_eq!(params.param("net_dense0_weight").unwrap().state(), ParamState::Deferred);

    let y = net.forward(&batch()?)?;
    assert_eq!(y.dims(), &[2, 2]);
    assert_eq!(params.param("net_dense0_weight").unwrap().shape(), Some(Shape::from((3, 4))));
    assert_eq!(params.param("net_dense1_weight").unwrap().shape(), Some(Shape::from((2, 3))));
    for p in params.values() {
        assert_eq!(p.state(), ParamState::Materialized);
    }
    Ok(())
}

#[test]
fn test_symbol_forward_infers_shapes() -> gluon::Result<()> {
    let net = two_layer("sym_")?;
    let out = hybrid::call(&net, &Symbol::var("data").with_shape((5, 7)))?.into_symbol()?;
    assert_eq!(out.shape(), Some(&Shape::from((5, 2))));
    let w = net.collect_params()?.param("sym_dense0_weight").unwrap();
    assert_eq!(w.shape(), Some(Shape::from((3, 7))));
    Ok(())
}

#[test]
fn test_block_save_load_round_trip() -> gluon::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");

    let net = two_layer("a_")?;
    net.initialize(InitOptions::new().with_init(Uniform::new(0.5)))?;
    let x = batch()?;
    let expected = net.forward(&x)?.to_f64_vec()?;
    net.save_params(&path)?;

    // Structural names do not depend on the prefix.
    let other = two_layer("b_")?;
    other.load_params(&path, &LoadOptions::new())?;
    assert_eq!(other.forward(&x)?.to_f64_vec()?, expected);
    Ok(())
}

#[test]
fn test_flat_file_loads_into_block() -> gluon::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flat.safetensors");

    let net = two_layer("m_")?;
    net.initialize(InitOptions::new().with_init(Constant::new(0.25)))?;
    net.forward(&batch()?)?;
    net.collect_params()?.save(&path, "m_")?;

    let copy = two_layer("m_")?;
    copy.load_params(&path, &LoadOptions::new())?;
    let w = copy.collect_params()?.param("m_dense1_weight").unwrap();
    assert_eq!(w.data(None)?.to_f64_vec()?, vec![0.25; 6]);
    Ok(())
}

#[test]
fn test_shared_params_between_layers() -> gluon::Result<()> {
    let first = Dense::new(2, DenseConfig::default().with_in_units(2).with_prefix("shared_"))?;
    let second = Dense::new(2, DenseConfig::default().with_params(first.params()))?;
    first.initialize(InitOptions::new().with_init(One))?;
    assert!(first.weight().ptr_eq(second.weight()));
    let x = NDArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F32, Context::cpu(0))?;
    assert_eq!(second.forward(&x)?.to_f64_vec()?, vec![2.0, 2.0]);
    Ok(())
}

#[test]
fn test_hybrid_container_rejects_plain_block() -> gluon::Result<()> {
    let mut net = HybridSequential::new();
    let err = net.add(Sequential::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    Ok(())
}
