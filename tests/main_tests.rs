use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use mmfusion::{
    attention::{masks::validity_from_lengths, CoAttentionWeights},
    setup_device, CoAttentionConfig, Module, ParallelCoAttention,
};

fn scenario_inputs(device: &Device) -> Result<(Tensor, Tensor)> {
    let v = Tensor::from_vec(
        vec![0.1f32, -0.4, 0.7, 0.3, 0.9, -0.2, -0.5, 0.2, 0.6, 0.8, -0.1, 0.4],
        (1, 4, 3),
        device,
    )?;
    let q = Tensor::from_vec(vec![0.5f32, -0.3, 0.2, 0.1, -0.6, 0.4, 0.9, -0.7], (1, 2, 4), device)?;
    Ok((v, q))
}

#[test]
fn test_device_setup() {
    std::env::set_var("CANDLE_FORCE_CPU", "1");
    let device = setup_device();
    assert!(matches!(device, Ok(Device::Cpu)));
}

#[test]
fn unmasked_scenario_shapes_and_sums() -> Result<()> {
    let device = Device::Cpu;
    let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2), &device, DType::F32)?;
    let (v, q) = scenario_inputs(&device)?;
    let out = module.forward(&v, &q, None, None)?;

    assert_eq!(out.region_weights.dims(), &[1, 1, 3]);
    assert_eq!(out.sequence_weights.dims(), &[1, 1, 2]);
    assert_eq!(out.pooled_regions.dims(), &[1, 4]);
    assert_eq!(out.pooled_sequence.dims(), &[1, 4]);
    for weights in [&out.region_weights, &out.sequence_weights] {
        let row = weights.flatten_all()?.to_vec1::<f32>()?;
        assert!(row.iter().all(|w| *w >= 0.0));
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn masked_scenario_zeroes_padded_region() -> Result<()> {
    let device = Device::Cpu;
    let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2).with_masking(), &device, DType::F32)?;
    let (v, q) = scenario_inputs(&device)?;
    let v_mask = validity_from_lengths(&device, &[2], 3)?;
    let out = module.forward(&v, &q, Some(&v_mask), None)?;

    let a_v = out.region_weights.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a_v[2], 0.0);
    assert!((a_v[0] + a_v[1] - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn restored_weights_reproduce_outputs() -> Result<()> {
    let device = Device::Cpu;
    let original = ParallelCoAttention::new(CoAttentionConfig::new(4, 2), &device, DType::F32)?;
    let restored = ParallelCoAttention::from_weights(CoAttentionConfig::new(4, 2), original.weights())?;
    let (v, q) = scenario_inputs(&device)?;

    let a = original.forward(&v, &q, None, None)?;
    let b = restored.forward(&v, &q, None, None)?;
    assert_eq!(
        a.pooled_sequence.flatten_all()?.to_vec1::<f32>()?,
        b.pooled_sequence.flatten_all()?.to_vec1::<f32>()?
    );
    assert_eq!(original.parameters().len(), restored.parameters().len());

    let CoAttentionWeights { w_b, .. } = restored.weights();
    assert_eq!(w_b.dims(), &[4, 4]);
    Ok(())
}
