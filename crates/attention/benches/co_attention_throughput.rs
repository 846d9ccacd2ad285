use attention::{
    masks::validity_from_lengths, CoAttentionConfig, MultiHeadAttention, MultiHeadConfig,
    ParallelCoAttention,
};
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::Module;

#[derive(Clone, Copy, Debug)]
struct Case {
    batch: usize,
    hidden: usize,
    regions: usize,
    seq_len: usize,
}

fn bench_co_attention(c: &mut Criterion) {
    let device = Device::Cpu;
    let cases = [
        Case { batch: 8, hidden: 256, regions: 49, seq_len: 32 },
        Case { batch: 8, hidden: 768, regions: 170, seq_len: 4 },
        Case { batch: 32, hidden: 768, regions: 170, seq_len: 4 },
    ];

    for dtype in [DType::F32, DType::BF16] {
        let mut group = c.benchmark_group(format!("co_attention/{dtype:?}"));
        for case in cases {
            for mask_in in [false, true] {
                let mut config = CoAttentionConfig::new(case.hidden, 128);
                config.mask_in = mask_in;
                let module = ParallelCoAttention::new(config, &device, dtype).expect("co-attention init");
                let v = Tensor::randn(0f32, 1.0, (case.batch, case.hidden, case.regions), &device)
                    .and_then(|t| t.to_dtype(dtype))
                    .expect("regions");
                let q = Tensor::randn(0f32, 1.0, (case.batch, case.seq_len, case.hidden), &device)
                    .and_then(|t| t.to_dtype(dtype))
                    .expect("sequence");
                let lengths: Vec<usize> = (0..case.batch).map(|b| case.regions - b % case.regions.max(1)).collect();
                let v_mask = validity_from_lengths(&device, &lengths, case.regions).expect("mask");

                let label = format!(
                    "b{}_h{}_r{}_l{}_{}",
                    case.batch,
                    case.hidden,
                    case.regions,
                    case.seq_len,
                    if mask_in { "masked" } else { "plain" }
                );
                group.throughput(Throughput::Elements((case.batch * case.regions * case.seq_len) as u64));
                group.bench_with_input(BenchmarkId::from_parameter(label), &(v, q), |b, (v, q)| {
                    b.iter(|| {
                        let out = module
                            .forward(black_box(v), black_box(q), Some(&v_mask), None)
                            .expect("forward");
                        black_box(out);
                    });
                });
            }
        }
        group.finish();
    }
}

fn bench_multi_head(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("multi_head");
    for seq_len in [32usize, 170] {
        let mha = MultiHeadAttention::new(MultiHeadConfig::new(256, 4), 0, &device, DType::F32)
            .expect("mha init");
        mha.set_training(false);
        let input = Tensor::randn(0f32, 1.0, (8, seq_len, 256), &device).expect("input");
        group.throughput(Throughput::Elements((8 * seq_len) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(seq_len), &input, |b, input| {
            b.iter(|| black_box(mha.forward_self(black_box(input), None).expect("forward")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_co_attention, bench_multi_head);
criterion_main!(benches);
