use std::collections::BTreeSet;
use std::thread;

use approx::assert_abs_diff_eq;
use heaan_infer::{
    ActivationKind, Context, EngineError, Gemm, HeBackend, Kernel, KeyGenError, Layer, Matrix,
    Operator, SecurityLevel, SlotLayout, argmax, build_pipeline, generate_evaluation_keys,
    generate_keys, pack,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

fn affine_network() -> Vec<Layer> {
    vec![
        Layer::Conv2D {
            kernel: Kernel::new(1, 1, 1, 1, vec![2.0]).unwrap(),
            bias: vec![1.0],
            stride: 1,
        },
        Layer::Activation {
            kind: ActivationKind::Identity,
            lo: -10.0,
            hi: 10.0,
            degree: 1,
        },
        Layer::Gemm {
            matrix: Matrix::identity(2),
            bias: vec![0.0, 0.0],
        },
    ]
}

#[test]
fn affine_network_matches_reference() {
    let ctx: Context = Context::plan(2, 20, 4, SecurityLevel::NotSet).unwrap();
    let pipeline = build_pipeline(&ctx, SlotLayout::dense(1, 1, 2), affine_network()).unwrap();
    assert_eq!(pipeline.depth(), 2);
    assert!(pipeline.required_rotations().is_empty());

    let mut rng = ChaCha20Rng::seed_from_u64(2024);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let eval = generate_evaluation_keys(
        &ctx,
        &keys.private_key,
        pipeline.required_rotations(),
        &mut rng,
    )
    .unwrap();

    let out = pipeline.run(&[3.0, 4.0], &keys, &eval, &mut rng).unwrap();
    assert_eq!(out.len(), 2);
    assert_abs_diff_eq!(out[0], 7.0, epsilon = 1e-3);
    assert_abs_diff_eq!(out[1], 9.0, epsilon = 1e-3);
}

#[test]
fn affine_network_at_classic128() {
    let ctx: Context = Context::plan(2, 30, 4, SecurityLevel::Classic128).unwrap();
    let params = ctx.parameters();
    assert_eq!(params.ring_dimension(), 1 << 13);
    assert!(3 * params.hamming_weight() >= 2 * params.ring_dimension() - 2);
    let pipeline = build_pipeline(&ctx, SlotLayout::dense(1, 1, 2), affine_network()).unwrap();

    let mut rng = ChaCha20Rng::seed_from_u64(128);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let eval = generate_evaluation_keys(
        &ctx,
        &keys.private_key,
        pipeline.required_rotations(),
        &mut rng,
    )
    .unwrap();

    let out = pipeline.run(&[3.0, 4.0], &keys, &eval, &mut rng).unwrap();
    assert_abs_diff_eq!(out[0], 7.0, epsilon = 1e-3);
    assert_abs_diff_eq!(out[1], 9.0, epsilon = 1e-3);
}

fn conv_valid(input: &[f64], kernel: &Kernel, size: usize) -> Vec<f64> {
    let out = size - kernel.height + 1;
    let mut values = Vec::new();
    for co in 0..kernel.out_channels {
        for y in 0..out {
            for x in 0..out {
                let mut acc = 0.0;
                for dy in 0..kernel.height {
                    for dx in 0..kernel.width {
                        acc += kernel.weight(co, 0, dy, dx) * input[(y + dy) * size + x + dx];
                    }
                }
                values.push(acc);
            }
        }
    }
    values
}

#[test]
fn small_cnn_classifies_like_plaintext() {
    let kernel = Kernel::new(
        2,
        1,
        3,
        3,
        vec![
            0.2, -0.1, 0.0, 0.3, 0.1, -0.2, 0.0, 0.25, 0.1, //
            -0.3, 0.0, 0.2, 0.1, 0.1, 0.0, 0.2, -0.1, 0.05,
        ],
    )
    .unwrap();
    let rows: Vec<Vec<f64>> = (0..10)
        .map(|i| {
            (0..8)
                .map(|j| ((i * 7 + j * 3) % 11) as f64 * 0.2 - 1.0)
                .collect()
        })
        .collect();
    let layers = vec![
        Layer::Conv2D {
            kernel: kernel.clone(),
            bias: vec![0.1, -0.1],
            stride: 1,
        },
        Layer::Activation {
            kind: ActivationKind::Square,
            lo: -2.0,
            hi: 2.0,
            degree: 2,
        },
        Layer::Gemm {
            matrix: Matrix::from_rows(&rows).unwrap(),
            bias: vec![],
        },
    ];

    let ctx: Context = Context::plan(4, 30, 32, SecurityLevel::NotSet).unwrap();
    let pipeline = build_pipeline(&ctx, SlotLayout::dense(1, 4, 4), layers).unwrap();
    assert_eq!(pipeline.depth(), 4);

    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let eval = generate_evaluation_keys(
        &ctx,
        &keys.private_key,
        pipeline.required_rotations(),
        &mut rng,
    )
    .unwrap();

    let input: Vec<f64> = (0..16).map(|i| ((i * 5) % 9) as f64 / 9.0 - 0.4).collect();
    let hidden: Vec<f64> = conv_valid(&input, &kernel, 4)
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let b = if i < 4 { 0.1 } else { -0.1 };
            (v + b) * (v + b)
        })
        .collect();
    let expected: Vec<f64> = rows
        .iter()
        .map(|r| r.iter().zip(&hidden).map(|(w, h)| w * h).sum())
        .collect();

    let out = pipeline.run(&input, &keys, &eval, &mut rng).unwrap();
    for (got, want) in out.iter().zip(&expected) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-3);
    }
    assert_eq!(argmax(&out), argmax(&expected));
}

#[test]
fn planned_depth_admits_exactly_k_layers() {
    let k = 3;
    let ctx: Context = Context::plan(k, 30, 8, SecurityLevel::NotSet).unwrap();
    assert_eq!(ctx.backend().modulus_chain().len(), k + 1);

    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let eval = generate_evaluation_keys(&ctx, &keys.private_key, &BTreeSet::new(), &mut rng)
        .unwrap();
    let layer = Operator::Gemm(Gemm::new(Matrix::identity(2), &[], SlotLayout::vector(2), 8).unwrap());

    let packed = pack(&[0.5, -1.5], ctx.backend().canonical_scale(0), 8).unwrap();
    let mut ct = ctx.encrypt(&packed, &keys.public_key, &mut rng).unwrap();
    for _ in 0..k {
        ct = layer.apply(&ct, ctx.backend(), &eval).unwrap();
    }
    assert_eq!(ct.level(), k);
    assert_eq!(ct.remaining_depth(ctx.depth()), 0);
    let err = layer.apply(&ct, ctx.backend(), &eval).unwrap_err();
    assert!(matches!(
        err,
        EngineError::DepthExhausted {
            level: 3,
            cost: 1,
            budget: 3
        }
    ));

    let slots = ctx.decrypt(&ct, &keys.private_key).unwrap();
    assert_abs_diff_eq!(slots[0], 0.5, epsilon = 1e-3);
    assert_abs_diff_eq!(slots[1], -1.5, epsilon = 1e-3);
}

#[test]
fn builder_rejects_network_deeper_than_budget() {
    let ctx: Context = Context::plan(1, 20, 4, SecurityLevel::NotSet).unwrap();
    let err = build_pipeline(&ctx, SlotLayout::dense(1, 1, 2), affine_network()).unwrap_err();
    assert_eq!(err.layer_index(), Some(2));
    assert!(matches!(err.root(), EngineError::DepthExhausted { .. }));
}

#[test]
fn rotation_keys_must_cover_the_network() {
    let layers = vec![Layer::Conv2D {
        kernel: Kernel::new(1, 1, 2, 2, vec![1.0, 0.5, -0.5, 0.25]).unwrap(),
        bias: vec![],
        stride: 1,
    }];
    let ctx: Context = Context::plan(1, 30, 16, SecurityLevel::NotSet).unwrap();
    let pipeline = build_pipeline(&ctx, SlotLayout::dense(1, 3, 3), layers).unwrap();
    let required = pipeline.required_rotations().clone();
    let expected: BTreeSet<i64> = [1, 3, 4].into_iter().collect();
    assert_eq!(required, expected);

    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let partial: BTreeSet<i64> = [1, 3].into_iter().collect();
    let eval = generate_evaluation_keys(&ctx, &keys.private_key, &partial, &mut rng).unwrap();
    let input: Vec<f64> = (0..9).map(|v| v as f64).collect();
    let err = pipeline.run(&input, &keys, &eval, &mut rng).unwrap_err();
    assert!(matches!(
        err.root(),
        EngineError::MissingRotationKey { offset: 4 }
    ));

    let eval = generate_evaluation_keys(&ctx, &keys.private_key, &required, &mut rng).unwrap();
    let out = pipeline.run(&input, &keys, &eval, &mut rng).unwrap();
    // Input v = 3y + x, so every output is 1.25 v.
    let expected = [0.0, 1.25, 3.75, 5.0];
    for (got, want) in out.iter().zip(expected) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-3);
    }
}

#[test]
fn second_key_generation_is_refused() {
    let ctx: Context = Context::plan(1, 30, 4, SecurityLevel::NotSet).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    generate_keys(&ctx, &mut rng).unwrap();
    let err = generate_keys(&ctx, &mut rng).unwrap_err();
    assert!(matches!(err, EngineError::KeyGen(KeyGenError::AlreadyGenerated)));
}

#[test]
fn independent_requests_run_concurrently() {
    let ctx: Context = Context::plan(2, 20, 4, SecurityLevel::NotSet).unwrap();
    let pipeline = build_pipeline(&ctx, SlotLayout::dense(1, 1, 2), affine_network()).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(9);
    let keys = generate_keys(&ctx, &mut rng).unwrap();
    let eval = generate_evaluation_keys(
        &ctx,
        &keys.private_key,
        pipeline.required_rotations(),
        &mut rng,
    )
    .unwrap();

    let inputs = [[1.0, 2.0], [-3.0, 0.5], [4.0, -4.0], [0.0, 0.0]];
    let outputs: Vec<Vec<f64>> = thread::scope(|s| {
        let handles: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let (pipeline, keys, eval) = (&pipeline, &keys, &eval);
                s.spawn(move || {
                    let mut rng = ChaCha20Rng::seed_from_u64(100 + i as u64);
                    pipeline.run(input, keys, eval, &mut rng).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (input, out) in inputs.iter().zip(&outputs) {
        assert_abs_diff_eq!(out[0], 2.0 * input[0] + 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[1], 2.0 * input[1] + 1.0, epsilon = 1e-3);
    }
}
