//! Evaluation pipeline.
//!
//! [`build_pipeline`] turns a raw layer list into packed [`Operator`]s,
//! propagating slot layouts and checking the total depth against the
//! context's budget before any key or ciphertext exists. [`Inference`] is a
//! single request walking `Idle → Encrypted → Layer(i) → Decryptable → Done`.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::codec::{Kernel, Matrix, SlotLayout, argmax, pack_with_layout, unpack_layout};
use crate::context::Context;
use crate::errors::{EngineError, EngineResult};
use crate::keys::{EvaluationKeys, KeyPair};
use crate::ops::{Activation, ActivationKind, Conv2D, Gemm, Operator};

/// One layer of a model as it comes from the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Conv2D {
        kernel: Kernel,
        bias: Vec<f64>,
        stride: usize,
    },
    Activation {
        kind: ActivationKind,
        lo: f64,
        hi: f64,
        degree: usize,
    },
    Gemm {
        matrix: Matrix,
        bias: Vec<f64>,
    },
}

impl Layer {
    fn name(&self) -> &'static str {
        match self {
            Self::Conv2D { .. } => "conv2d",
            Self::Activation { .. } => "activation",
            Self::Gemm { .. } => "gemm",
        }
    }

    fn pack(&self, input: SlotLayout, batch: usize) -> EngineResult<Operator> {
        Ok(match self {
            Self::Conv2D {
                kernel,
                bias,
                stride,
            } => Operator::Conv2D(Conv2D::new(kernel.clone(), bias, input, *stride, batch)?),
            Self::Activation {
                kind,
                lo,
                hi,
                degree,
            } => Operator::Activation(Activation::new(*kind, *lo, *hi, *degree)?),
            Self::Gemm { matrix, bias } => {
                Operator::Gemm(Gemm::new(matrix.clone(), bias, input, batch)?)
            }
        })
    }
}

/// A packed network bound to one context.
pub struct Pipeline<'c, B: HeBackend> {
    context: &'c Context<B>,
    input_layout: SlotLayout,
    output_layout: SlotLayout,
    operators: Vec<Operator>,
    rotations: BTreeSet<i64>,
    depth: usize,
}

/// Packs every layer once against the layout the previous layer produces.
///
/// Fails with `Layer { index, .. }` wrapping the packing error, or wrapping
/// `DepthExhausted` for the first layer that would overrun the budget.
pub fn build_pipeline<'c, B: HeBackend>(
    context: &'c Context<B>,
    input_layout: SlotLayout,
    layers: Vec<Layer>,
) -> EngineResult<Pipeline<'c, B>> {
    if layers.is_empty() {
        return Err(EngineError::layout("a pipeline needs at least one layer"));
    }
    let batch = context.batch_size();
    let budget = context.depth();
    input_layout.validate(batch)?;

    let mut layout = input_layout;
    let mut level = 0;
    let mut operators = Vec::with_capacity(layers.len());
    let mut rotations = BTreeSet::new();
    for (index, layer) in layers.iter().enumerate() {
        let operator = layer
            .pack(layout, batch)
            .map_err(|e| e.at_layer(index, layer.name()))?;
        let cost = operator.depth_cost();
        if level + cost > budget {
            return Err(EngineError::DepthExhausted {
                level,
                cost,
                budget,
            }
            .at_layer(index, operator.name()));
        }
        level += cost;
        layout = operator.output_layout(&layout);
        rotations.extend(
            operator
                .required_rotations()
                .into_iter()
                .map(|offset| offset.rem_euclid(batch as i64)),
        );
        operators.push(operator);
    }

    info!(
        layers = operators.len(),
        depth = level,
        budget,
        rotations = rotations.len(),
        "pipeline built"
    );
    Ok(Pipeline {
        context,
        input_layout,
        output_layout: layout,
        operators,
        rotations,
        depth: level,
    })
}

impl<'c, B: HeBackend> Pipeline<'c, B> {
    pub fn context(&self) -> &'c Context<B> {
        self.context
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn input_layout(&self) -> &SlotLayout {
        &self.input_layout
    }

    pub fn output_layout(&self) -> &SlotLayout {
        &self.output_layout
    }

    /// Levels the whole network consumes.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Normalised offsets every rotation key set for this network must cover.
    pub fn required_rotations(&self) -> &BTreeSet<i64> {
        &self.rotations
    }

    pub fn session(&self) -> Inference<'_, 'c, B> {
        Inference {
            pipeline: self,
            stage: Stage::Idle,
        }
    }

    /// Encrypts `input`, evaluates every layer and returns the decrypted output.
    pub fn run<R: Rng + ?Sized>(
        &self,
        input: &[f64],
        key_pair: &KeyPair<B>,
        eval_keys: &EvaluationKeys<B>,
        rng: &mut R,
    ) -> EngineResult<Vec<f64>> {
        let mut session = self.session();
        session.encrypt(input, &key_pair.public_key, rng)?;
        while !session.is_evaluated() {
            session.step(eval_keys)?;
        }
        session.decrypt(&key_pair.private_key)?;
        session.extract()
    }

    /// Index of the largest output.
    pub fn classify<R: Rng + ?Sized>(
        &self,
        input: &[f64],
        key_pair: &KeyPair<B>,
        eval_keys: &EvaluationKeys<B>,
        rng: &mut R,
    ) -> EngineResult<usize> {
        let output = self.run(input, key_pair, eval_keys, rng)?;
        argmax(&output).ok_or_else(|| EngineError::layout("network produced no outputs"))
    }
}

impl<B: HeBackend> fmt::Debug for Pipeline<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("input_layout", &self.input_layout)
            .field("output_layout", &self.output_layout)
            .field("operators", &self.operators)
            .field("depth", &self.depth)
            .field("rotations", &self.rotations)
            .finish()
    }
}

enum Stage<B: HeBackend> {
    Idle,
    Encrypted(Ciphertext<B>),
    /// `applied` layers have run.
    Layer {
        applied: usize,
        ciphertext: Ciphertext<B>,
    },
    /// Decrypted slots of the final ciphertext, still in its output layout.
    Decryptable {
        slots: Vec<f64>,
        layout: SlotLayout,
    },
    Done,
    /// A transition failed part way; the session is unusable.
    Poisoned,
}

impl<B: HeBackend> Stage<B> {
    fn describe(&self) -> String {
        match self {
            Self::Idle => "Idle".into(),
            Self::Encrypted(_) => "Encrypted".into(),
            Self::Layer { applied, .. } => format!("Layer({applied})"),
            Self::Decryptable { .. } => "Decryptable".into(),
            Self::Done => "Done".into(),
            Self::Poisoned => "Poisoned".into(),
        }
    }
}

/// One inference request over a [`Pipeline`].
pub struct Inference<'p, 'c, B: HeBackend> {
    pipeline: &'p Pipeline<'c, B>,
    stage: Stage<B>,
}

impl<B: HeBackend> Inference<'_, '_, B> {
    pub fn state(&self) -> String {
        self.stage.describe()
    }

    /// True once every layer has run and the session is waiting on `decrypt`.
    pub fn is_evaluated(&self) -> bool {
        matches!(self.stage, Stage::Layer { applied, .. } if applied == self.pipeline.operators.len())
    }

    fn invalid(&self, to: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            from: self.stage.describe(),
            to,
        }
    }

    /// `Idle → Encrypted`.
    pub fn encrypt<R: Rng + ?Sized>(
        &mut self,
        input: &[f64],
        public_key: &B::PublicKey,
        rng: &mut R,
    ) -> EngineResult<()> {
        if !matches!(self.stage, Stage::Idle) {
            return Err(self.invalid("Encrypted"));
        }
        let context = self.pipeline.context;
        let scale = context.backend().canonical_scale(0);
        let packed = pack_with_layout(
            input,
            self.pipeline.input_layout,
            scale,
            context.batch_size(),
        )?;
        let ciphertext = context.encrypt(&packed, public_key, rng)?;
        self.stage = Stage::Encrypted(ciphertext);
        Ok(())
    }

    /// Applies the next layer: `Encrypted | Layer(i) → Layer(i+1)`.
    pub fn step(&mut self, eval_keys: &EvaluationKeys<B>) -> EngineResult<()> {
        if self.is_evaluated() {
            return Err(self.invalid("Layer"));
        }
        let (applied, ciphertext) = match std::mem::replace(&mut self.stage, Stage::Poisoned) {
            Stage::Encrypted(ciphertext) => (0, ciphertext),
            Stage::Layer {
                applied,
                ciphertext,
            } => (applied, ciphertext),
            other => {
                self.stage = other;
                return Err(self.invalid("Layer"));
            }
        };

        let operator = &self.pipeline.operators[applied];
        let span = info_span!("layer", index = applied, operator = operator.name());
        let _guard = span.enter();
        let started = Instant::now();
        let output = operator
            .apply(&ciphertext, self.pipeline.context.backend(), eval_keys)
            .map_err(|e| e.at_layer(applied, operator.name()))?;
        debug!(
            level = output.level(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            "layer done"
        );

        self.stage = Stage::Layer {
            applied: applied + 1,
            ciphertext: output,
        };
        Ok(())
    }

    /// `Layer(n) → Decryptable`, only once all `n` layers have run.
    pub fn decrypt(&mut self, secret_key: &B::SecretKey) -> EngineResult<()> {
        if !self.is_evaluated() {
            return Err(self.invalid("Decryptable"));
        }
        let Stage::Layer { ciphertext, .. } = &self.stage else {
            return Err(self.invalid("Decryptable"));
        };
        let slots = self.pipeline.context.decrypt(ciphertext, secret_key)?;
        let layout = *ciphertext.layout();
        self.stage = Stage::Decryptable { slots, layout };
        Ok(())
    }

    /// `Decryptable → Done`, gathering the output layout into row-major order.
    pub fn extract(&mut self) -> EngineResult<Vec<f64>> {
        let Stage::Decryptable { slots, layout } = &self.stage else {
            return Err(self.invalid("Done"));
        };
        let values = unpack_layout(slots, layout)?;
        self.stage = Stage::Done;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_evaluation_keys, generate_keys};
    use crate::params::SecurityLevel;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn scale_then_identity() -> Vec<Layer> {
        vec![
            Layer::Gemm {
                matrix: Matrix::from_rows(&[vec![2.0, 0.5], vec![0.0, -1.0]]).unwrap(),
                bias: vec![1.0, 0.5],
            },
            Layer::Activation {
                kind: ActivationKind::Identity,
                lo: -10.0,
                hi: 10.0,
                degree: 1,
            },
        ]
    }

    #[test]
    fn builder_reports_first_layer_over_budget() {
        let ctx: Context = Context::plan(1, 30, 8, SecurityLevel::NotSet).unwrap();
        let mut layers = scale_then_identity();
        layers.push(Layer::Gemm {
            matrix: Matrix::identity(2),
            bias: vec![],
        });
        let err = build_pipeline(&ctx, SlotLayout::vector(2), layers).unwrap_err();
        assert_eq!(err.layer_index(), Some(2));
        assert!(matches!(
            err.root(),
            EngineError::DepthExhausted {
                level: 1,
                cost: 1,
                budget: 1
            }
        ));
    }

    #[test]
    fn builder_collects_normalised_rotations() {
        let ctx: Context = Context::plan(2, 30, 8, SecurityLevel::NotSet).unwrap();
        let pipeline = build_pipeline(&ctx, SlotLayout::vector(2), scale_then_identity()).unwrap();
        assert_eq!(pipeline.depth(), 1);
        assert_eq!(pipeline.output_layout(), &SlotLayout::vector(2));
        let expected: BTreeSet<i64> = [1].into_iter().collect();
        assert_eq!(pipeline.required_rotations(), &expected);
    }

    #[test]
    fn session_walks_every_state() {
        crate::logger::test_init(tracing::metadata::LevelFilter::DEBUG);
        let ctx: Context = Context::plan(1, 30, 8, SecurityLevel::NotSet).unwrap();
        let pipeline = build_pipeline(&ctx, SlotLayout::vector(2), scale_then_identity()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let keys = generate_keys(&ctx, &mut rng).unwrap();
        let eval = generate_evaluation_keys(
            &ctx,
            &keys.private_key,
            pipeline.required_rotations(),
            &mut rng,
        )
        .unwrap();

        let mut session = pipeline.session();
        assert_eq!(session.state(), "Idle");
        assert!(matches!(
            session.step(&eval),
            Err(EngineError::InvalidTransition { .. })
        ));
        session
            .encrypt(&[1.5, 2.0], &keys.public_key, &mut rng)
            .unwrap();
        assert_eq!(session.state(), "Encrypted");
        assert!(matches!(
            session.decrypt(&keys.private_key),
            Err(EngineError::InvalidTransition { .. })
        ));
        session.step(&eval).unwrap();
        assert_eq!(session.state(), "Layer(1)");
        assert!(matches!(
            session.decrypt(&keys.private_key),
            Err(EngineError::InvalidTransition { .. })
        ));
        session.step(&eval).unwrap();
        assert_eq!(session.state(), "Layer(2)");
        assert!(session.is_evaluated());
        assert!(matches!(
            session.extract(),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            session.step(&eval),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(session.state(), "Layer(2)");

        session.decrypt(&keys.private_key).unwrap();
        assert_eq!(session.state(), "Decryptable");
        let out = session.extract().unwrap();
        assert_eq!(session.state(), "Done");
        assert_abs_diff_eq!(out[0], 5.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[1], -1.5, epsilon = 1e-3);
        assert!(matches!(
            session.extract(),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn operator_failure_names_the_layer() {
        let ctx: Context = Context::plan(1, 30, 8, SecurityLevel::NotSet).unwrap();
        let pipeline = build_pipeline(&ctx, SlotLayout::vector(2), scale_then_identity()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let keys = generate_keys(&ctx, &mut rng).unwrap();
        let eval =
            generate_evaluation_keys(&ctx, &keys.private_key, &BTreeSet::new(), &mut rng).unwrap();
        let err = pipeline
            .run(&[1.0, 1.0], &keys, &eval, &mut rng)
            .unwrap_err();
        assert_eq!(err.layer_index(), Some(0));
        assert!(matches!(err.root(), EngineError::MissingRotationKey { .. }));
    }
}
