//! The four multi-task variants
//!
//! All of them run LSTM branches over the encoder's per-timestep features and
//! read each task head from the branch's last timestep. Cascaded branches see
//! the encoder features concatenated with the (dropped-out) hidden sequence
//! of the branch feeding them.

use candle_core::{ModuleT, Tensor};
use candle_nn::{linear, lstm, Dropout, LSTMConfig, Linear, Module, VarBuilder, LSTM, RNN};

use super::{Encoder, Mode, MultiTaskModel, TaskOutputs};
use crate::config::SystemParams;
use crate::error::Result;
use crate::training::task::{Task, NUM_TASKS};

/// One LSTM over a feature sequence
#[derive(Debug, Clone)]
struct Branch {
    lstm: LSTM,
}

impl Branch {
    fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lstm: lstm(in_dim, hidden_dim, LSTMConfig::default(), vb)?,
        })
    }

    /// (b, T, in) -> (b, T, hidden)
    fn run(&self, xs: &Tensor) -> Result<Tensor> {
        let states = self.lstm.seq(xs)?;
        Ok(self.lstm.states_to_tensor(&states)?)
    }
}

/// Hidden state at the final timestep, (b, T, H) -> (b, H)
fn last_step(seq: &Tensor) -> Result<Tensor> {
    let steps = seq.dim(1)?;
    Ok(seq.narrow(1, steps - 1, 1)?.squeeze(1)?)
}

fn head_width(task: Task, system: &SystemParams) -> usize {
    match task {
        Task::BsSelection => system.bs_num,
        Task::BeamTracking => system.beam_num,
        Task::UePositioning => 2,
    }
}

fn prefix(task: Task) -> &'static str {
    match task {
        Task::BsSelection => "bs",
        Task::BeamTracking => "bt",
        Task::UePositioning => "up",
    }
}

fn outputs(mut heads: [Option<Tensor>; NUM_TASKS]) -> Result<TaskOutputs> {
    let mut take = |task: Task| {
        heads[task.index()]
            .take()
            .ok_or_else(|| crate::error::Error::internal(format!("{} head produced no output", task)))
    };
    Ok(TaskOutputs {
        bs_logits: take(Task::BsSelection)?,
        beam_logits: take(Task::BeamTracking)?,
        position: take(Task::UePositioning)?,
    })
}

/// Shared encoder, shared LSTM, independent heads
#[derive(Debug, Clone)]
pub struct Vanilla {
    encoder: Encoder,
    branch: Branch,
    heads: [Linear; NUM_TASKS],
    mode: Mode,
}

impl Vanilla {
    pub fn new(system: &SystemParams, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(system, vb.pp("encoder"))?;
        let hidden = system.lstm_feature_num;
        let branch = Branch::new(encoder.out_features(), hidden, vb.pp("lstm"))?;

        let head = |task: Task| {
            linear(
                hidden,
                head_width(task, system),
                vb.pp(format!("{}_head", prefix(task))),
            )
        };
        let heads = [
            head(Task::BsSelection)?,
            head(Task::BeamTracking)?,
            head(Task::UePositioning)?,
        ];

        Ok(Self {
            encoder,
            branch,
            heads,
            mode: Mode::Train,
        })
    }
}

impl MultiTaskModel for Vanilla {
    fn name(&self) -> &str {
        "Vanilla"
    }

    fn forward(&self, history: &Tensor) -> Result<TaskOutputs> {
        let features = self.encoder.forward(history)?;
        let last = last_step(&self.branch.run(&features)?)?;
        Ok(TaskOutputs {
            bs_logits: self.heads[0].forward(&last)?,
            beam_logits: self.heads[1].forward(&last)?,
            position: self.heads[2].forward(&last)?,
        })
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn shared_layer_weight(&self) -> &Tensor {
        self.encoder.shared_weight()
    }
}

/// Three branches chained in a fixed task order
#[derive(Debug, Clone)]
struct SerialCascade {
    encoder: Encoder,
    order: [Task; NUM_TASKS],
    stages: Vec<Branch>,
    /// Indexed by task
    heads: Vec<Linear>,
    dropout: Dropout,
    mode: Mode,
}

impl SerialCascade {
    fn new(order: [Task; NUM_TASKS], system: &SystemParams, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(system, vb.pp("encoder"))?;
        let features = encoder.out_features();
        let hidden = system.lstm_feature_num;

        let mut stages = Vec::with_capacity(NUM_TASKS);
        for (i, task) in order.iter().enumerate() {
            let in_dim = if i == 0 { features } else { features + hidden };
            stages.push(Branch::new(in_dim, hidden, vb.pp(format!("{}_lstm", prefix(*task))))?);
        }

        let heads = Task::ALL
            .iter()
            .map(|&task| {
                linear(
                    hidden,
                    head_width(task, system),
                    vb.pp(format!("{}_head", prefix(task))),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            encoder,
            order,
            stages,
            heads,
            dropout: Dropout::new(dropout as f32),
            mode: Mode::Train,
        })
    }

    fn forward(&self, history: &Tensor) -> Result<TaskOutputs> {
        let features = self.encoder.forward(history)?;
        let train = self.mode.is_train();

        let mut heads: [Option<Tensor>; NUM_TASKS] = Default::default();
        let mut previous: Option<Tensor> = None;
        for (stage, task) in self.stages.iter().zip(self.order) {
            let input = match &previous {
                None => features.clone(),
                Some(seq) => Tensor::cat(&[&features, &self.dropout.forward_t(seq, train)?], 2)?,
            };
            let seq = stage.run(&input)?;
            heads[task.index()] = Some(self.heads[task.index()].forward(&last_step(&seq)?)?);
            previous = Some(seq);
        }

        outputs(heads)
    }
}

macro_rules! serial_cascade_model {
    ($name:ident, $display:literal, $order:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: SerialCascade,
        }

        impl $name {
            pub fn new(system: &SystemParams, dropout: f64, vb: VarBuilder) -> Result<Self> {
                Ok(Self {
                    inner: SerialCascade::new($order, system, dropout, vb)?,
                })
            }
        }

        impl MultiTaskModel for $name {
            fn name(&self) -> &str {
                $display
            }

            fn forward(&self, history: &Tensor) -> Result<TaskOutputs> {
                self.inner.forward(history)
            }

            fn set_mode(&mut self, mode: Mode) {
                self.inner.mode = mode;
            }

            fn mode(&self) -> Mode {
                self.inner.mode
            }

            fn shared_layer_weight(&self) -> &Tensor {
                self.inner.encoder.shared_weight()
            }
        }
    };
}

serial_cascade_model!(
    Bs2bt2Up,
    "Bs2bt2Up",
    [Task::BsSelection, Task::BeamTracking, Task::UePositioning]
);
serial_cascade_model!(
    Up2bt2Bs,
    "Up2bt2Bs",
    [Task::UePositioning, Task::BeamTracking, Task::BsSelection]
);

/// BS and positioning branches in parallel, both feeding the beam branch
///
/// The BS and positioning heads read their own branch's last state together
/// with the beam branch's.
#[derive(Debug, Clone)]
pub struct DualCascaded {
    encoder: Encoder,
    bs_branch: Branch,
    up_branch: Branch,
    bt_branch: Branch,
    bs_head: Linear,
    bt_head: Linear,
    up_head: Linear,
    dropout: Dropout,
    mode: Mode,
}

impl DualCascaded {
    pub fn new(system: &SystemParams, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(system, vb.pp("encoder"))?;
        let features = encoder.out_features();
        let hidden = system.lstm_feature_num;

        Ok(Self {
            bs_branch: Branch::new(features, hidden, vb.pp("bs_lstm"))?,
            up_branch: Branch::new(features, hidden, vb.pp("up_lstm"))?,
            bt_branch: Branch::new(features + 2 * hidden, hidden, vb.pp("bt_lstm"))?,
            bs_head: linear(2 * hidden, system.bs_num, vb.pp("bs_head"))?,
            bt_head: linear(hidden, system.beam_num, vb.pp("bt_head"))?,
            up_head: linear(2 * hidden, 2, vb.pp("up_head"))?,
            dropout: Dropout::new(dropout as f32),
            mode: Mode::Train,
            encoder,
        })
    }
}

impl MultiTaskModel for DualCascaded {
    fn name(&self) -> &str {
        "Dual_Cascaded"
    }

    fn forward(&self, history: &Tensor) -> Result<TaskOutputs> {
        let features = self.encoder.forward(history)?;
        let train = self.mode.is_train();

        let bs_seq = self.bs_branch.run(&features)?;
        let up_seq = self.up_branch.run(&features)?;

        let bt_input = Tensor::cat(
            &[
                &features,
                &self.dropout.forward_t(&bs_seq, train)?,
                &self.dropout.forward_t(&up_seq, train)?,
            ],
            2,
        )?;
        let bt_last = last_step(&self.bt_branch.run(&bt_input)?)?;

        let bs_last = Tensor::cat(&[&last_step(&bs_seq)?, &bt_last], 1)?;
        let up_last = Tensor::cat(&[&last_step(&up_seq)?, &bt_last], 1)?;

        Ok(TaskOutputs {
            bs_logits: self.bs_head.forward(&bs_last)?,
            beam_logits: self.bt_head.forward(&bt_last)?,
            position: self.up_head.forward(&up_last)?,
        })
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn shared_layer_weight(&self) -> &Tensor {
        self.encoder.shared_weight()
    }
}
