use serde::{Deserialize, Serialize};

use super::vector::VectorCore;
use crate::common::{ConfigError, MatrixCoord};
use crate::tile::{GmTensor, Window};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Activation {
    #[default]
    None,
    Relu,
}

/// `d = act(alpha * acc + bias[col])`, applied by vector cores to accumulator tiles.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Epilogue {
    pub alpha: f32,
    pub bias: Option<Vec<f32>>,
    pub activation: Activation,
}

impl Default for Epilogue {
    fn default() -> Self {
        Epilogue {
            alpha: 1.0,
            bias: None,
            activation: Activation::None,
        }
    }
}

impl Epilogue {
    pub fn validate(&self, n: u32) -> Result<(), ConfigError> {
        match &self.bias {
            Some(bias) if bias.len() != n as usize => Err(ConfigError::BiasLength {
                expected: n,
                actual: bias.len(),
            }),
            _ => Ok(()),
        }
    }

    pub fn apply(&self, acc: f32, col: u32) -> f32 {
        let mut v = self.alpha * acc;
        if let Some(bias) = &self.bias {
            v += bias[col as usize];
        }
        match self.activation {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
        }
    }
}

impl VectorCore {
    /// Apply `epilogue` to `window` of the accumulator workspace `src` and write the result to
    /// `dst` at `dst_origin`. `dst_origin.column` locates the bias.
    pub fn apply_epilogue(
        &mut self,
        epilogue: &Epilogue,
        src: &GmTensor<'_>,
        window: Window,
        dst: &GmTensor<'_>,
        dst_origin: MatrixCoord,
    ) {
        self.stream(src, window, dst, dst_origin, |chunk, at, cols| {
            for (i, v) in chunk.iter_mut().enumerate() {
                let col = dst_origin.column + at.column + i as u32 % cols;
                *v = epilogue.apply(*v, col);
            }
        });
    }
}
