//! Edit expressions: per-pixel arithmetic across sibling sequences.
//!
//! Programs are written in reverse Polish notation. `x`, `y`, `z`, `w` push
//! the sample of the 1st..4th input (`in0`, `in1`, ... for more), numbers push
//! constants, operators pop their operands and push the result:
//!
//! ```text
//! x y -          difference of two sequences
//! x 2 pow y +    square of the first plus the second
//! x y max 0.5 *  half the per-sample maximum
//! ```
//!
//! Inputs must share width and height. Channel counts must match, except that
//! single-channel inputs are broadcast to the widest input.

use std::fmt;
use std::sync::Arc;

use super::image::Image;
use super::provider::{ProviderState, SharedProvider, Step};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
enum Op {
    Input(usize),
    Const(f32),
    Unary(fn(f32) -> f32),
    Binary(fn(f32, f32) -> f32),
    Dup,
    Swap,
}

impl Op {
    /// (operands popped, values pushed)
    fn arity(&self) -> (usize, usize) {
        match self {
            Op::Input(_) | Op::Const(_) => (0, 1),
            Op::Unary(_) => (1, 1),
            Op::Binary(_) => (2, 1),
            Op::Dup => (1, 2),
            Op::Swap => (2, 2),
        }
    }
}

fn parse_token(token: &str) -> Result<Op, String> {
    let op = match token {
        "x" => Op::Input(0),
        "y" => Op::Input(1),
        "z" => Op::Input(2),
        "w" => Op::Input(3),
        "+" => Op::Binary(|a, b| a + b),
        "-" => Op::Binary(|a, b| a - b),
        "*" => Op::Binary(|a, b| a * b),
        "/" => Op::Binary(|a, b| a / b),
        "pow" | "^" => Op::Binary(f32::powf),
        "min" => Op::Binary(f32::min),
        "max" => Op::Binary(f32::max),
        "abs" => Op::Unary(f32::abs),
        "sqrt" => Op::Unary(f32::sqrt),
        "exp" => Op::Unary(f32::exp),
        "log" => Op::Unary(f32::ln),
        "neg" => Op::Unary(|a| -a),
        "dup" => Op::Dup,
        "swap" => Op::Swap,
        _ => {
            if let Some(n) = token.strip_prefix("in") {
                let n = n.parse::<usize>().map_err(|_| format!("unknown token '{}'", token))?;
                Op::Input(n)
            } else {
                let v = token
                    .parse::<f32>()
                    .map_err(|_| format!("unknown token '{}'", token))?;
                Op::Const(v)
            }
        }
    };
    Ok(op)
}

/// Parsed, stack-checked edit program
#[derive(Clone)]
pub struct EditProgram {
    source: Arc<str>,
    ops: Vec<Op>,
    inputs: usize,
}

impl EditProgram {
    pub fn parse(source: &str) -> Result<Self, PipelineError> {
        let mut ops = Vec::new();
        let mut depth = 0usize;
        for token in source.split_whitespace() {
            let op = parse_token(token).map_err(PipelineError::Edit)?;
            let (pops, pushes) = op.arity();
            if depth < pops {
                return Err(PipelineError::Edit(format!(
                    "'{}' needs {} operand(s), stack has {}",
                    token, pops, depth
                )));
            }
            depth = depth - pops + pushes;
            ops.push(op);
        }
        if depth != 1 {
            return Err(PipelineError::Edit(format!(
                "expression must leave exactly one value, leaves {}",
                depth
            )));
        }

        let inputs = ops
            .iter()
            .filter_map(|op| match op {
                Op::Input(i) => Some(i + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        Ok(Self {
            source: Arc::from(source.trim()),
            ops,
            inputs,
        })
    }

    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    /// Number of sibling sequences the program reads
    pub fn inputs_required(&self) -> usize {
        self.inputs
    }

    /// Evaluate over whole images
    pub fn apply(&self, images: &[Arc<Image>]) -> Result<Image, String> {
        let first = images.first().ok_or("edit needs at least one input image")?;
        if images.len() < self.inputs {
            return Err(format!(
                "expression reads {} input(s), got {}",
                self.inputs,
                images.len()
            ));
        }
        let (width, height) = first.resolution();
        let channels = images.iter().map(|i| i.channels()).max().unwrap_or(1);
        for (n, img) in images.iter().enumerate() {
            if img.resolution() != (width, height) {
                return Err(format!(
                    "input {} is {}x{}, expected {}x{}",
                    n,
                    img.width(),
                    img.height(),
                    width,
                    height
                ));
            }
            if img.channels() != channels && img.channels() != 1 {
                return Err(format!(
                    "input {} has {} channels, expected {} or 1",
                    n,
                    img.channels(),
                    channels
                ));
            }
        }

        let mut out = Vec::with_capacity(width * height * channels);
        let mut stack = Vec::with_capacity(self.ops.len());
        for p in 0..width * height {
            for c in 0..channels {
                stack.clear();
                for op in &self.ops {
                    match *op {
                        Op::Input(i) => {
                            let img = &images[i];
                            let ch = if img.channels() == 1 { 0 } else { c };
                            stack.push(img.pixels()[p * img.channels() + ch]);
                        }
                        Op::Const(v) => stack.push(v),
                        Op::Unary(f) => {
                            let a = stack.pop().unwrap_or(f32::NAN);
                            stack.push(f(a));
                        }
                        Op::Binary(f) => {
                            let b = stack.pop().unwrap_or(f32::NAN);
                            let a = stack.pop().unwrap_or(f32::NAN);
                            stack.push(f(a, b));
                        }
                        Op::Dup => {
                            let a = stack.last().copied().unwrap_or(f32::NAN);
                            stack.push(a);
                        }
                        Op::Swap => {
                            let n = stack.len();
                            stack.swap(n - 1, n - 2);
                        }
                    }
                }
                out.push(stack.pop().unwrap_or(f32::NAN));
            }
        }
        Ok(Image::new(out, width, height, channels))
    }
}

impl fmt::Debug for EditProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EditProgram({:?})", self.source)
    }
}

/// Fan-out decoder: drives one child provider per input, then combines.
///
/// Children are ordinary cache providers, so a frame already decoded for
/// plain viewing is reused as-is.
pub struct EditDecoder {
    program: EditProgram,
    children: Vec<SharedProvider>,
}

impl EditDecoder {
    pub fn new(program: EditProgram, children: Vec<SharedProvider>) -> Self {
        Self { program, children }
    }

    pub fn step(&mut self) -> Step {
        if let Some(pending) = self.children.iter().find(|c| !c.is_complete()) {
            pending.advance();
        }

        let mut images = Vec::with_capacity(self.children.len());
        let mut progress = 0.0;
        for (n, child) in self.children.iter().enumerate() {
            match child.state() {
                ProviderState::Failed(msg) => {
                    return Step::Failed(format!("input {} cannot be loaded: {}", n, msg));
                }
                ProviderState::Done(img) => {
                    progress += 1.0;
                    images.push(img);
                }
                other => progress += other.progress(),
            }
        }

        if images.len() < self.children.len() {
            return Step::Progress(progress / self.children.len() as f32);
        }
        match self.program.apply(&images) {
            Ok(img) => Step::Done(img),
            Err(e) => Step::Failed(e),
        }
    }
}
