//! Grid compositing filter graphs
//!
//! The transcoder reads every participant from a single descriptor, so inputs
//! are addressed by stream index: `[0:v:N]` / `[0:a:N]` is participant `N` in
//! descriptor order. The graph ends in one `[voutK]`/`[aoutK]` tap pair per
//! output variant.

use crate::error::{HlsError, Result};

/// Largest room the compositor has a layout for
pub const MAX_PARTICIPANTS: usize = 4;

/// Output canvas, shared by every layout
pub const CANVAS_WIDTH: u32 = 1280;
pub const CANVAS_HEIGHT: u32 = 720;

/// Builds the compositing graph for a given number of participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCompositor {
    outputs: usize,
}

impl LayoutCompositor {
    /// `outputs` is the number of tap pairs the graph must provide
    /// (one per quality tier); zero is treated as one.
    #[must_use]
    pub fn new(outputs: usize) -> Self {
        Self {
            outputs: outputs.max(1),
        }
    }

    #[must_use]
    pub const fn outputs(&self) -> usize {
        self.outputs
    }

    /// Filter graph text for `participants` inputs
    pub fn build(&self, participants: usize) -> Result<String> {
        let mut chains = match participants {
            1 => single(),
            2 => side_by_side(),
            3 => two_over_one(),
            4 => grid(),
            n => return Err(HlsError::UnsupportedLayout(n)),
        };

        let audio = if participants == 1 {
            "0:a:0".to_string()
        } else {
            let inputs: String = (0..participants).map(|i| format!("[0:a:{i}]")).collect();
            chains.push(format!(
                "{inputs}amix=inputs={participants}:duration=longest[atemp]"
            ));
            "atemp".to_string()
        };

        chains.push(self.taps("vtemp", "split", 'v'));
        chains.push(self.taps(&audio, "asplit", 'a'));

        Ok(chains.join(";"))
    }

    /// Fan a composited stream out to the output taps
    fn taps(&self, input: &str, splitter: &str, kind: char) -> String {
        if self.outputs == 1 {
            let passthrough = if kind == 'v' { "null" } else { "anull" };
            return format!("[{input}]{passthrough}[{kind}out0]");
        }
        let labels: String = (0..self.outputs).map(|i| format!("[{kind}out{i}]")).collect();
        format!("[{input}]{splitter}={}{labels}", self.outputs)
    }
}

fn scale(index: usize, width: u32, height: u32) -> String {
    format!("[0:v:{index}]scale={width}:{height}[v{index}]")
}

/// Full canvas passthrough
fn single() -> Vec<String> {
    vec![format!("[0:v:0]scale={CANVAS_WIDTH}:{CANVAS_HEIGHT}[vtemp]")]
}

/// Two half-width columns
fn side_by_side() -> Vec<String> {
    let w = CANVAS_WIDTH / 2;
    vec![
        scale(0, w, CANVAS_HEIGHT),
        scale(1, w, CANVAS_HEIGHT),
        "[v0][v1]hstack[vtemp]".to_string(),
    ]
}

/// Two tiles on top, the third centered below on black padding
///
/// The bottom tile is padded to the width of the top row so `vstack` gets
/// equally wide inputs without stretching the third participant.
fn two_over_one() -> Vec<String> {
    let (w, h) = (CANVAS_WIDTH / 2, CANVAS_HEIGHT / 2);
    vec![
        scale(0, w, h),
        scale(1, w, h),
        scale(2, w, h),
        "[v0][v1]hstack[top]".to_string(),
        format!("[v2]pad={CANVAS_WIDTH}:{h}:(ow-iw)/2:0:black[v2_padded]"),
        "[top][v2_padded]vstack[vtemp]".to_string(),
    ]
}

/// 2x2 grid
fn grid() -> Vec<String> {
    let (w, h) = (CANVAS_WIDTH / 2, CANVAS_HEIGHT / 2);
    vec![
        scale(0, w, h),
        scale(1, w, h),
        scale(2, w, h),
        scale(3, w, h),
        "[v0][v1]hstack[top]".to_string(),
        "[v2][v3]hstack[bottom]".to_string(),
        "[top][bottom]vstack[vtemp]".to_string(),
    ]
}
