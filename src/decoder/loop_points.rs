//! Intrinsic loop metadata shared by every decoder that honours it.
//!
//! Frame numbers handed to [`LoopTracker`] are *logical*: they count every
//! frame produced, including repeats, the same way a track's playback position
//! does. The tracker maps them back to source frames.

use crate::properties::Properties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPoints {
    /// First source frame of the loop body
    pub start: u64,
    /// Loop body length in frames
    pub length: u64,
    /// Total plays of the loop body, `-1` for forever
    pub count: i64,
}

impl LoopPoints {
    /// Reads `LOOPSTART` plus `LOOPLENGTH` or `LOOPEND` (exclusive end). An
    /// optional `LOOPCOUNT` limits repetitions.
    pub fn from_properties(props: &Properties, total_frames: Option<u64>) -> Option<Self> {
        let start = u64::try_from(props.number("LOOPSTART")?).ok()?;
        let length = match props.number("LOOPLENGTH") {
            Some(len) => u64::try_from(len).ok()?,
            None => u64::try_from(props.number("LOOPEND")?)
                .ok()?
                .checked_sub(start)?,
        };
        if length == 0 {
            return None;
        }
        if let Some(total) = total_frames {
            if start + length > total {
                log::warn!(
                    "Ignoring loop {}+{} past the end of {} frames",
                    start,
                    length,
                    total
                );
                return None;
            }
        }
        let count = props.number("LOOPCOUNT").filter(|c| *c != 0).unwrap_or(-1);
        Some(Self {
            start,
            length,
            count: count.max(-1),
        })
    }

    pub fn is_infinite(&self) -> bool {
        self.count < 0
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Logical length of content that is `total` source frames long.
    pub fn logical_len(&self, total: u64) -> Option<u64> {
        if self.is_infinite() {
            None
        } else {
            Some(total + (self.count as u64 - 1) * self.length)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    /// Reposition the source at this frame before decoding more
    SeekSource(u64),
}

#[derive(Debug, Clone)]
pub struct LoopTracker {
    points: LoopPoints,
    /// Current iteration, `-1` before the loop or once it has finished
    iteration: i64,
    finished: bool,
    /// Frames produced in the current iteration
    position: u64,
}

impl LoopTracker {
    pub fn new(points: LoopPoints) -> Self {
        Self {
            points,
            iteration: -1,
            finished: false,
            position: 0,
        }
    }

    pub fn points(&self) -> &LoopPoints {
        &self.points
    }

    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    pub fn position_in_iteration(&self) -> u64 {
        self.position
    }

    /// Accounts for a decoded chunk of `frames` frames starting at source
    /// frame `source_frame`. Returns how many frames to keep and whether the
    /// source must jump back to the loop start afterwards.
    pub fn advance(&mut self, source_frame: u64, frames: u64) -> (u64, LoopAction) {
        if self.finished || frames == 0 {
            return (frames, LoopAction::Continue);
        }

        let mut pre_loop = 0;
        if self.iteration < 0 {
            let chunk_end = source_frame + frames;
            if chunk_end <= self.points.start {
                return (frames, LoopAction::Continue);
            }
            // Entering the loop body inside this chunk
            self.iteration = 0;
            pre_loop = self.points.start.saturating_sub(source_frame);
            self.position = source_frame.saturating_sub(self.points.start);
        }

        let remaining = self.points.length - self.position;
        let in_loop = frames - pre_loop;
        if in_loop < remaining {
            self.position += in_loop;
            return (frames, LoopAction::Continue);
        }

        let keep = pre_loop + remaining;
        if self.points.is_infinite() || self.iteration + 1 < self.points.count {
            self.iteration += 1;
            self.position = 0;
            (keep, LoopAction::SeekSource(self.points.start))
        } else {
            // Last pass through the body; play out to real EOF
            self.iteration = -1;
            self.finished = true;
            self.position = 0;
            (frames, LoopAction::Continue)
        }
    }

    /// Re-derives loop state for a logical frame and returns the source frame
    /// to decode from.
    pub fn seek(&mut self, logical: u64) -> u64 {
        let LoopPoints { start, length, .. } = self.points;
        self.finished = false;
        self.position = 0;

        if logical < start {
            self.iteration = -1;
            return logical;
        }

        let iteration = (logical - start) / length;
        let offset = (logical - start) % length;
        if self.points.is_infinite() || (iteration as i64) < self.points.count {
            self.iteration = iteration as i64;
            self.position = offset;
            start + offset
        } else {
            // Past the final iteration
            self.iteration = -1;
            self.finished = true;
            logical - (self.points.count as u64 - 1) * length
        }
    }
}
