//! Learning-rate and unsupervised-weight schedules.
//!
//! Both are pure functions of the step with a cursor that the trainer
//! advances once per optimiser step.

use std::f64::consts::PI;

use phoneseg_common::{LrDecay, RampShape};

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// One-cycle warm-up fraction, initial divisor and final divisor.
const ONE_CYCLE_PCT_START: f64 = 0.3;
const ONE_CYCLE_DIV: f64 = 25.0;
const ONE_CYCLE_FINAL_DIV: f64 = 1e4;

/// Learning rate schedule: one-cycle, or warmup → cosine / linear / constant.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_steps: usize,
        max_steps: usize,
        decay: LrDecay,
    ) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Current learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        if self.decay == LrDecay::OneCycle {
            return self.one_cycle_lr();
        }
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        if self.max_steps == 0 || self.decay == LrDecay::None {
            return self.lr;
        }

        let step = step.min(self.max_steps);
        if step <= self.warmup_steps {
            return self.lr;
        }

        let decay_steps = (self.max_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.decay {
            LrDecay::Cosine => cosine_between(self.lr, self.lr_min, progress),
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::None | LrDecay::OneCycle => self.lr,
        }
    }

    fn one_cycle_lr(&self) -> f64 {
        let initial = self.lr / ONE_CYCLE_DIV;
        let floor = initial / ONE_CYCLE_FINAL_DIV;
        let last = self.max_steps.saturating_sub(1) as f64;
        let peak_at = (ONE_CYCLE_PCT_START * self.max_steps as f64 - 1.0).max(0.0);
        let step = (self.step as f64).min(last);
        if step <= peak_at {
            let pct = if peak_at > 0.0 { step / peak_at } else { 1.0 };
            cosine_between(initial, self.lr, pct)
        } else {
            let span = (last - peak_at).max(1.0);
            cosine_between(self.lr, floor, (step - peak_at) / span)
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

/// Cosine interpolation from `start` (pct = 0) to `end` (pct = 1).
fn cosine_between(start: f64, end: f64, pct: f64) -> f64 {
    end + 0.5 * (start - end) * (1.0 + (PI * pct.clamp(0.0, 1.0)).cos())
}

// ── Ramp Scheduler ──────────────────────────────────────────────────────────

/// Weight of the unsupervised consistency loss as a function of the step.
///
/// 0 up to and including `ramp_start`, 1 from `ramp_end` on, and a monotone
/// curve in between that meets both ends continuously.
#[derive(Clone, Debug)]
pub struct RampScheduler {
    max_steps: usize,
    ramp_start: usize,
    ramp_end: usize,
    shape: RampShape,
    cursor: usize,
}

impl RampScheduler {
    pub fn new(max_steps: usize, ramp_start: usize, ramp_end: usize, shape: RampShape) -> Self {
        Self {
            max_steps,
            ramp_start,
            ramp_end: ramp_end.max(ramp_start),
            shape,
            cursor: 0,
        }
    }

    /// Weight at an arbitrary step.
    pub fn value_at(&self, step: usize) -> f64 {
        if step <= self.ramp_start {
            return 0.0;
        }
        if step >= self.ramp_end {
            return 1.0;
        }
        let p = (step - self.ramp_start) as f64 / (self.ramp_end - self.ramp_start) as f64;
        match self.shape {
            RampShape::Linear => p,
            RampShape::Sinusoidal => 0.5 * (1.0 - (PI * p).cos()),
            RampShape::Gaussian => {
                // exp(-5(1-p)^2), shifted and rescaled to hit exactly 0 and 1.
                let floor = (-5.0f64).exp();
                ((-5.0 * (1.0 - p).powi(2)).exp() - floor) / (1.0 - floor)
            }
        }
    }

    /// Weight at the cursor.
    pub fn value(&self) -> f64 {
        self.value_at(self.cursor)
    }

    /// Advance the cursor by one step (saturates at `max_steps`).
    pub fn step(&mut self) {
        self.cursor = (self.cursor + 1).min(self.max_steps);
    }

    pub fn current_step(&self) -> usize {
        self.cursor
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
