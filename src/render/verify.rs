use crate::foundation::math::luma;

/// Luma at or below which a sampled pixel counts as black.
pub const BLACK_LUMA: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Frame was not sampled.
    Skipped,
    Ok,
    Black { run: u32 },
    /// The black run just reached the warning threshold.
    DegradedRun { run: u32 },
}

/// Periodic black-frame sampler.
///
/// Every `every_n`-th frame is sampled on a sparse pixel grid. Consecutive black samples form a
/// run; reaching `threshold` yields one [`FrameVerdict::DegradedRun`] per run.
#[derive(Clone, Debug)]
pub struct BlackFrameDetector {
    every_n: u64,
    stride: usize,
    threshold: u32,
    run: u32,
    frames_seen: u64,
    samples: u64,
    black_samples: u64,
}

impl BlackFrameDetector {
    pub fn new(every_n: u32, stride: usize, threshold: u32) -> Self {
        Self {
            every_n: u64::from(every_n.max(1)),
            stride: stride.max(1),
            threshold: threshold.max(1),
            run: 0,
            frames_seen: 0,
            samples: 0,
            black_samples: 0,
        }
    }

    pub fn observe(&mut self, premul_rgba: &[u8]) -> FrameVerdict {
        let n = self.frames_seen;
        self.frames_seen += 1;
        if n % self.every_n != 0 {
            return FrameVerdict::Skipped;
        }
        self.samples += 1;
        if !is_black(premul_rgba, self.stride) {
            self.run = 0;
            return FrameVerdict::Ok;
        }
        self.black_samples += 1;
        self.run += 1;
        if self.run == self.threshold {
            FrameVerdict::DegradedRun { run: self.run }
        } else {
            FrameVerdict::Black { run: self.run }
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn black_samples(&self) -> u64 {
        self.black_samples
    }
}

/// True when every `stride`-th pixel is (near) black.
pub fn is_black(premul_rgba: &[u8], stride: usize) -> bool {
    premul_rgba
        .chunks_exact(4)
        .step_by(stride.max(1))
        .all(|px| luma(px) <= BLACK_LUMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_sampling_sees_colour() {
        let mut px = [0u8, 0, 0, 255].repeat(100);
        assert!(is_black(&px, 10));
        px[40..44].copy_from_slice(&[200, 200, 200, 255]);
        assert!(!is_black(&px, 10));
    }

    #[test]
    fn run_warns_once_at_threshold() {
        let black = [0u8, 0, 0, 255].repeat(4);
        let mut d = BlackFrameDetector::new(1, 1, 3);
        assert_eq!(d.observe(&black), FrameVerdict::Black { run: 1 });
        assert_eq!(d.observe(&black), FrameVerdict::Black { run: 2 });
        assert_eq!(d.observe(&black), FrameVerdict::DegradedRun { run: 3 });
        assert_eq!(d.observe(&black), FrameVerdict::Black { run: 4 });
        assert_eq!(d.black_samples(), 4);
    }

    #[test]
    fn only_every_nth_frame_is_sampled() {
        let black = [0u8, 0, 0, 255].repeat(4);
        let mut d = BlackFrameDetector::new(10, 1, 3);
        let sampled = (0..25)
            .map(|_| d.observe(&black))
            .filter(|v| *v != FrameVerdict::Skipped)
            .count();
        assert_eq!(sampled, 3);
    }
}
