//! Interpolation.
//!
//! Remote players report discrete positions at the sender's move cadence.
//! The client renders at its own rate and glides each player from where it
//! is currently drawn toward the latest report over a fixed window.

use std::time::Duration;

use sync_shared::math::Vec2;

/// Fixed-duration linear glide toward the latest reported position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glide {
    from: Vec2,
    to: Vec2,
    elapsed: Duration,
    window: Duration,
}

impl Glide {
    /// A glide already resting at `pos`.
    pub fn at(pos: Vec2, window: Duration) -> Self {
        Self {
            from: pos,
            to: pos,
            elapsed: window,
            window,
        }
    }

    /// Starts a new glide from the currently drawn position.
    pub fn retarget(&mut self, to: Vec2) {
        self.from = self.current();
        self.to = to;
        self.elapsed = Duration::ZERO;
    }

    /// Advances by `dt` and returns the new drawn position.
    pub fn advance(&mut self, dt: Duration) -> Vec2 {
        self.elapsed = (self.elapsed + dt).min(self.window);
        self.current()
    }

    pub fn current(&self) -> Vec2 {
        if self.window.is_zero() {
            return self.to;
        }
        let alpha = self.elapsed.as_secs_f32() / self.window.as_secs_f32();
        self.from.lerp(self.to, alpha)
    }

    pub fn target(&self) -> Vec2 {
        self.to
    }

    pub fn is_settled(&self) -> bool {
        self.elapsed >= self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn glide_reaches_target_after_window() {
        let mut g = Glide::at(Vec2::ZERO, WINDOW);
        g.retarget(Vec2::new(10.0, 0.0));
        assert_eq!(g.advance(Duration::from_millis(50)), Vec2::new(5.0, 0.0));
        assert!(!g.is_settled());
        assert_eq!(g.advance(Duration::from_millis(80)), Vec2::new(10.0, 0.0));
        assert!(g.is_settled());
    }

    #[test]
    fn retarget_mid_glide_starts_from_drawn_position() {
        let mut g = Glide::at(Vec2::ZERO, WINDOW);
        g.retarget(Vec2::new(10.0, 0.0));
        g.advance(Duration::from_millis(50));
        g.retarget(Vec2::new(5.0, 10.0));
        assert_eq!(g.current(), Vec2::new(5.0, 0.0));
        assert_eq!(g.advance(WINDOW), Vec2::new(5.0, 10.0));
    }

    #[test]
    fn zero_window_snaps() {
        let mut g = Glide::at(Vec2::ZERO, Duration::ZERO);
        g.retarget(Vec2::new(3.0, 4.0));
        assert_eq!(g.current(), Vec2::new(3.0, 4.0));
    }
}
