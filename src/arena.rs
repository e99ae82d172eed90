use rand::{Rng, thread_rng};

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;
pub const RADIUS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Duel field geometry. Players are circles of `radius` on a `width` x `height` board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    pub width: u32,
    pub height: u32,
    pub radius: u32,
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            width: WIDTH,
            height: HEIGHT,
            radius: RADIUS,
        }
    }
}

impl Arena {
    /// Random position in `[0, width - radius) x [0, height - radius)`, shifted by `radius / 2`.
    pub fn spawn_point(&self) -> Point {
        let mut rng = thread_rng();

        let x = rng.gen_range(0..self.width.saturating_sub(self.radius).max(1));
        let y = rng.gen_range(0..self.height.saturating_sub(self.radius).max(1));

        Point {
            x: x + self.radius / 2,
            y: y + self.radius / 2,
        }
    }

    /// Inclusive: a shot exactly `radius` away still hits.
    /// Any `u32` shot is accepted; a distance too large for `u64` is a miss.
    pub fn is_hit(&self, shot: Point, target: Point) -> bool {
        let dx = u64::from(shot.x.abs_diff(target.x));
        let dy = u64::from(shot.y.abs_diff(target.y));
        let r = u64::from(self.radius);

        // (2^32 - 1)^2 fits in a u64, only the sum can overflow
        match (dx * dx).checked_add(dy * dy) {
            Some(dist2) => dist2 <= r * r,
            None => false,
        }
    }
}
