/// Constant relative risk aversion utility, scaled so that consuming
/// `floor` is worth -1 and, for `gamma > 1`, unbounded consumption is
/// worth `1 / (gamma - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utility {
    gamma: f64,
    floor: f64,
}

impl Utility {
    pub fn new(gamma: f64, floor: f64) -> Self {
        Self { gamma, floor }
    }

    pub fn utility(&self, consume: f64) -> f64 {
        let c = consume / self.floor;
        if self.gamma == 1.0 {
            c.ln() - 1.0
        } else {
            (1.0 - self.gamma * c.powf(1.0 - self.gamma)) / (self.gamma - 1.0)
        }
    }

    /// Consumption rate whose utility is `utility`.
    pub fn inverse(&self, utility: f64) -> f64 {
        if self.gamma == 1.0 {
            return self.floor * (utility + 1.0).exp();
        }
        let base = (1.0 - utility * (self.gamma - 1.0)) / self.gamma;
        if base <= 0.0 {
            // Above the utility ceiling.
            return f64::INFINITY;
        }
        self.floor * base.powf(1.0 / (1.0 - self.gamma))
    }
}
