//! First-order Active Disturbance Rejection Controller with anti-windup.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdrcParams {
    pub b0: f32,
    pub response_s: f32,
    pub n: f32,
    pub m: f32,
}

impl AdrcParams {
    /// Controller bandwidth omega_c = N / response time constant.
    pub fn omega_c(&self) -> f32 {
        self.n / self.response_s
    }

    /// Observer bandwidth omega_o = M * omega_c.
    pub fn omega_o(&self) -> f32 {
        self.m * self.omega_c()
    }

    pub fn is_valid(&self) -> bool {
        self.response_s > 0.0
            && (1.0..=20.0).contains(&self.n)
            && (1.0..=10.0).contains(&self.m)
            && self.b0 > 0.0
    }
}

/// Extended-state-observer controller state: `z1` tracks the plant output,
/// `z2` tracks the estimated total disturbance.
pub struct Adrc {
    params: AdrcParams,
    z1: f32,
    z2: f32,
}

impl Adrc {
    pub fn new(params: AdrcParams) -> Self {
        Adrc { params, z1: 0.0, z2: 0.0 }
    }

    /// Reloads controller parameters. Only called at task start or
    /// controller-on, never mid-iteration.
    pub fn reload(&mut self, params: AdrcParams) {
        self.params = params;
    }

    pub fn reset_to(&mut self, y: f32) {
        self.z1 = y;
        self.z2 = 0.0;
    }

    /// Advances the observer by `dt` seconds and returns the clamped
    /// control output in `[0, u_max]`.
    pub fn iterate(&mut self, y: f32, y_ref: f32, u_max: f32, dt: f32) -> f32 {
        let kp = self.params.omega_c();
        let beta1 = 2.0 * self.params.omega_o();
        let beta2 = self.params.omega_o() * self.params.omega_o();
        let b0 = self.params.b0;

        let e = y_ref - self.z1;
        let u_raw = (kp * e - self.z2) / b0;
        let u = u_raw.clamp(0.0, u_max);

        self.z1 += dt * (b0 * u + self.z2 + beta1 * (y - self.z1));
        self.z2 += dt * beta2 * (y - self.z1);

        u
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> AdrcParams {
        AdrcParams { b0: 1.0, response_s: 5.0, n: 4.0, m: 3.0 }
    }

    #[test]
    fn params_validate_ranges() {
        assert!(default_params().is_valid());
        let mut bad = default_params();
        bad.response_s = 0.0;
        assert!(!bad.is_valid());
    }

    #[test]
    fn reset_to_clears_disturbance_estimate() {
        let mut adrc = Adrc::new(default_params());
        adrc.iterate(10.0, 50.0, 100.0, 0.05);
        adrc.reset_to(20.0);
        assert_eq!(adrc.z1, 20.0);
        assert_eq!(adrc.z2, 0.0);
    }

    #[test]
    fn output_is_clamped_to_u_max() {
        let mut adrc = Adrc::new(default_params());
        let u = adrc.iterate(0.0, 1000.0, 50.0, 0.05);
        assert!(u <= 50.0 && u >= 0.0);
    }

    #[test]
    fn steady_state_tracks_constant_setpoint() {
        let mut adrc = Adrc::new(AdrcParams { b0: 2.0, response_s: 2.0, n: 4.0, m: 3.0 });
        // simple plant: y_{k+1} = y_k + dt * b0 * u (first-order, no real disturbance)
        let mut y = 20.0f32;
        let y_ref = 80.0f32;
        let dt = 0.02;
        for _ in 0..20_000 {
            let u = adrc.iterate(y, y_ref, 100.0, dt);
            y += dt * 2.0 * u;
        }
        assert!((y - y_ref).abs() < 1.0, "y={y} did not converge to {y_ref}");
    }
}
