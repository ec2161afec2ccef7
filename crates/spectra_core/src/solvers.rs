//! Fixed-step explicit integrators used to propagate initial guesses.

use serde::{Deserialize, Serialize};

use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Integrator choice for forward propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrator {
    #[default]
    Rk4,
    Tsit5,
}

/// Classic Runge-Kutta 4th order.
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = T::constant(0.5);
        let sixth = T::constant(1.0 / 6.0);
        let two = T::constant(2.0);
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

// Tsitouras 5(4) tableau. Each row of A sums to its node in C.
const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];
const TSIT5_A: [[f64; 5]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [0.161, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0],
    [2.897153057105493, -6.359448489975075, 4.3622954328695815, 0.0, 0.0],
    [
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
    ],
];
const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436081,
    2.324710524099774,
];

/// Tsitouras 5/4, used here with a fixed step.
pub struct Tsit5<T: Scalar> {
    stages: [Vec<T>; 6],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            stages: std::array::from_fn(|_| vec![T::zero(); dim]),
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;
        for stage in 0..6 {
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (prev, a) in TSIT5_A[stage].iter().enumerate().take(stage) {
                    acc = acc + T::constant(*a) * self.stages[prev][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(
                t0 + T::constant(TSIT5_C[stage]) * dt,
                &self.tmp,
                &mut self.stages[stage],
            );
        }

        for i in 0..state.len() {
            let mut acc = T::zero();
            for (k, b) in TSIT5_B.iter().enumerate() {
                acc = acc + T::constant(*b) * self.stages[k][i];
            }
            state[i] = state[i] + dt * acc;
        }

        *t = t0 + dt;
    }
}

/// Enum dispatch over the concrete steppers.
pub enum Stepper<T: Scalar> {
    Rk4(RK4<T>),
    Tsit5(Tsit5<T>),
}

impl<T: Scalar> Stepper<T> {
    pub fn new(kind: Integrator, dim: usize) -> Self {
        match kind {
            Integrator::Rk4 => Stepper::Rk4(RK4::new(dim)),
            Integrator::Tsit5 => Stepper::Tsit5(Tsit5::new(dim)),
        }
    }
}

impl<T: Scalar> Steppable<T> for Stepper<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        match self {
            Stepper::Rk4(s) => s.step(system, t, state, dt),
            Stepper::Tsit5(s) => s.step(system, t, state, dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// dx/dt = -x, dy/dt = t
    struct Decay;

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[0];
            out[1] = t;
        }
    }

    fn integrate(kind: Integrator, steps: usize) -> (f64, Vec<f64>) {
        let mut stepper = Stepper::new(kind, 2);
        let mut t = 0.0;
        let mut x = vec![1.0, 0.0];
        let dt = 1.0 / steps as f64;
        for _ in 0..steps {
            stepper.step(&Decay, &mut t, &mut x, dt);
        }
        (t, x)
    }

    #[test]
    fn rk4_tracks_exponential_decay() {
        let (t, x) = integrate(Integrator::Rk4, 20);
        assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[0], (-1.0f64).exp(), epsilon = 1e-7);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn tsit5_is_more_accurate_than_rk4_at_equal_steps() {
        let exact = (-1.0f64).exp();
        let (_, rk) = integrate(Integrator::Rk4, 5);
        let (_, ts) = integrate(Integrator::Tsit5, 5);
        assert!((ts[0] - exact).abs() < (rk[0] - exact).abs());
        assert_abs_diff_eq!(ts[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn tsit5_tableau_satisfies_order_conditions() {
        for (row, &c) in TSIT5_A.iter().zip(&TSIT5_C) {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), c, epsilon = 1e-12);
        }
        for power in 0..5 {
            let moment: f64 = TSIT5_B
                .iter()
                .zip(&TSIT5_C)
                .map(|(b, c)| b * c.powi(power))
                .sum();
            assert_abs_diff_eq!(moment, 1.0 / (power + 1) as f64, epsilon = 1e-12);
        }
        let ac: Vec<f64> = TSIT5_A
            .iter()
            .map(|row| row.iter().zip(&TSIT5_C).map(|(a, c)| a * c).sum())
            .collect();
        let bac: f64 = TSIT5_B.iter().zip(&ac).map(|(b, x)| b * x).sum();
        assert_abs_diff_eq!(bac, 1.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn integrator_names_serialize() {
        assert_eq!(serde_json::to_string(&Integrator::Tsit5).unwrap(), "\"tsit5\"");
        assert_eq!(Integrator::default(), Integrator::Rk4);
    }
}
