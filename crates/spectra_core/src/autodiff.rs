use crate::traits::{CostFunction, DynamicsModel};
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Forward-mode dual number `val + eps * ε` with `ε² = 0`. Evaluating a
/// model on duals carries one directional derivative alongside the value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // Derivative of rem is tricky, usually just rem of val.
        Self::new(self.val % rhs.val, 0.0)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(|v| Self::new(v, 0.0))
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::new(n as f64, 0.0))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::new(n as f64, 0.0))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::new(n, 0.0))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(|v| Self::new(v, 0.0))
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::new(f64::NAN, 0.0)
    }
    fn infinity() -> Self {
        Self::new(f64::INFINITY, 0.0)
    }
    fn neg_infinity() -> Self {
        Self::new(f64::NEG_INFINITY, 0.0)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::new(f64::MIN, 0.0)
    }
    fn min_positive_value() -> Self {
        Self::new(f64::MIN_POSITIVE, 0.0)
    }
    fn max_value() -> Self {
        Self::new(f64::MAX, 0.0)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::new(self.val.floor(), 0.0)
    }
    fn ceil(self) -> Self {
        Self::new(self.val.ceil(), 0.0)
    }
    fn round(self) -> Self {
        Self::new(self.val.round(), 0.0)
    }
    fn trunc(self) -> Self {
        Self::new(self.val.trunc(), 0.0)
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
    fn signum(self) -> Self {
        Self::new(self.val.signum(), 0.0)
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        let val_pow = self.val.powi(n);
        Self::new(val_pow, (n as f64) * self.val.powi(n - 1) * self.eps)
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x))
        let val_pow = self.val.powf(n.val);
        let eps_new = val_pow * (n.eps * self.val.ln() + n.val * self.eps / self.val);
        Self::new(val_pow, eps_new)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.eps / (2.0 * s))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        Self::new(e, e * self.eps)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        Self::new(e, e * std::f64::consts::LN_2 * self.eps)
    }
    fn ln(self) -> Self {
        Self::new(self.val.ln(), self.eps / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        Self::new(self.val.log2(), self.eps / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        Self::new(self.val.log10(), self.eps / (self.val * std::f64::consts::LN_10))
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        Self::new(c, self.eps / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }

    fn sin(self) -> Self {
        Self::new(self.val.sin(), self.eps * self.val.cos())
    }
    fn cos(self) -> Self {
        Self::new(self.val.cos(), -self.eps * self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        Self::new(t, self.eps * (1.0 + t * t))
    }
    fn asin(self) -> Self {
        Self::new(self.val.asin(), self.eps / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        Self::new(self.val.acos(), -self.eps / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        Self::new(self.val.atan(), self.eps / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        // self = y, other = x
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        Self::new(self.val.exp_m1(), self.val.exp() * self.eps)
    }
    fn ln_1p(self) -> Self {
        Self::new(self.val.ln_1p(), self.eps / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        Self::new(self.val.sinh(), self.eps * self.val.cosh())
    }
    fn cosh(self) -> Self {
        Self::new(self.val.cosh(), self.eps * self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        Self::new(t, self.eps * (1.0 - t * t))
    }
    fn asinh(self) -> Self {
        Self::new(self.val.asinh(), self.eps / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        Self::new(self.val.acosh(), self.eps / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        Self::new(self.val.atanh(), self.eps / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

impl Dual {
    /// An independent variable: derivative seed of one.
    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }

    /// A constant: derivative seed of zero.
    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }
}

// --- Model and cost derivatives ---

/// Value and partial derivatives of `f(x, u, p)` at one point.
/// Every block is row-major with one row per state derivative.
#[derive(Debug, Clone)]
pub struct ModelJacobian {
    pub value: Vec<f64>,
    pub d_state: Vec<f64>,
    pub d_control: Vec<f64>,
    pub d_param: Vec<f64>,
}

/// Computes the model Jacobian column by column, seeding one input at a time.
///
/// Costs `dimx + dimu + dimp` dual evaluations; acceptable for the small
/// per-node blocks the transcription needs.
pub fn model_jacobian<M>(model: &M, x: &[f64], u: &[f64], p: &[f64]) -> ModelJacobian
where
    M: DynamicsModel<Dual> + ?Sized,
{
    let nx = x.len();
    let nu = u.len();
    let np = p.len();

    let mut dual_x: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_u: Vec<Dual> = u.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_p: Vec<Dual> = p.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_out = vec![Dual::zero(); nx];

    let mut jac = ModelJacobian {
        value: vec![0.0; nx],
        d_state: vec![0.0; nx * nx],
        d_control: vec![0.0; nx * nu],
        d_param: vec![0.0; nx * np],
    };

    model.apply(&dual_x, &dual_u, &dual_p, &mut dual_out);
    for i in 0..nx {
        jac.value[i] = dual_out[i].val;
    }

    for j in 0..nx {
        dual_x[j].eps = 1.0;
        model.apply(&dual_x, &dual_u, &dual_p, &mut dual_out);
        dual_x[j].eps = 0.0;
        for i in 0..nx {
            jac.d_state[i * nx + j] = dual_out[i].eps;
        }
    }
    for j in 0..nu {
        dual_u[j].eps = 1.0;
        model.apply(&dual_x, &dual_u, &dual_p, &mut dual_out);
        dual_u[j].eps = 0.0;
        for i in 0..nx {
            jac.d_control[i * nu + j] = dual_out[i].eps;
        }
    }
    for j in 0..np {
        dual_p[j].eps = 1.0;
        model.apply(&dual_x, &dual_u, &dual_p, &mut dual_out);
        dual_p[j].eps = 0.0;
        for i in 0..nx {
            jac.d_param[i * np + j] = dual_out[i].eps;
        }
    }

    jac
}

/// Value and gradient of a pointwise cost with respect to the state argument.
pub fn cost_gradient<C>(cost: &C, state: &[f64], sample: &[f64]) -> (f64, Vec<f64>)
where
    C: CostFunction<Dual> + ?Sized,
{
    let mut dual_x: Vec<Dual> = state.iter().map(|&v| Dual::constant(v)).collect();
    let value = cost.evaluate(&dual_x, sample).val;
    let mut grad = vec![0.0; state.len()];
    for j in 0..state.len() {
        dual_x[j].eps = 1.0;
        grad[j] = cost.evaluate(&dual_x, sample).eps;
        dual_x[j].eps = 0.0;
    }
    (value, grad)
}

/// Hessian of a pointwise cost by central differences of its dual gradient.
/// Row-major, symmetrised.
pub fn cost_hessian<C>(cost: &C, state: &[f64], sample: &[f64]) -> Vec<f64>
where
    C: CostFunction<Dual> + ?Sized,
{
    let n = state.len();
    let mut hess = vec![0.0; n * n];
    let mut probe = state.to_vec();
    for j in 0..n {
        let h = 1e-6 * state[j].abs().max(1.0);
        probe[j] = state[j] + h;
        let (_, plus) = cost_gradient(cost, &probe, sample);
        probe[j] = state[j] - h;
        let (_, minus) = cost_gradient(cost, &probe, sample);
        probe[j] = state[j];
        for i in 0..n {
            hess[i * n + j] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (hess[i * n + j] + hess[j * n + i]);
            hess[i * n + j] = avg;
            hess[j * n + i] = avg;
        }
    }
    hess
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ModelDimensions;
    use approx::assert_relative_eq;

    /// dx0/dt = x1 * u0 + p0, dx1/dt = sin(x0)
    struct Toy;

    impl ModelDimensions for Toy {
        fn state_dim(&self) -> usize {
            2
        }
        fn control_dim(&self) -> usize {
            1
        }
        fn parameter_dim(&self) -> usize {
            1
        }
    }

    impl<T: crate::traits::Scalar> DynamicsModel<T> for Toy {
        fn apply(&self, x: &[T], u: &[T], p: &[T], out: &mut [T]) {
            out[0] = x[1] * u[0] + p[0];
            out[1] = x[0].sin();
        }
    }

    struct Squared;

    impl crate::traits::CostDimensions for Squared {
        fn sample_dim(&self) -> usize {
            2
        }
    }

    impl<T: crate::traits::Scalar> CostFunction<T> for Squared {
        fn evaluate(&self, state: &[T], sample: &[f64]) -> T {
            let mut sum = T::zero();
            for (x, y) in state.iter().zip(sample) {
                let e = *x - T::constant(*y);
                sum = sum + e * e * e * e;
            }
            sum
        }
    }

    #[test]
    fn model_jacobian_matches_analytic_partials() {
        let jac = model_jacobian(&Toy, &[0.3, 2.0], &[1.5], &[0.1]);
        assert_relative_eq!(jac.value[0], 3.1, epsilon = 1e-12);
        assert_relative_eq!(jac.value[1], 0.3f64.sin(), epsilon = 1e-12);
        assert_eq!(jac.d_state, vec![0.0, 1.5, 0.3f64.cos(), 0.0]);
        assert_eq!(jac.d_control, vec![2.0, 0.0]);
        assert_eq!(jac.d_param, vec![1.0, 0.0]);
    }

    #[test]
    fn cost_derivatives_match_analytic() {
        let (value, grad) = cost_gradient(&Squared, &[1.0, -1.0], &[0.0, 0.0]);
        assert_relative_eq!(value, 2.0);
        assert_relative_eq!(grad[0], 4.0);
        assert_relative_eq!(grad[1], -4.0);

        let hess = cost_hessian(&Squared, &[1.0, 2.0], &[0.0, 0.0]);
        assert_relative_eq!(hess[0], 12.0, epsilon = 1e-5);
        assert_relative_eq!(hess[3], 48.0, epsilon = 1e-4);
        assert_relative_eq!(hess[1], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn inverse_trig_derivatives() {
        let x = Dual::variable(0.4);
        assert_relative_eq!(x.asin().eps, 1.0 / (1.0 - 0.16f64).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(x.atan().eps, 1.0 / 1.16, epsilon = 1e-12);
        let y = Dual::constant(2.0);
        // d/dx atan2(2, x) = -2 / (4 + x^2)
        assert_relative_eq!(y.atan2(x).eps, -2.0 / 4.16, epsilon = 1e-12);
        assert_relative_eq!(x.tanh().eps, 1.0 - 0.4f64.tanh().powi(2), epsilon = 1e-12);
    }
}
