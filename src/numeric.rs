//! numeric.rs
//! Shared numeric policy: integration, derivative, increment rounding and the
//! fixed-point loop constants. Every evaluation path (tree-walk, closures,
//! specialized program) uses these exact routines so results stay comparable
//! across backends.

/// Nominal width of one integration segment, in currency units.
pub const DEFAULT_INTEGRATION_STEP: f64 = 2_500.0;
pub const MIN_INTEGRATION_SEGMENTS: usize = 8;
pub const MAX_INTEGRATION_SEGMENTS: usize = 256;

/// Step of the left-hand finite difference used for marginal rates.
pub const MIN_DERIVATIVE_STEP: f64 = 1e-4;

pub const FIX_MAX_ITERATIONS: usize = 128;
pub const FIX_RELATIVE_TOLERANCE: f64 = 1e-10;
pub const FIX_ABSOLUTE_TOLERANCE: f64 = 1e-8;
pub const FIX_MIN_BOUND: f64 = -1e12;
pub const FIX_MAX_BOUND: f64 = 1e12;
pub const FIX_NEWTON_MIN_DENOM: f64 = 1e-8;

/// Coerces a final rate to a reportable number: non-finite results become 0
/// instead of leaking NaN/Infinity to callers.
#[inline(always)]
pub fn maybe_finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// NaN falls back; infinities pass through (an open top bound is meaningful).
#[inline(always)]
pub fn nan_or(value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value
    }
}

/// Bounds a fixed-point iterate into a wide but finite range so a divergent
/// update cannot run away before the iteration cap stops it.
#[inline(always)]
pub fn clamp_fix(value: f64) -> f64 {
    let numeric = if value.is_finite() { value } else { 0.0 };
    numeric.clamp(FIX_MIN_BOUND, FIX_MAX_BOUND)
}

/// Midpoint-rule integral of `evaluate` over `[lower, upper]`.
///
/// The segment count targets `DEFAULT_INTEGRATION_STEP` per segment, clamped
/// to `[MIN_INTEGRATION_SEGMENTS, MAX_INTEGRATION_SEGMENTS]`. Rate functions
/// in tax schedules are piecewise-smooth inside a band, so the midpoint rule
/// converges fast there; band edges are handled by the caller splitting the
/// range per arm.
pub fn integrate_midpoint<F: FnMut(f64) -> f64>(mut evaluate: F, lower: f64, upper: f64) -> f64 {
    if !lower.is_finite() || !upper.is_finite() || upper <= lower {
        return 0.0;
    }

    let span = upper - lower;
    let segments = ((span / DEFAULT_INTEGRATION_STEP).ceil() as usize)
        .clamp(MIN_INTEGRATION_SEGMENTS, MAX_INTEGRATION_SEGMENTS);
    let step = span / segments as f64;

    let mut total = 0.0;
    for index in 0..segments {
        let midpoint = lower + (index as f64 + 0.5) * step;
        total += nan_or(evaluate(midpoint), 0.0) * step;
    }
    total
}

/// Left-hand derivative of `evaluate` at `x` (forward difference at `x = 0`).
///
/// The left-hand convention makes the marginal rate at an exact bracket
/// threshold report the band *below* the threshold, matching the closed-form
/// planners.
pub fn derivative_at<F: FnMut(f64) -> f64>(mut evaluate: F, x: f64) -> f64 {
    if !x.is_finite() || x < 0.0 {
        return 0.0;
    }

    let h = MIN_DERIVATIVE_STEP;
    let value_at_x = nan_or(evaluate(x), 0.0);

    if x > 0.0 {
        let lower = (x - h).max(0.0);
        if x <= lower {
            return 0.0;
        }
        let value_at_lower = nan_or(evaluate(lower), 0.0);
        return (value_at_x - value_at_lower) / (x - lower);
    }

    let upper = x + h;
    if upper <= x {
        return 0.0;
    }
    let value_at_upper = nan_or(evaluate(upper), 0.0);
    (value_at_upper - value_at_x) / (upper - x)
}

/// `floor` to a multiple of `increment` (increment 1 is plain floor).
pub fn floor_to_step(value: f64, increment: f64) -> f64 {
    let s = increment.abs();
    if !value.is_finite() || !s.is_finite() || s == 0.0 {
        return value.floor();
    }
    (value / s).floor() * s
}

pub fn ceil_to_step(value: f64, increment: f64) -> f64 {
    let s = increment.abs();
    if !value.is_finite() || !s.is_finite() || s == 0.0 {
        return value.ceil();
    }
    (value / s).ceil() * s
}

pub fn round_to_step(value: f64, increment: f64) -> f64 {
    let s = increment.abs();
    if !value.is_finite() || !s.is_finite() || s == 0.0 {
        return value.round();
    }
    (value / s).round() * s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrate_constant_rate() {
        // A flat 10% rate over [0, 50k] integrates to exactly 5k regardless
        // of how many segments the policy picks.
        let total = integrate_midpoint(|_| 0.10, 0.0, 50_000.0);
        assert!((total - 5_000.0).abs() < 1e-9, "total = {total}");
    }

    #[test]
    fn test_integrate_rejects_degenerate_ranges() {
        assert_eq!(integrate_midpoint(|_| 1.0, 10.0, 10.0), 0.0);
        assert_eq!(integrate_midpoint(|_| 1.0, 10.0, 5.0), 0.0);
        assert_eq!(integrate_midpoint(|_| 1.0, 0.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_derivative_is_left_handed_at_kinks() {
        // f(x) = 0 below 100, then slope 0.5. The left-hand derivative at the
        // kink must report the lower side.
        let f = |x: f64| if x <= 100.0 { 0.0 } else { 0.5 * (x - 100.0) };
        assert!(derivative_at(f, 100.0).abs() < 1e-9);
        assert!((derivative_at(f, 100.1) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_derivative_forward_at_zero() {
        let f = |x: f64| 0.25 * x;
        assert!((derivative_at(f, 0.0) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_round_to_increment() {
        assert_eq!(floor_to_step(1_234.0, 100.0), 1_200.0);
        assert_eq!(ceil_to_step(1_234.0, 100.0), 1_300.0);
        assert_eq!(round_to_step(1_250.0, 100.0), 1_300.0);
        // Zero increment degrades to unit rounding.
        assert_eq!(floor_to_step(1.9, 0.0), 1.0);
    }

    #[test]
    fn test_clamp_fix_bounds_and_nan() {
        assert_eq!(clamp_fix(f64::NAN), 0.0);
        assert_eq!(clamp_fix(1e30), FIX_MAX_BOUND);
        assert_eq!(clamp_fix(-1e30), FIX_MIN_BOUND);
        assert_eq!(clamp_fix(42.0), 42.0);
    }
}
