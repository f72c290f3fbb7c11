//! Numeric helpers used when labelling detections.
//!

/// Default number of decimals used for probabilities and scores.
pub const DEFAULT_PRECISION: i32 = 2;

/// Cut `num` down to `precision` decimals, rounding towards negative infinity.
///
/// Values are meant to be printed with `Display`, which yields the shortest
/// representation: `round(30.4, 0)` prints as `30`, `round(0.9, 2)` as `0.9`.
pub fn round(num: f64, precision: i32) -> f64 {
    let factor = 10_f64.powi(precision);
    (num * factor).floor() / factor
}
