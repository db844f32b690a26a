pub mod rng;

use std::f64::consts::PI;

use statrs::function::gamma::ln_gamma;

/// Wrap an angle into `[0, 2π)`.
pub fn wrap_angle(a: f64) -> f64 {
    let two_pi = 2.0 * PI;
    let r = a % two_pi;
    if r < 0.0 {
        r + two_pi
    } else {
        r
    }
}

/// Signed angular difference wrapped into `(-π, π]`.
pub fn angle_diff(a: f64, b: f64) -> f64 {
    let mut d = (a - b) % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}

/// Weighted circular mean of `(angle, weight)` pairs, in `[0, 2π)`.
pub fn circular_mean<I: IntoIterator<Item = (f64, f64)>>(angles: I) -> f64 {
    let (mut s, mut c) = (0.0, 0.0);
    for (a, w) in angles {
        s += w * a.sin();
        c += w * a.cos();
    }
    wrap_angle(s.atan2(c))
}

/// Log density of `Normal(mean, stdev)` at `x`.
pub fn log_pdf_normal(x: f64, mean: f64, stdev: f64) -> f64 {
    let z = (x - mean) / stdev;
    -0.5 * (2.0 * PI).ln() - stdev.ln() - 0.5 * z * z
}

/// Log density of a location-scale Student-t with `dof` degrees of freedom.
pub fn log_pdf_student_t(x: f64, mean: f64, scale: f64, dof: f64) -> f64 {
    let z = (x - mean) / scale;
    ln_gamma((dof + 1.0) / 2.0)
        - ln_gamma(dof / 2.0)
        - 0.5 * (dof * PI).ln()
        - scale.ln()
        - (dof + 1.0) / 2.0 * (1.0 + z * z / dof).ln()
}

/// Squared Mahalanobis distance of a scalar Gaussian.
pub fn mahalanobis_sq(x: f64, mean: f64, stdev: f64) -> f64 {
    let z = (x - mean) / stdev;
    z * z
}
