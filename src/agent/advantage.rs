//! Advantage estimation utilities.
//!
//! Generalised advantage estimation over one trajectory:
//!
//!   delta_t = r_t + gamma * V(s_{t+1}) - V(s_t)
//!   A_t     = delta_t + gamma * lambda * A_{t+1}
//!
//! The last step of a trajectory is terminal (V = 0 beyond it). Along with
//! batch normalisation of advantages, importance ratios and PPO-style ratio
//! clipping used by the surrogate objective.

/// GAE advantages and the matching value targets (`A_t + V(s_t)`).
///
/// `rewards` and `values` must have the same length.
pub fn compute_gae(rewards: &[f64], values: &[f64], gamma: f64, lambda: f64) -> (Vec<f64>, Vec<f64>) {
    let n = rewards.len().min(values.len());
    let mut advantages = vec![0.0; n];
    let mut gae = 0.0;
    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] } else { 0.0 };
        let delta = rewards[t] + gamma * next_value - values[t];
        gae = delta + gamma * lambda * gae;
        advantages[t] = gae;
    }
    let returns = advantages.iter().zip(values).map(|(a, v)| a + v).collect();
    (advantages, returns)
}

/// Z-score `values` in place.
///
/// Population standard deviation is used. If all values are identical
/// (std = 0) they are all set to 0.0.
pub fn normalize(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    if std < 1e-8 {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    values.iter_mut().for_each(|v| *v = (*v - mean) / std);
}

/// Importance sampling ratio between the current and old policies.
///
///   rho = exp(log pi_theta - log pi_old)
pub fn importance_ratio(current_log_prob: f64, old_log_prob: f64) -> f64 {
    (current_log_prob - old_log_prob).exp()
}

/// Clip an importance ratio to the interval [1 - epsilon, 1 + epsilon].
pub fn clip_ratio(ratio: f64, epsilon: f64) -> f64 {
    ratio.clamp(1.0 - epsilon, 1.0 + epsilon)
}
