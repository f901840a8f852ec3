//! Trajectory file parsing.
//!
//! A trial writes one row per control step:
//!
//! ```text
//! t, s_0 .. s_{n-1}, a_0 .. a_{m-1}, r
//! ```
//!
//! Fields are separated by commas and/or whitespace. Header lines (first
//! field not a number) may only precede the data; blank lines are ignored. A
//! file is well-formed when it has at least one row and every row has exactly
//! `n + m + 2` finite fields.

use std::path::Path;

use crate::error::TrialError;

use super::types::Trajectory;

/// Read and validate the trajectory file at `path`.
pub fn read_trajectory(
    path: &Path,
    slot: usize,
    n_states: usize,
    n_actions: usize,
) -> Result<Trajectory, TrialError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TrialError::MissingTrajectory(path.to_path_buf()));
        }
        Err(e) => {
            return Err(TrialError::MalformedTrajectory {
                path: path.to_path_buf(),
                line: 0,
                reason: e.to_string(),
            });
        }
    };
    parse_trajectory(&text, path, slot, n_states, n_actions)
}

fn parse_trajectory(
    text: &str,
    path: &Path,
    slot: usize,
    n_states: usize,
    n_actions: usize,
) -> Result<Trajectory, TrialError> {
    let width = n_states + n_actions + 2;
    let malformed = |line: usize, reason: String| TrialError::MalformedTrajectory {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut trajectory = Trajectory {
        slot,
        times: Vec::new(),
        states: Vec::new(),
        actions: Vec::new(),
        rewards: Vec::new(),
    };

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        match fields.first() {
            None => continue,
            Some(first) if first.parse::<f64>().is_err() => {
                if trajectory.is_empty() {
                    continue;
                }
                return Err(malformed(line_no, format!("unexpected non-numeric row '{}'", line.trim())));
            }
            Some(_) => {}
        }

        if fields.len() != width {
            return Err(malformed(
                line_no,
                format!("expected {width} fields, found {}", fields.len()),
            ));
        }

        let mut values = Vec::with_capacity(width);
        for field in &fields {
            let value: f64 = field
                .parse()
                .map_err(|_| malformed(line_no, format!("'{field}' is not a number")))?;
            if !value.is_finite() {
                return Err(malformed(line_no, format!("non-finite value '{field}'")));
            }
            values.push(value);
        }

        trajectory.times.push(values[0]);
        trajectory.states.push(values[1..=n_states].to_vec());
        trajectory
            .actions
            .push(values[1 + n_states..1 + n_states + n_actions].to_vec());
        trajectory.rewards.push(values[width - 1]);
    }

    if trajectory.is_empty() {
        return Err(malformed(0, "no samples".into()));
    }
    Ok(trajectory)
}
