//! Fake simulation cases for tests.
//!
//! The cases mimic the OpenFOAM layout the driver relies on: `Allrun.pre`
//! leaves a `seeded` marker, `Allrun` writes a cylinder-sized trajectory
//! (12 pressure sensors, one action) and `system/controlDict` carries the time window.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::agent::network::Mlp;
use crate::agent::PolicyArtifact;
use crate::config::Activation;
use crate::env::SimulationCase;

pub(crate) const CONTROL_DICT: &str = "\
application     pimpleFoam;
startFrom       startTime;
startTime       0;
stopAt          endTime;
endTime         4;
";

/// Rows of a cylinder trajectory: time, 12 pressure sensors, one action, reward.
pub(crate) fn cylinder_rows(steps: usize) -> String {
    let mut rows = String::from("t, p0, p1, p2, p3, p4, p5, p6, p7, p8, p9, p10, p11, omega, reward\n");
    for step in 0..steps {
        let mut fields = vec![format!("{:.3}", 4.0 + 0.01 * step as f64)];
        fields.extend((0..12).map(|i| format!("{:.4}", ((step * 12 + i) as f64 * 0.37).sin())));
        fields.push(format!("{:.3}", 0.5 - 0.2 * step as f64));
        fields.push(format!("{:.3}", -1.0 - 0.1 * step as f64));
        rows.push_str(&fields.join(", "));
        rows.push('\n');
    }
    rows
}

pub(crate) fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A runnable case in `dir`; `prelude` runs in `Allrun` before the
/// trajectory is written.
pub(crate) fn fake_case(dir: &Path, prelude: &str) {
    fs::create_dir_all(dir.join("system")).unwrap();
    fs::write(dir.join("system/controlDict"), CONTROL_DICT).unwrap();
    write_script(&dir.join("Allrun.pre"), "touch seeded\n");
    write_script(
        &dir.join("Allrun"),
        &format!(
            "{prelude}\ncat > trajectory.csv <<'EOF'\n{}EOF\n",
            cylinder_rows(5)
        ),
    );
}

/// A case library under `drl_base` holding one cylinder template.
pub(crate) fn fake_drl_base(drl_base: &Path, prelude: &str) {
    let template = drl_base
        .join("openfoam")
        .join("test_cases")
        .join(SimulationCase::RotatingCylinder2D.as_str());
    fake_case(&template, prelude);
}

/// A cylinder-sized policy with a narrow hidden layer.
pub(crate) fn small_policy() -> PolicyArtifact {
    PolicyArtifact {
        n_states: 12,
        n_actions: 1,
        action_bounds: 5.0,
        network: Mlp::new(&[12, 8, 1], Activation::Tanh, &mut StdRng::seed_from_u64(3)),
        log_std: vec![-0.5],
    }
}
