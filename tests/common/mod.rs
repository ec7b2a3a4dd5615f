#![allow(dead_code)]

use drcox::{Observation, Sample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};

/// Simulated two-group cohort with one confounder.
///
/// `Z ~ N(0, 1)`, `P(A = 1 | Z) = expit(confounding * Z)`, event hazard
/// `0.1 * exp(beta * A + 0.5 * Z)`, independent exponential censoring with
/// rate 0.05 and administrative censoring at 30.
pub fn simulate_cohort(n: usize, seed: u64, beta: f64, confounding: f64) -> Sample {
    simulate_cohort_with(n, seed, beta, confounding, 0.5)
}

/// As [`simulate_cohort`], with the covariate's log hazard ratio `z_effect`
/// set explicitly. `confounding = 0` and `z_effect = 0` make `Z` pure noise.
pub fn simulate_cohort_with(
    n: usize,
    seed: u64,
    beta: f64,
    confounding: f64,
    z_effect: f64,
) -> Sample {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("normal");
    let censoring = Exp::<f64>::new(0.05).expect("censoring rate");
    let observations: Vec<Observation> = (0..n)
        .map(|_| {
            let z: f64 = normal.sample(&mut rng);
            let p = 1.0 / (1.0 + (-confounding * z).exp());
            let group = u8::from(rng.r#gen::<f64>() < p);
            let rate = 0.1 * (beta * f64::from(group) + z_effect * z).exp();
            let event_time = Exp::new(rate).expect("event rate").sample(&mut rng);
            let censor_time = censoring.sample(&mut rng).min(30.0);
            let event = u8::from(event_time <= censor_time);
            Observation::new(event_time.min(censor_time), event, group, vec![z])
        })
        .collect();
    Sample::from_observations(&observations).expect("simulated sample")
}
