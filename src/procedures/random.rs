//! Random Number Procedure
//!
//! Built-in demonstration procedure. Emits one pseudo-random number per iteration,
//! optionally waiting between iterations, and reports progress as it goes.
//!
//! # Parameters
//!
//! | Key | Header name | Kind | Default |
//! |---|---|---|---|
//! | `iterations` | Loop Iterations | integer, 1..=1000000 | 10 |
//! | `delay` | Delay Time | float, s, 0..=10 | 0.0 |
//! | `seed` | Random Seed | text | 12345 |

use super::{Procedure, ProcedureInfo, RunContext};
use crate::metadata::Metadata;
use crate::parameter::Parameter;
use crate::record;
use crate::value::Value;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info};

/// Type identifier written to results headers.
pub const RANDOM_PROCEDURE_TYPE: &str = "RandomProcedure";

/// Emits uniformly distributed random numbers.
#[derive(Debug, Default)]
pub struct RandomProcedure {
    rng: Option<StdRng>,
}

/// Numeric seeds are used as-is, any other text is folded into a number.
fn seed_from_text(seed: &str) -> u64 {
    seed.trim().parse::<u64>().unwrap_or_else(|_| {
        seed.bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
            })
    })
}

impl Procedure for RandomProcedure {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new(RANDOM_PROCEDURE_TYPE)
            .description("Generates random numbers, one per iteration")
            .parameter(
                Parameter::integer("iterations", "Loop Iterations")
                    .range(1.0, 1_000_000.0)
                    .default(10),
            )
            .parameter(
                Parameter::float("delay", "Delay Time")
                    .units("s")
                    .range(0.0, 10.0)
                    .decimals(3)
                    .default(0.0),
            )
            .parameter(Parameter::text("seed", "Random Seed").default("12345"))
            .metadata(Metadata::getter("start_time", "Start Time", |_| {
                Ok(Value::Text(Utc::now().to_rfc3339()))
            }))
            .columns(["Iteration", "Random Number"])
    }

    fn startup(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let seed = ctx.parameters().get_str("seed")?;
        debug!(seed = %seed, "Seeding random number generator");
        self.rng = Some(StdRng::seed_from_u64(seed_from_text(&seed)));
        Ok(())
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let iterations = ctx.parameters().get_i64("iterations")?;
        let delay = Duration::from_secs_f64(ctx.parameters().get_f64("delay")?);
        let rng = self
            .rng
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("random number generator not seeded, startup() did not run"))?;

        info!(iterations, "Starting random number generation");
        for i in 0..iterations {
            ctx.check_stop()?;
            let number: f64 = rng.gen();
            ctx.emit_results(record! { "Iteration" => i, "Random Number" => number })?;
            ctx.emit_progress(100.0 * (i + 1) as f64 / iterations as f64)?;
            ctx.sleep(delay)?;
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        self.rng = None;
        info!("Random number generation finished");
        Ok(())
    }
}
